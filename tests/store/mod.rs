//! Shared event store contract tests.
//!
//! Tests the EventStore and EventStoreMaintenance interfaces against every
//! layout and driver. Each backend test binary imports these functions and
//! runs them through the runner macros.

pub mod event_store_tests;
pub mod tail_tests;
