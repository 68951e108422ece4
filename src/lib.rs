//! Eventline - event store on a document database
//!
//! Persists event-sourced streams with optimistic concurrency, assigns a
//! global order across streams and tails committed events through a
//! resumable change feed.

pub mod codec;
pub mod config;
pub mod driver;
pub mod event;
pub mod store;
pub mod tail;
pub mod utils;

// Used by `register_event!` expansions in downstream crates.
pub use inventory;

pub use codec::EventRegistry;
pub use event::{Event, EventData, EventHandler, HandlerError};
pub use store::{
    init_store, ConfiguredStore, EmbeddedStore, ErrorKind, EventStore, EventStoreError,
    EventStoreMaintenance, NormalizedStore, StoreOptions, StreamInfo,
};
