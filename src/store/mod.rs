//! Event stores.
//!
//! Two collection layouts implement the same [`EventStore`] contract:
//! - [`EmbeddedStore`]: one document per stream holding its events. Appends
//!   are a single conditional update; there is no global order.
//! - [`NormalizedStore`]: events and stream summaries in separate
//!   collections, with a `$all` counter assigning every event a global
//!   position inside one transaction. Supports change-feed tailing.
//!
//! Every operation takes an explicit namespace. The empty namespace uses the
//! base collection names; namespace `ns` uses `ns_events`, `ns_streams` and
//! `ns_snapshots`.

mod batch;
pub mod embedded;
mod error;
pub mod normalized;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::EventRegistry;
use crate::config::{Config, Layout, StorageConfig, StorageType, TailConfig};
use crate::driver::{Database, MemoryDatabase, Session};
use crate::event::{Event, EventHandler};

pub use embedded::EmbeddedStore;
pub use error::{BatchViolation, ErrorKind, EventStoreError, Operation, Result};
pub use normalized::{EventSubscription, NormalizedStore, TailedEvent};

/// Base collection names, prefixed per namespace by [`collection_name`].
pub const EVENTS_COLLECTION: &str = "events";
pub const STREAMS_COLLECTION: &str = "streams";
pub const SNAPSHOTS_COLLECTION: &str = "snapshots";

/// Collection name for `base` within `namespace`.
pub fn collection_name(namespace: &str, base: &str) -> String {
    if namespace.is_empty() {
        base.to_string()
    } else {
        format!("{namespace}_{base}")
    }
}

/// Interface for event persistence.
///
/// Implementations:
/// - `EmbeddedStore`: one document per stream
/// - `NormalizedStore`: separate events/streams collections with global order
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch to one stream.
    ///
    /// `original_version` is the stream version the caller last observed
    /// (0 for a new stream). Event versions must run from
    /// `original_version + 1` without gaps. The batch is applied entirely or
    /// not at all.
    async fn save(&self, namespace: &str, events: Vec<Event>, original_version: u64)
        -> Result<()>;

    /// All events of a stream in version order.
    async fn load(&self, namespace: &str, stream_id: Uuid) -> Result<Vec<Event>> {
        self.load_from(namespace, stream_id, 1).await
    }

    /// Events of a stream with version >= `from_version`, in version order.
    async fn load_from(
        &self,
        namespace: &str,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<Event>>;

    /// Summary of a stream.
    async fn stream_info(&self, namespace: &str, stream_id: Uuid) -> Result<StreamInfo>;
}

/// Maintenance operations. Not for use on the hot path.
#[async_trait]
pub trait EventStoreMaintenance: EventStore {
    /// Overwrite the event at `(stream_id, version)` in place.
    async fn replace(&self, namespace: &str, event: Event) -> Result<()>;

    /// Change the type tag of every event tagged `from`.
    async fn rename_event(&self, namespace: &str, from: &str, to: &str) -> Result<()>;

    /// Delete a stream, its events and its snapshots.
    async fn remove(&self, namespace: &str, stream_id: Uuid) -> Result<()>;

    /// Drop everything in the namespace.
    async fn clear(&self, namespace: &str) -> Result<()>;
}

/// Stream summary returned by [`EventStore::stream_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub stream_id: Uuid,
    pub stream_type: String,
    pub version: u64,
    /// Global position of the stream's latest event (normalized layout only).
    pub position: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Options shared by both store layouts.
#[derive(Clone, Default)]
pub struct StoreOptions {
    pub(crate) event_handler: Option<Arc<dyn EventHandler>>,
    pub(crate) namespaces: Vec<String>,
    pub(crate) tail: TailConfig,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler invoked once per event, in order, after each save commits.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Bootstrap `namespace` (indexes, counter) at open, in addition to the
    /// default namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.push(namespace.into());
        self
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces.extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn with_tail_config(mut self, tail: TailConfig) -> Self {
        self.tail = tail;
        self
    }

    /// Default namespace followed by the configured ones, without duplicates.
    pub(crate) fn bootstrap_namespaces(&self) -> Vec<String> {
        let mut namespaces = vec![String::new()];
        for namespace in &self.namespaces {
            if !namespaces.contains(namespace) {
                namespaces.push(namespace.clone());
            }
        }
        namespaces
    }
}

/// Run the post-commit handler over a committed batch.
///
/// Stops at the first failure. The batch stays committed either way.
pub(crate) async fn notify_handler(
    handler: Option<&Arc<dyn EventHandler>>,
    events: Vec<Event>,
) -> Result<()> {
    let Some(handler) = handler else {
        return Ok(());
    };
    for event in events {
        let event_type = event.event_type().to_string();
        let stream_id = event.stream_id();
        let version = event.version();
        if let Err(source) = handler.handle(Arc::new(event)).await {
            error!(
                stream_id = %stream_id,
                version,
                event_type = %event_type,
                error = %source,
                "Event handler failed after commit"
            );
            return Err(EventStoreError::new(
                Operation::Save,
                ErrorKind::Handler {
                    event_type,
                    version,
                    source,
                },
            )
            .with_stream(stream_id)
            .with_version(version));
        }
    }
    Ok(())
}

/// Commit `tx` if `result` is Ok, abort it otherwise.
pub(crate) async fn finish<T>(op: Operation, tx: Box<dyn Session>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| EventStoreError::storage(op, e))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(abort) = tx.abort().await {
                warn!(operation = %op, error = %abort, "Transaction abort failed");
            }
            Err(e)
        }
    }
}

/// Connect the configured storage backend.
pub async fn init_database(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn Database>, Box<dyn std::error::Error>> {
    match config.storage_type {
        StorageType::Memory => {
            info!("Storage: in-memory");
            Ok(Arc::new(MemoryDatabase::new()))
        }
        #[cfg(feature = "mongodb")]
        StorageType::Mongodb => {
            info!(database = %config.mongodb.database, "Storage: mongodb");
            let db = crate::driver::MongoDatabase::connect(
                &config.mongodb.uri,
                &config.mongodb.database,
            )
            .await?;
            Ok(Arc::new(db))
        }
        #[cfg(not(feature = "mongodb"))]
        StorageType::Mongodb => {
            error!("MongoDB storage requested but 'mongodb' feature is not enabled");
            Err("MongoDB feature not enabled".into())
        }
    }
}

/// A store opened from configuration.
#[derive(Clone)]
pub enum ConfiguredStore {
    Embedded(Arc<EmbeddedStore>),
    Normalized(Arc<NormalizedStore>),
}

impl ConfiguredStore {
    pub fn store(&self) -> Arc<dyn EventStoreMaintenance> {
        match self {
            ConfiguredStore::Embedded(store) => store.clone(),
            ConfiguredStore::Normalized(store) => store.clone(),
        }
    }

    /// The normalized store, if that layout is configured. Only it supports
    /// tailing.
    pub fn normalized(&self) -> Option<&Arc<NormalizedStore>> {
        match self {
            ConfiguredStore::Normalized(store) => Some(store),
            ConfiguredStore::Embedded(_) => None,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            ConfiguredStore::Embedded(store) => store.close().await,
            ConfiguredStore::Normalized(store) => store.close().await,
        }
    }
}

/// Open the configured backend and layout.
pub async fn init_store(
    config: &Config,
    registry: Arc<EventRegistry>,
    handler: Option<Arc<dyn EventHandler>>,
) -> std::result::Result<ConfiguredStore, Box<dyn std::error::Error>> {
    let db = init_database(&config.storage).await?;

    let mut options = StoreOptions::new()
        .with_namespaces(config.storage.namespaces.iter().cloned())
        .with_tail_config(config.tail.clone());
    if let Some(handler) = handler {
        options = options.with_event_handler(handler);
    }

    let store = match config.storage.layout {
        Layout::Embedded => {
            ConfiguredStore::Embedded(Arc::new(EmbeddedStore::open(db, registry, options).await?))
        }
        Layout::Normalized => ConfiguredStore::Normalized(Arc::new(
            NormalizedStore::open(db, registry, options).await?,
        )),
    };
    info!(layout = ?config.storage.layout, "Event store ready");
    Ok(store)
}
