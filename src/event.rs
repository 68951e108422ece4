//! Domain events and the post-commit handler interface.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

/// Metadata key under which the normalized store mirrors an event's global
/// position.
pub const POSITION_KEY: &str = "position";

/// Typed payload carried by an [`Event`].
///
/// Implemented for every `Serialize` type; the payload is persisted as a BSON
/// document. Decoding goes through the [`EventRegistry`](crate::codec::EventRegistry).
pub trait EventData: Any + Send + Sync + fmt::Debug {
    /// Serialize the payload to raw BSON bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, bson::ser::Error>;

    fn as_any(&self) -> &dyn Any;
}

impl<T> EventData for T
where
    T: Serialize + Any + Send + Sync + fmt::Debug,
{
    fn to_bytes(&self) -> Result<Vec<u8>, bson::ser::Error> {
        bson::to_vec(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An immutable domain event belonging to one stream.
#[derive(Clone)]
pub struct Event {
    event_type: String,
    data: Option<Arc<dyn EventData>>,
    timestamp: DateTime<Utc>,
    stream_type: String,
    stream_id: Uuid,
    version: u64,
    metadata: Document,
}

impl Event {
    /// Create an event without payload, timestamped now.
    pub fn new(
        event_type: impl Into<String>,
        stream_type: impl Into<String>,
        stream_id: Uuid,
        version: u64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            data: None,
            timestamp: Utc::now(),
            stream_type: stream_type.into(),
            stream_id,
            version,
            metadata: Document::new(),
        }
    }

    pub fn with_data<T: EventData>(mut self, data: T) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    pub fn with_shared_data(mut self, data: Option<Arc<dyn EventData>>) -> Self {
        self.data = data;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata_document(mut self, metadata: Document) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> Option<&Arc<dyn EventData>> {
        self.data.as_ref()
    }

    /// Downcast the payload to a concrete type.
    pub fn data_as<T: 'static>(&self) -> Option<&T> {
        self.data.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &Document {
        &self.metadata
    }

    /// Global position, present on events read from the normalized store.
    pub fn position(&self) -> Option<u64> {
        match self.metadata.get(POSITION_KEY)? {
            Bson::Int64(n) => u64::try_from(*n).ok(),
            Bson::Int32(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .field("stream_type", &self.stream_type)
            .field("stream_id", &self.stream_id)
            .field("version", &self.version)
            .field("timestamp", &self.timestamp)
            .field("data", &self.data)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({} {})",
            self.event_type, self.version, self.stream_type, self.stream_id
        )
    }
}

/// Error returned by an [`EventHandler`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked once per event after a save commits.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<(), HandlerError>>;
}
