//! Record codec.
//!
//! Converts [`Event`]s to and from persisted [`EventRecord`]s. Payloads are
//! opaque BSON blobs on disk; decoding dispatches on `event_type` through an
//! [`EventRegistry`] to rebuild the typed payload.
//!
//! Payload types register themselves at link time with [`register_event!`]:
//!
//! ```ignore
//! #[derive(Debug, Serialize, Deserialize)]
//! struct OrderPlaced { total: i64 }
//!
//! eventline::register_event!(OrderPlaced, "OrderPlaced");
//! ```

mod record;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bson::spec::BinarySubtype;
use bson::Binary;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::event::{Event, EventData};

pub use record::{AggregateRecord, EventRecord, StreamRecord, GLOBAL_STREAM_ID};

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while encoding or decoding events.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Event type '{0}' is not registered")]
    UnregisteredEventType(String),

    #[error("Failed to encode payload of '{event_type}': {source}")]
    Encode {
        event_type: String,
        #[source]
        source: bson::ser::Error,
    },

    #[error("Failed to decode payload of '{event_type}': {source}")]
    Decode {
        event_type: String,
        #[source]
        source: bson::de::Error,
    },

    #[error("Malformed record: {0}")]
    Record(String),
}

/// Constructor turning raw payload bytes into a typed payload.
pub type DecodeFn = fn(&[u8]) -> std::result::Result<Arc<dyn EventData>, bson::de::Error>;

/// Link-time registration of a payload type.
pub struct Registration {
    pub event_type: &'static str,
    pub decode: DecodeFn,
}

impl Registration {
    pub const fn new(event_type: &'static str, decode: DecodeFn) -> Self {
        Self { event_type, decode }
    }
}

inventory::collect!(Registration);

/// Decode raw payload bytes as `T`.
pub fn decode_as<T>(bytes: &[u8]) -> std::result::Result<Arc<dyn EventData>, bson::de::Error>
where
    T: EventData + DeserializeOwned,
{
    Ok(Arc::new(bson::from_slice::<T>(bytes)?))
}

/// Register a payload type under an event type tag at link time.
#[macro_export]
macro_rules! register_event {
    ($ty:ty, $event_type:expr) => {
        $crate::inventory::submit! {
            $crate::codec::Registration::new($event_type, $crate::codec::decode_as::<$ty>)
        }
    };
}

/// Maps event type tags to payload constructors.
pub struct EventRegistry {
    decoders: RwLock<HashMap<String, DecodeFn>>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    /// Registry seeded with every type registered via [`register_event!`].
    pub fn new() -> Self {
        let registry = Self::empty();
        {
            let mut decoders = registry
                .decoders
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for registration in inventory::iter::<Registration> {
                decoders.insert(registration.event_type.to_string(), registration.decode);
            }
        }
        registry
    }

    /// Registry with no registrations.
    pub fn empty() -> Self {
        Self {
            decoders: RwLock::new(HashMap::new()),
        }
    }

    /// Register `T` as the payload type for `event_type`, replacing any
    /// previous registration.
    pub fn register<T>(&self, event_type: impl Into<String>)
    where
        T: EventData + DeserializeOwned,
    {
        self.decoders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.into(), decode_as::<T>);
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(event_type)
    }

    /// Decode a payload. An unregistered tag is an error, never a skip.
    pub fn decode_payload(&self, event_type: &str, bytes: &[u8]) -> Result<Arc<dyn EventData>> {
        let decode = self
            .decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .copied()
            .ok_or_else(|| CodecError::UnregisteredEventType(event_type.to_string()))?;
        decode(bytes).map_err(|source| CodecError::Decode {
            event_type: event_type.to_string(),
            source,
        })
    }

    /// Rebuild an [`Event`] from its persisted record.
    pub fn decode(&self, record: EventRecord) -> Result<Event> {
        let stream_id = Uuid::parse_str(&record.stream_id)
            .map_err(|e| CodecError::Record(format!("invalid stream id {}: {e}", record.stream_id)))?;
        let version = u64::try_from(record.version)
            .map_err(|_| CodecError::Record(format!("negative version {}", record.version)))?;
        let data = match &record.payload {
            Some(payload) => Some(self.decode_payload(&record.event_type, &payload.bytes)?),
            None => None,
        };

        Ok(Event::new(record.event_type, record.stream_type, stream_id, version)
            .with_shared_data(data)
            .with_timestamp(record.timestamp.to_chrono())
            .with_metadata_document(record.metadata))
    }
}

/// Build the persisted record for an event.
pub fn encode(event: &Event) -> Result<EventRecord> {
    let payload = match event.data() {
        Some(data) => {
            let bytes = data.to_bytes().map_err(|source| CodecError::Encode {
                event_type: event.event_type().to_string(),
                source,
            })?;
            Some(Binary {
                subtype: BinarySubtype::Generic,
                bytes,
            })
        }
        None => None,
    };
    let version = i64::try_from(event.version())
        .map_err(|_| CodecError::Record(format!("version {} out of range", event.version())))?;

    Ok(EventRecord {
        position: None,
        event_type: event.event_type().to_string(),
        payload,
        timestamp: bson::DateTime::from_chrono(event.timestamp()),
        stream_type: event.stream_type().to_string(),
        stream_id: event.stream_id().to_string(),
        version,
        metadata: event.metadata().clone(),
    })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemAdded {
        sku: String,
        quantity: i32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct LinkedPayload {
        note: String,
    }

    crate::register_event!(LinkedPayload, "LinkedPayload");

    fn item_added() -> Event {
        Event::new("ItemAdded", "cart", Uuid::new_v4(), 3)
            .with_data(ItemAdded {
                sku: "A-1".to_string(),
                quantity: 2,
            })
            .with_metadata("user", "alice")
    }

    #[test]
    fn test_encode_decode_preserves_event() {
        let registry = EventRegistry::empty();
        registry.register::<ItemAdded>("ItemAdded");

        let event = item_added();
        let decoded = registry.decode(encode(&event).unwrap()).unwrap();

        assert_eq!(decoded.event_type(), "ItemAdded");
        assert_eq!(decoded.stream_id(), event.stream_id());
        assert_eq!(decoded.version(), 3);
        assert_eq!(decoded.metadata().get_str("user").unwrap(), "alice");
        assert_eq!(decoded.data_as::<ItemAdded>(), event.data_as::<ItemAdded>());
        assert_eq!(
            decoded.timestamp().timestamp_millis(),
            event.timestamp().timestamp_millis()
        );
    }

    #[test]
    fn test_unregistered_type_is_an_error() {
        let registry = EventRegistry::empty();
        let err = registry.decode(encode(&item_added()).unwrap()).unwrap_err();
        assert!(matches!(err, CodecError::UnregisteredEventType(t) if t == "ItemAdded"));
    }

    #[test]
    fn test_event_without_payload_needs_no_registration() {
        let registry = EventRegistry::empty();
        let event = Event::new("Closed", "cart", Uuid::new_v4(), 1);
        let decoded = registry.decode(encode(&event).unwrap()).unwrap();
        assert!(decoded.data().is_none());
    }

    #[test]
    fn test_corrupt_payload_names_event_type() {
        let registry = EventRegistry::empty();
        registry.register::<ItemAdded>("ItemAdded");

        let mut record = encode(&item_added()).unwrap();
        record.payload = Some(Binary {
            subtype: BinarySubtype::Generic,
            bytes: vec![1, 2, 3],
        });

        let err = registry.decode(record).unwrap_err();
        assert!(matches!(err, CodecError::Decode { event_type, .. } if event_type == "ItemAdded"));
    }

    #[test]
    fn test_link_time_registration() {
        let registry = EventRegistry::new();
        assert!(registry.is_registered("LinkedPayload"));
        assert!(!EventRegistry::empty().is_registered("LinkedPayload"));
    }
}
