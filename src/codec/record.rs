//! Persisted record layouts.

use bson::{Binary, Document};
use serde::{Deserialize, Serialize};

use super::CodecError;

/// `_id` of the global counter document in the streams collection.
pub const GLOBAL_STREAM_ID: &str = "$all";

/// One persisted event.
///
/// In the normalized layout `_id` is the global position. Events embedded in
/// a stream document have no `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Binary>,
    pub timestamp: bson::DateTime,
    pub stream_type: String,
    pub stream_id: String,
    pub version: i64,
    #[serde(default)]
    pub metadata: Document,
}

/// Stream summary in the normalized layout, or the `$all` counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub stream_type: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<bson::DateTime>,
}

/// Stream document in the embedded layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub stream_type: String,
    pub version: i64,
    #[serde(default)]
    pub events: Vec<EventRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<bson::DateTime>,
}

macro_rules! document_conversions {
    ($($record:ty),*) => {
        $(
            impl $record {
                pub fn to_document(&self) -> Result<Document, CodecError> {
                    bson::to_document(self).map_err(|e| CodecError::Record(e.to_string()))
                }

                pub fn from_document(document: Document) -> Result<Self, CodecError> {
                    bson::from_document(document).map_err(|e| CodecError::Record(e.to_string()))
                }
            }
        )*
    };
}

document_conversions!(EventRecord, StreamRecord, AggregateRecord);
