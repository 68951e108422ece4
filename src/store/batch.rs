//! Save preconditions, checked before any I/O.

use uuid::Uuid;

use super::{BatchViolation, ErrorKind, EventStoreError, Operation, Result};
use crate::event::Event;

/// Stream identity shared by every event of a valid batch.
#[derive(Debug, Clone)]
pub(crate) struct BatchStream {
    pub stream_id: Uuid,
    pub stream_type: String,
    /// Version of the last event in the batch.
    pub last_version: u64,
}

/// Validate a batch for `save`.
///
/// - the batch is non-empty
/// - all events share one stream id and one stream type
/// - versions are contiguous within the batch
/// - the first version is `original_version + 1`; a contiguous batch that
///   starts elsewhere carries a stale expectation and is a version conflict
pub(crate) fn validate(events: &[Event], original_version: u64) -> Result<BatchStream> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::new(
            Operation::Save,
            ErrorKind::InvalidBatch(BatchViolation::Empty),
        ));
    };
    let stream_id = first.stream_id();
    let invalid = |violation: BatchViolation, version: u64| {
        EventStoreError::new(Operation::Save, ErrorKind::InvalidBatch(violation))
            .with_stream(stream_id)
            .with_version(version)
    };

    for (offset, event) in events.iter().enumerate() {
        if event.stream_id() != stream_id {
            return Err(invalid(BatchViolation::MismatchedStreamIds, event.version()));
        }
        if event.stream_type() != first.stream_type() {
            return Err(invalid(BatchViolation::MismatchedStreamTypes, event.version()));
        }
        let expected = first.version() + offset as u64;
        if event.version() != expected {
            return Err(invalid(
                BatchViolation::NonContiguousVersions {
                    expected,
                    actual: event.version(),
                },
                event.version(),
            ));
        }
    }

    if first.version() != original_version + 1 {
        return Err(
            EventStoreError::new(Operation::Save, ErrorKind::VersionConflict)
                .with_stream(stream_id)
                .with_version(original_version),
        );
    }

    Ok(BatchStream {
        stream_id,
        stream_type: first.stream_type().to_string(),
        last_version: original_version + events.len() as u64,
    })
}
