//! Event store error taxonomy.

use std::fmt;

use uuid::Uuid;

use crate::codec::CodecError;
use crate::driver::DriverError;
use crate::event::HandlerError;

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

/// Store operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    Save,
    Load,
    Replace,
    RenameEvent,
    Remove,
    Clear,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Save => "save",
            Operation::Load => "load",
            Operation::Replace => "replace",
            Operation::RenameEvent => "rename event",
            Operation::Remove => "remove",
            Operation::Clear => "clear",
        };
        f.write_str(name)
    }
}

/// Why a batch passed to `save` was rejected before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchViolation {
    #[error("no events to save")]
    Empty,

    #[error("events belong to different streams")]
    MismatchedStreamIds,

    #[error("events have different stream types")]
    MismatchedStreamTypes,

    #[error("non-contiguous versions: expected {expected}, got {actual}")]
    NonContiguousVersions { expected: u64, actual: u64 },
}

/// What went wrong.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("stream not found")]
    StreamNotFound,

    #[error("event not found")]
    EventNotFound,

    #[error("version conflict")]
    VersionConflict,

    #[error("invalid batch: {0}")]
    InvalidBatch(BatchViolation),

    #[error("serialization of '{event_type}' failed: {source}")]
    Serialization {
        event_type: String,
        #[source]
        source: CodecError,
    },

    #[error("storage failure: {0}")]
    Storage(#[source] DriverError),

    #[error("handler failed on '{event_type}' version {version}: {source}")]
    Handler {
        event_type: String,
        version: u64,
        #[source]
        source: HandlerError,
    },
}

/// Error returned by every event store operation.
///
/// Identifies the operation and, when known, the stream and version involved.
/// The root cause is reachable through [`std::error::Error::source`].
#[derive(Debug)]
pub struct EventStoreError {
    pub op: Operation,
    pub stream_id: Option<Uuid>,
    pub version: Option<u64>,
    pub kind: ErrorKind,
}

impl EventStoreError {
    pub fn new(op: Operation, kind: ErrorKind) -> Self {
        Self {
            op,
            stream_id: None,
            version: None,
            kind,
        }
    }

    pub fn with_stream(mut self, stream_id: Uuid) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn storage(op: Operation, error: DriverError) -> Self {
        Self::new(op, ErrorKind::Storage(error))
    }

    pub(crate) fn codec(op: Operation, error: CodecError) -> Self {
        let event_type = match &error {
            CodecError::UnregisteredEventType(t) => t.clone(),
            CodecError::Encode { event_type, .. } | CodecError::Decode { event_type, .. } => {
                event_type.clone()
            }
            CodecError::Record(_) => String::new(),
        };
        Self::new(
            op,
            ErrorKind::Serialization {
                event_type,
                source: error,
            },
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::StreamNotFound | ErrorKind::EventNotFound
        )
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self.kind, ErrorKind::VersionConflict)
    }

    /// Whether the failed transaction may be retried as a whole.
    pub fn is_transient(&self) -> bool {
        matches!(&self.kind, ErrorKind::Storage(e) if e.is_transient())
    }
}

impl fmt::Display for EventStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not {}", self.op)?;
        if let Some(stream_id) = &self.stream_id {
            write!(f, " stream {stream_id}")?;
        }
        if let Some(version) = self.version {
            write!(f, " at version {version}")?;
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for EventStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
