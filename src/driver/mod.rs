//! Storage driver facade.
//!
//! The event stores never talk to a database client directly. They go through
//! the [`Database`] trait, which exposes:
//! - single-operation sessions (each operation commits on its own)
//! - transactional sessions (all operations commit or abort together)
//! - collection drop and index creation
//! - change-feed subscriptions resumable from an opaque [`ResumeToken`]
//!
//! Implementations:
//! - `MemoryDatabase`: transactional in-memory store with an oplog change feed
//! - `MongoDatabase`: MongoDB replica set (feature `mongodb`)

use std::fmt;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::Stream;
use serde::{Deserialize, Serialize};

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongodb;

pub use memory::{FailPoint, MemoryDatabase};
#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoDatabase;

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors raised by a storage driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Duplicate key in collection '{collection}' (index {index})")]
    DuplicateKey { collection: String, index: String },

    #[error("Injected failure on {operation} in collection '{collection}'")]
    InjectedFailure {
        collection: String,
        operation: &'static str,
    },

    #[error("Change stream closed: {0}")]
    StreamClosed(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Database closed")]
    Closed,

    #[error("BSON serialization error: {0}")]
    BsonSerialization(#[from] bson::ser::Error),

    #[error("BSON deserialization error: {0}")]
    BsonDeserialization(#[from] bson::de::Error),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),
}

impl DriverError {
    /// Whether the whole transaction may be retried as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "mongodb")]
            DriverError::Mongo(e) => {
                e.contains_label(::mongodb::error::TRANSIENT_TRANSACTION_ERROR)
                    || e.contains_label(::mongodb::error::UNKNOWN_TRANSACTION_COMMIT_RESULT)
            }
            _ => false,
        }
    }

    /// Index name of a duplicate key violation, if this is one.
    pub fn duplicate_index(&self) -> Option<&str> {
        match self {
            DriverError::DuplicateKey { index, .. } => Some(index),
            _ => None,
        }
    }
}

/// Outcome of an update or replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
}

/// Index definition used at bootstrap.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, keys: Document) -> Self {
        Self {
            name: name.into(),
            keys,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A scope for executing document operations.
///
/// Sessions obtained from [`Database::session`] apply each operation
/// immediately; `commit` and `abort` are no-ops. Sessions obtained from
/// [`Database::begin`] stage every operation until `commit`. Dropping a
/// transactional session without committing aborts it.
///
/// Filters are equality documents. Dotted paths match into embedded
/// documents and arrays; comparison operators `$gt`, `$gte`, `$lt`, `$lte`
/// and `$in` are supported on field values. Updates support `$set`, `$inc`
/// and `$push` (with or without `$each`).
#[async_trait]
pub trait Session: Send {
    async fn find_one(&mut self, collection: &str, filter: Document) -> Result<Option<Document>>;

    async fn find(
        &mut self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
    ) -> Result<Vec<Document>>;

    async fn count(&mut self, collection: &str, filter: Document) -> Result<u64>;

    /// Insert a document, returning its `_id`.
    async fn insert_one(&mut self, collection: &str, document: Document) -> Result<Bson>;

    /// Insert documents in order, returning their `_id`s in input order.
    async fn insert_many(&mut self, collection: &str, documents: Vec<Document>)
        -> Result<Vec<Bson>>;

    async fn update_one(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    async fn update_many(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<UpdateOutcome>;

    /// Apply `update` to the first match and return the document as it was
    /// before the update. Returns `None` if nothing matched (or an upsert
    /// inserted a new document).
    async fn find_one_and_update(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<Option<Document>>;

    async fn replace_one(
        &mut self,
        collection: &str,
        filter: Document,
        replacement: Document,
    ) -> Result<UpdateOutcome>;

    /// Delete all matches, returning the number deleted.
    async fn delete_many(&mut self, collection: &str, filter: Document) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Handle to a transactional document store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Session whose operations commit individually.
    async fn session(&self) -> Result<Box<dyn Session>>;

    /// Session whose operations commit atomically on [`Session::commit`].
    async fn begin(&self) -> Result<Box<dyn Session>>;

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<()>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    /// Open a change stream on a collection.
    ///
    /// Without a resume token the stream starts at the current end of the
    /// log. With one, it starts right after the change the token identifies.
    /// The stream ends (or yields an error) when the underlying cursor is
    /// lost; callers reopen it from [`ChangeCursor::resume_token`].
    async fn watch(
        &self,
        collection: &str,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Stream of committed changes on a collection.
pub type ChangeStream = Box<dyn ChangeCursor>;

/// A change stream that knows where it is in the log.
pub trait ChangeCursor: Stream<Item = Result<ChangeEvent>> + Send + Unpin {
    /// Token to reopen the stream right after the last change it returned.
    ///
    /// Before any change is returned this is the point the stream was opened
    /// at, so reopening with it never skips a change committed in between.
    fn resume_token(&self) -> Option<ResumeToken>;
}

/// Opaque marker identifying a change in a change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Bson);

impl ResumeToken {
    pub fn from_bson(value: Bson) -> Self {
        Self(value)
    }

    pub fn as_bson(&self) -> &Bson {
        &self.0
    }

    pub fn into_bson(self) -> Bson {
        self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change reported by a change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Other(String),
}

/// A committed change on a collection.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub operation: ChangeOperation,
    pub collection: String,
    pub document_key: Option<Document>,
    /// Post-image of the document for inserts, updates and replaces.
    pub full_document: Option<Document>,
}
