//! In-memory storage driver.
//!
//! Collections are ordered document vectors guarded by a single async mutex.
//! Transactions hold the mutex for their lifetime and work on a staged copy,
//! so concurrent transactions serialize and an aborted transaction leaves no
//! trace. Every committed change is appended to an oplog that backs change
//! streams; resume tokens are oplog sequence numbers.
//!
//! Test hooks:
//! - [`MemoryDatabase::fail_next`] arms a one-shot failure for an operation
//! - [`MemoryDatabase::interrupt_watchers`] breaks every open change stream

mod query;


use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{
    ChangeCursor, ChangeEvent, ChangeOperation, ChangeStream, Database, DriverError, IndexSpec, Result,
    ResumeToken, Session, UpdateOutcome,
};

// ============================================================================
// Fault injection
// ============================================================================

/// One-shot failure armed with [`MemoryDatabase::fail_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailPoint {
    operation: &'static str,
    collection: Option<String>,
}

impl FailPoint {
    /// Fail the next `insert_one`/`insert_many` on `collection`.
    pub fn insert(collection: impl Into<String>) -> Self {
        Self {
            operation: "insert",
            collection: Some(collection.into()),
        }
    }

    /// Fail the next update, replace or find-and-update on `collection`.
    pub fn update(collection: impl Into<String>) -> Self {
        Self {
            operation: "update",
            collection: Some(collection.into()),
        }
    }

    /// Fail the next `delete_many` on `collection`.
    pub fn delete(collection: impl Into<String>) -> Self {
        Self {
            operation: "delete",
            collection: Some(collection.into()),
        }
    }

    /// Fail the next transaction commit.
    pub fn commit() -> Self {
        Self {
            operation: "commit",
            collection: None,
        }
    }

    fn hits(&self, operation: &str, collection: Option<&str>) -> bool {
        self.operation == operation
            && (self.collection.is_none() || self.collection.as_deref() == collection)
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Default)]
struct MemCollection {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl MemCollection {
    fn position_of(&self, filter: &Document) -> Result<Option<usize>> {
        for (i, doc) in self.documents.iter().enumerate() {
            if query::matches(doc, filter)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn positions_of(&self, filter: &Document) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for (i, doc) in self.documents.iter().enumerate() {
            if query::matches(doc, filter)? {
                out.push(i);
            }
        }
        Ok(out)
    }

    /// Reject `candidate` if it collides with another document on `_id` or
    /// on any unique index. `skip` is the candidate's own slot, if stored.
    fn check_unique(&self, name: &str, candidate: &Document, skip: Option<usize>) -> Result<()> {
        let others = || {
            self.documents
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != skip)
                .map(|(_, d)| d)
        };

        if let Some(id) = candidate.get("_id") {
            if others().any(|d| d.get("_id").is_some_and(|o| query::values_equal(o, id))) {
                return Err(DriverError::DuplicateKey {
                    collection: name.to_string(),
                    index: "_id_".to_string(),
                });
            }
        }

        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(candidate, &index.keys);
            if others().any(|d| keys_equal(&index_key(d, &index.keys), &key)) {
                return Err(DriverError::DuplicateKey {
                    collection: name.to_string(),
                    index: index.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn index_key(doc: &Document, keys: &Document) -> Vec<Option<Bson>> {
    keys.keys()
        .map(|path| query::values_at(doc, path).into_iter().next().cloned())
        .collect()
}

fn keys_equal(a: &[Option<Bson>], b: &[Option<Bson>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => query::values_equal(x, y),
            (None, None) => true,
            _ => false,
        })
}

/// A change waiting to be appended to the oplog.
#[derive(Debug, Clone)]
struct PendingChange {
    collection: String,
    operation: ChangeOperation,
    document_key: Option<Document>,
    full_document: Option<Document>,
}

impl PendingChange {
    fn new(collection: &str, operation: ChangeOperation, doc: Option<&Document>) -> Self {
        let document_key = doc
            .and_then(|d| d.get("_id"))
            .map(|id| bson::doc! { "_id": id.clone() });
        let full_document = match operation {
            ChangeOperation::Delete | ChangeOperation::Drop => None,
            _ => doc.cloned(),
        };
        Self {
            collection: collection.to_string(),
            operation,
            document_key,
            full_document,
        }
    }
}

#[derive(Debug, Clone)]
struct OplogEntry {
    token: i64,
    change: PendingChange,
}

impl OplogEntry {
    fn to_change_event(&self) -> ChangeEvent {
        ChangeEvent {
            token: ResumeToken::from_bson(Bson::Int64(self.token)),
            operation: self.change.operation.clone(),
            collection: self.change.collection.clone(),
            document_key: self.change.document_key.clone(),
            full_document: self.change.full_document.clone(),
        }
    }
}

/// Collection contents plus the operations that act on them.
#[derive(Debug, Clone, Default)]
struct Collections(HashMap<String, MemCollection>);

impl Collections {
    fn get(&self, name: &str) -> Option<&MemCollection> {
        self.0.get(name)
    }

    fn get_mut(&mut self, name: &str) -> &mut MemCollection {
        self.0.entry(name.to_string()).or_default()
    }

    fn find(&self, name: &str, filter: &Document, sort: Option<&Document>) -> Result<Vec<Document>> {
        let Some(coll) = self.get(name) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for doc in &coll.documents {
            if query::matches(doc, filter)? {
                out.push(doc.clone());
            }
        }
        if let Some(sort) = sort {
            query::sort_documents(&mut out, sort);
        }
        Ok(out)
    }

    fn insert(
        &mut self,
        name: &str,
        mut doc: Document,
        changes: &mut Vec<PendingChange>,
    ) -> Result<Bson> {
        if !doc.contains_key("_id") {
            let mut with_id = bson::doc! { "_id": ObjectId::new() };
            with_id.extend(doc);
            doc = with_id;
        }
        let coll = self.get_mut(name);
        coll.check_unique(name, &doc, None)?;
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        changes.push(PendingChange::new(name, ChangeOperation::Insert, Some(&doc)));
        coll.documents.push(doc);
        Ok(id)
    }

    /// Apply `update` to the first (or every) match. Returns the outcome and
    /// the pre-image of the first updated document.
    fn update(
        &mut self,
        name: &str,
        filter: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
        changes: &mut Vec<PendingChange>,
    ) -> Result<(UpdateOutcome, Option<Document>)> {
        let coll = self.get_mut(name);
        let targets = if multi {
            coll.positions_of(filter)?
        } else {
            coll.position_of(filter)?.into_iter().collect()
        };

        if targets.is_empty() {
            if !upsert {
                return Ok((UpdateOutcome::default(), None));
            }
            let mut doc = query::upsert_seed(filter);
            query::apply_update(&mut doc, update)?;
            self.insert(name, doc, changes)?;
            return Ok((
                UpdateOutcome {
                    upserted: true,
                    ..UpdateOutcome::default()
                },
                None,
            ));
        }

        let mut outcome = UpdateOutcome::default();
        let mut first_pre_image = None;
        for index in targets {
            let before = coll.documents[index].clone();
            let mut after = before.clone();
            query::apply_update(&mut after, update)?;
            outcome.matched += 1;
            if after != before {
                coll.check_unique(name, &after, Some(index))?;
                changes.push(PendingChange::new(name, ChangeOperation::Update, Some(&after)));
                coll.documents[index] = after;
                outcome.modified += 1;
            }
            first_pre_image.get_or_insert(before);
        }
        Ok((outcome, first_pre_image))
    }

    fn replace(
        &mut self,
        name: &str,
        filter: &Document,
        mut replacement: Document,
        changes: &mut Vec<PendingChange>,
    ) -> Result<UpdateOutcome> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(DriverError::InvalidOperation(
                "replacement document must not contain update operators".to_string(),
            ));
        }
        let coll = self.get_mut(name);
        let Some(index) = coll.position_of(filter)? else {
            return Ok(UpdateOutcome::default());
        };
        let existing_id = coll.documents[index].get("_id").cloned();
        match (replacement.get("_id"), &existing_id) {
            (Some(new), Some(old)) if !query::values_equal(new, old) => {
                return Err(DriverError::InvalidOperation(
                    "the _id field is immutable".to_string(),
                ));
            }
            (None, Some(old)) => {
                let mut with_id = bson::doc! { "_id": old.clone() };
                with_id.extend(replacement);
                replacement = with_id;
            }
            _ => {}
        }
        coll.check_unique(name, &replacement, Some(index))?;
        let modified = coll.documents[index] != replacement;
        changes.push(PendingChange::new(
            name,
            ChangeOperation::Replace,
            Some(&replacement),
        ));
        coll.documents[index] = replacement;
        Ok(UpdateOutcome {
            matched: 1,
            modified: u64::from(modified),
            upserted: false,
        })
    }

    fn delete(
        &mut self,
        name: &str,
        filter: &Document,
        changes: &mut Vec<PendingChange>,
    ) -> Result<u64> {
        let Some(coll) = self.0.get_mut(name) else {
            return Ok(0);
        };
        let mut kept = Vec::with_capacity(coll.documents.len());
        let mut deleted = 0;
        for doc in coll.documents.drain(..) {
            if query::matches(&doc, filter)? {
                changes.push(PendingChange::new(name, ChangeOperation::Delete, Some(&doc)));
                deleted += 1;
            } else {
                kept.push(doc);
            }
        }
        coll.documents = kept;
        Ok(deleted)
    }

    fn drop_collection(&mut self, name: &str, changes: &mut Vec<PendingChange>) {
        if self.0.remove(name).is_some() {
            changes.push(PendingChange::new(name, ChangeOperation::Drop, None));
        }
    }
}

#[derive(Debug, Default)]
struct State {
    data: Collections,
    oplog: Vec<OplogEntry>,
    last_token: i64,
}

impl State {
    /// First oplog entry on `collection` after `token`.
    fn next_after(&self, token: i64, collection: &str) -> Option<&OplogEntry> {
        let start = self.oplog.partition_point(|e| e.token <= token);
        self.oplog[start..]
            .iter()
            .find(|e| e.change.collection == collection)
    }
}

struct Shared {
    state: Arc<Mutex<State>>,
    /// Token of the last committed oplog entry.
    head: watch::Sender<i64>,
    /// Bumped to break open change streams.
    interrupts: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    fail_points: StdMutex<Vec<FailPoint>>,
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }

    /// Consume an armed fail point matching this operation, if any.
    fn trip(&self, operation: &'static str, collection: Option<&str>) -> Result<()> {
        let mut points = match self.fail_points.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(i) = points.iter().position(|p| p.hits(operation, collection)) {
            points.remove(i);
            debug!(operation, collection, "Injected driver failure");
            return Err(DriverError::InjectedFailure {
                collection: collection.unwrap_or_default().to_string(),
                operation,
            });
        }
        Ok(())
    }

    /// Append committed changes to the oplog and wake watchers.
    fn publish(&self, state: &mut State, changes: Vec<PendingChange>) {
        if changes.is_empty() {
            return;
        }
        for change in changes {
            state.last_token += 1;
            let token = state.last_token;
            state.oplog.push(OplogEntry { token, change });
        }
        self.head.send_replace(state.last_token);
    }
}

// ============================================================================
// Database
// ============================================================================

/// Transactional in-memory database.
///
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        let (interrupts, _) = watch::channel(0);
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Arc::new(Mutex::new(State::default())),
                head,
                interrupts,
                closed,
                fail_points: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Arm a one-shot failure. The next matching operation returns
    /// [`DriverError::InjectedFailure`] without touching any data.
    pub fn fail_next(&self, point: FailPoint) {
        let mut points = match self.shared.fail_points.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        points.push(point);
    }

    /// Break every open change stream. Each yields one
    /// [`DriverError::StreamClosed`] and then ends.
    pub fn interrupt_watchers(&self) {
        self.shared.interrupts.send_modify(|generation| *generation += 1);
    }

    /// Number of documents currently stored in `collection`.
    pub async fn document_count(&self, collection: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .data
            .get(collection)
            .map(|c| c.documents.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn session(&self) -> Result<Box<dyn Session>> {
        self.shared.ensure_open()?;
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            mode: Mode::AutoCommit,
        }))
    }

    async fn begin(&self) -> Result<Box<dyn Session>> {
        self.shared.ensure_open()?;
        let guard = self.shared.state.clone().lock_owned().await;
        let staged = guard.data.clone();
        Ok(Box::new(MemorySession {
            shared: self.shared.clone(),
            mode: Mode::Transaction {
                guard,
                staged,
                changes: Vec::new(),
            },
        }))
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<()> {
        self.shared.ensure_open()?;
        let mut state = self.shared.state.lock().await;
        let coll = state.data.get_mut(collection);
        if let Some(existing) = coll.indexes.iter().find(|i| i.name == index.name) {
            if existing.keys != index.keys || existing.unique != index.unique {
                return Err(DriverError::InvalidOperation(format!(
                    "index {} already exists with different options",
                    index.name
                )));
            }
            return Ok(());
        }
        coll.indexes.push(index);
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.shared.ensure_open()?;
        let mut state = self.shared.state.lock().await;
        let mut changes = Vec::new();
        state.data.drop_collection(collection, &mut changes);
        self.shared.publish(&mut state, changes);
        Ok(())
    }

    async fn watch(
        &self,
        collection: &str,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream> {
        self.shared.ensure_open()?;
        let position = match resume_after {
            None => *self.shared.head.borrow(),
            Some(token) => match token.as_bson() {
                Bson::Int64(n) => *n,
                other => {
                    return Err(DriverError::InvalidOperation(format!(
                        "unrecognized resume token {other}"
                    )))
                }
            },
        };

        let position = Arc::new(AtomicI64::new(position));
        let cursor = WatchCursor {
            shared: self.shared.clone(),
            collection: collection.to_string(),
            position: position.clone(),
            head: self.shared.head.subscribe(),
            interrupts: self.shared.interrupts.subscribe(),
            closed: self.shared.closed.subscribe(),
            done: false,
        };
        Ok(Box::new(MemoryChangeStream {
            changes: stream::unfold(cursor, WatchCursor::next_change).boxed(),
            position,
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.shared.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.send_replace(true);
        Ok(())
    }
}

// ============================================================================
// Change streams
// ============================================================================

/// Change stream over the oplog. The position is the token of the last
/// entry the cursor returned, or the head when it was opened.
struct MemoryChangeStream {
    changes: BoxStream<'static, Result<ChangeEvent>>,
    position: Arc<AtomicI64>,
}

impl Stream for MemoryChangeStream {
    type Item = Result<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.changes.poll_next_unpin(cx)
    }
}

impl ChangeCursor for MemoryChangeStream {
    fn resume_token(&self) -> Option<ResumeToken> {
        Some(ResumeToken::from_bson(Bson::Int64(
            self.position.load(Ordering::Acquire),
        )))
    }
}

struct WatchCursor {
    shared: Arc<Shared>,
    collection: String,
    position: Arc<AtomicI64>,
    head: watch::Receiver<i64>,
    interrupts: watch::Receiver<u64>,
    closed: watch::Receiver<bool>,
    done: bool,
}

impl WatchCursor {
    async fn next_change(mut self) -> Option<(Result<ChangeEvent>, Self)> {
        if self.done || *self.closed.borrow() {
            return None;
        }
        loop {
            // Mark the head as seen before scanning so a commit that lands
            // after the scan still wakes us.
            self.head.borrow_and_update();
            let next = {
                let state = self.shared.state.lock().await;
                state
                    .next_after(self.position.load(Ordering::Acquire), &self.collection)
                    .map(|entry| (entry.token, entry.to_change_event()))
            };
            if let Some((token, event)) = next {
                self.position.store(token, Ordering::Release);
                return Some((Ok(event), self));
            }

            let wake = tokio::select! {
                changed = self.head.changed() => match changed {
                    Ok(()) => Wake::Commit,
                    Err(_) => Wake::Closed,
                },
                changed = self.interrupts.changed() => match changed {
                    Ok(()) => Wake::Interrupted,
                    Err(_) => Wake::Closed,
                },
                _ = self.closed.changed() => Wake::Closed,
            };
            match wake {
                Wake::Commit => continue,
                Wake::Closed => return None,
                Wake::Interrupted => {
                    self.done = true;
                    let error = DriverError::StreamClosed(format!(
                        "change stream on {} interrupted",
                        self.collection
                    ));
                    return Some((Err(error), self));
                }
            }
        }
    }
}

enum Wake {
    Commit,
    Interrupted,
    Closed,
}

// ============================================================================
// Sessions
// ============================================================================

enum Mode {
    AutoCommit,
    Transaction {
        guard: OwnedMutexGuard<State>,
        staged: Collections,
        changes: Vec<PendingChange>,
    },
}

/// Session over a [`MemoryDatabase`].
pub struct MemorySession {
    shared: Arc<Shared>,
    mode: Mode,
}

impl MemorySession {
    /// Run `f` against the session's view of the data.
    async fn with_data<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut Collections, &mut Vec<PendingChange>) -> Result<T> + Send,
    {
        self.shared.ensure_open()?;
        match &mut self.mode {
            Mode::AutoCommit => {
                let mut state = self.shared.state.lock().await;
                let mut changes = Vec::new();
                let result = f(&mut state.data, &mut changes);
                self.shared.publish(&mut state, changes);
                result
            }
            Mode::Transaction {
                staged, changes, ..
            } => f(staged, changes),
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn find_one(&mut self, collection: &str, filter: Document) -> Result<Option<Document>> {
        self.with_data(|data, _| {
            Ok(data.find(collection, &filter, None)?.into_iter().next())
        })
        .await
    }

    async fn find(
        &mut self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
    ) -> Result<Vec<Document>> {
        self.with_data(|data, _| data.find(collection, &filter, sort.as_ref()))
            .await
    }

    async fn count(&mut self, collection: &str, filter: Document) -> Result<u64> {
        self.with_data(|data, _| Ok(data.find(collection, &filter, None)?.len() as u64))
            .await
    }

    async fn insert_one(&mut self, collection: &str, document: Document) -> Result<Bson> {
        self.shared.trip("insert", Some(collection))?;
        self.with_data(|data, changes| data.insert(collection, document, changes))
            .await
    }

    async fn insert_many(
        &mut self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Bson>> {
        self.shared.trip("insert", Some(collection))?;
        self.with_data(|data, changes| {
            documents
                .into_iter()
                .map(|doc| data.insert(collection, doc, changes))
                .collect()
        })
        .await
    }

    async fn update_one(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        self.shared.trip("update", Some(collection))?;
        self.with_data(|data, changes| {
            data.update(collection, &filter, &update, false, upsert, changes)
                .map(|(outcome, _)| outcome)
        })
        .await
    }

    async fn update_many(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<UpdateOutcome> {
        self.shared.trip("update", Some(collection))?;
        self.with_data(|data, changes| {
            data.update(collection, &filter, &update, true, false, changes)
                .map(|(outcome, _)| outcome)
        })
        .await
    }

    async fn find_one_and_update(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<Option<Document>> {
        self.shared.trip("update", Some(collection))?;
        self.with_data(|data, changes| {
            data.update(collection, &filter, &update, false, upsert, changes)
                .map(|(_, pre_image)| pre_image)
        })
        .await
    }

    async fn replace_one(
        &mut self,
        collection: &str,
        filter: Document,
        replacement: Document,
    ) -> Result<UpdateOutcome> {
        self.shared.trip("update", Some(collection))?;
        self.with_data(|data, changes| data.replace(collection, &filter, replacement, changes))
            .await
    }

    async fn delete_many(&mut self, collection: &str, filter: Document) -> Result<u64> {
        self.shared.trip("delete", Some(collection))?;
        self.with_data(|data, changes| data.delete(collection, &filter, changes))
            .await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemorySession { shared, mode } = *self;
        match mode {
            Mode::AutoCommit => Ok(()),
            Mode::Transaction {
                mut guard,
                staged,
                changes,
            } => {
                shared.ensure_open()?;
                shared.trip("commit", None)?;
                guard.data = staged;
                shared.publish(&mut guard, changes);
                Ok(())
            }
        }
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
