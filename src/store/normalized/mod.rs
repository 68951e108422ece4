//! Normalized layout: separate events and streams collections.
//!
//! ```text
//! events:  { _id: <global position>, event_type, payload, timestamp,
//!            stream_type, stream_id, version, metadata: { position, .. } }
//! streams: { _id: <stream id>, position, stream_type, version, updated_at }
//!          { _id: "$all", position }            <- global counter
//! ```
//!
//! Every save runs in one transaction:
//! 1. bump the `$all` counter by the batch size, reading the old value
//! 2. insert the events with positions following the old counter value
//! 3. create or conditionally update the stream summary
//!
//! Concurrent writers to one stream collide on the unique
//! `(stream_id, version)` index or on the summary's version check. Writers to
//! different streams serialize on the counter document, so positions are
//! gap-free and follow commit order.

mod maintenance;

use std::sync::Arc;

use async_trait::async_trait;
use backon::Retryable;
use bson::{doc, Bson};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batch::{self, BatchStream};
use super::{
    collection_name, finish, notify_handler, ErrorKind, EventStore, EventStoreError, Operation,
    Result, StoreOptions, StreamInfo, EVENTS_COLLECTION, SNAPSHOTS_COLLECTION, STREAMS_COLLECTION,
};
use crate::codec::{self, EventRecord, EventRegistry, StreamRecord, GLOBAL_STREAM_ID};
use crate::driver::{ChangeOperation, Database, DriverError, IndexSpec, ResumeToken, Session};
use crate::event::{Event, EventHandler, POSITION_KEY};
use crate::tail::{ChangeFeed, Subscription, TailError};
use crate::utils::retry::transaction_backoff;

/// Name of the unique `(stream_id, version)` index on the events collection.
pub const STREAM_VERSION_INDEX: &str = "stream_version";

/// Collection names of one namespace.
#[derive(Debug, Clone)]
struct Collections {
    events: String,
    streams: String,
    snapshots: String,
}

impl Collections {
    fn new(namespace: &str) -> Self {
        Self {
            events: collection_name(namespace, EVENTS_COLLECTION),
            streams: collection_name(namespace, STREAMS_COLLECTION),
            snapshots: collection_name(namespace, SNAPSHOTS_COLLECTION),
        }
    }
}

/// Event store using the normalized layout.
pub struct NormalizedStore {
    db: Arc<dyn Database>,
    registry: Arc<EventRegistry>,
    handler: Option<Arc<dyn EventHandler>>,
    feed: ChangeFeed,
}

impl NormalizedStore {
    /// Open the store, creating indexes and the global counter for every
    /// configured namespace.
    pub async fn open(
        db: Arc<dyn Database>,
        registry: Arc<EventRegistry>,
        options: StoreOptions,
    ) -> Result<Self> {
        let feed = ChangeFeed::new(db.clone(), options.tail.clone());
        let store = Self {
            db,
            registry,
            handler: options.event_handler.clone(),
            feed,
        };
        for namespace in options.bootstrap_namespaces() {
            store.init_namespace(&namespace).await?;
        }
        Ok(store)
    }

    /// Create indexes and the `$all` counter for one namespace. Idempotent.
    pub async fn init_namespace(&self, namespace: &str) -> Result<()> {
        let collections = Collections::new(namespace);
        let init = |e: DriverError| EventStoreError::storage(Operation::Init, e);

        self.db
            .create_index(
                &collections.events,
                IndexSpec::new("stream_id", doc! { "stream_id": 1 }),
            )
            .await
            .map_err(init)?;
        self.db
            .create_index(
                &collections.events,
                IndexSpec::new(STREAM_VERSION_INDEX, doc! { "stream_id": 1, "version": 1 })
                    .unique(),
            )
            .await
            .map_err(init)?;

        // Upsert so concurrent openers agree on one counter document.
        let mut session = self.db.session().await.map_err(init)?;
        session
            .update_one(
                &collections.streams,
                doc! { "_id": GLOBAL_STREAM_ID },
                doc! { "$inc": { "position": 0_i64 } },
                true,
            )
            .await
            .map_err(init)?;

        info!(
            namespace,
            events = %collections.events,
            streams = %collections.streams,
            "Normalized event store initialized"
        );
        Ok(())
    }

    /// Position of the last event committed in `namespace`. 0 when empty.
    pub async fn global_position(&self, namespace: &str) -> Result<u64> {
        let load = |e: DriverError| EventStoreError::storage(Operation::Load, e);
        let mut session = self.db.session().await.map_err(load)?;
        let counter = session
            .find_one(
                &collection_name(namespace, STREAMS_COLLECTION),
                doc! { "_id": GLOBAL_STREAM_ID },
            )
            .await
            .map_err(load)?;
        match counter {
            Some(document) => {
                let record = StreamRecord::from_document(document)
                    .map_err(|e| EventStoreError::codec(Operation::Load, e))?;
                Ok(record.position.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    /// Tail events committed in `namespace`.
    ///
    /// Without a token, delivery starts with the first event committed after
    /// this call. With one, it resumes right after the event the token
    /// belongs to. Events arrive in commit order, at least once.
    pub async fn subscribe(
        &self,
        namespace: &str,
        resume_after: Option<ResumeToken>,
    ) -> Result<EventSubscription> {
        let inner = self
            .feed
            .subscribe(collection_name(namespace, EVENTS_COLLECTION), resume_after)
            .await
            .map_err(|e| EventStoreError::storage(Operation::Load, e))?;
        debug!(namespace, "Subscribed to events");
        Ok(EventSubscription {
            inner,
            registry: self.registry.clone(),
        })
    }

    /// Take the channel on which tailers report change-stream failures.
    /// Only the first call gets it.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<TailError>> {
        self.feed.take_errors()
    }

    pub async fn ping(&self) -> Result<()> {
        self.db
            .ping()
            .await
            .map_err(|e| EventStoreError::storage(Operation::Init, e))
    }

    /// Stop every tailer and close the database handle.
    pub async fn close(&self) -> Result<()> {
        self.feed.shutdown();
        self.db
            .close()
            .await
            .map_err(|e| EventStoreError::storage(Operation::Init, e))
    }
}

#[async_trait]
impl EventStore for NormalizedStore {
    async fn save(
        &self,
        namespace: &str,
        events: Vec<Event>,
        original_version: u64,
    ) -> Result<()> {
        let stream = batch::validate(&events, original_version)?;
        let stream_id = stream.stream_id;

        let mut records = Vec::with_capacity(events.len());
        for event in &events {
            let record = codec::encode(event).map_err(|e| {
                EventStoreError::codec(Operation::Save, e)
                    .with_stream(stream_id)
                    .with_version(event.version())
            })?;
            records.push(record);
        }
        let collections = Collections::new(namespace);

        let positions = (|| async {
            let mut tx = self
                .db
                .begin()
                .await
                .map_err(|e| EventStoreError::storage(Operation::Save, e))?;
            let result = append(
                tx.as_mut(),
                &collections,
                &stream,
                original_version,
                records.clone(),
            )
            .await;
            finish(Operation::Save, tx, result).await
        })
        .retry(transaction_backoff())
        .when(EventStoreError::is_transient)
        .notify(|e, dur| {
            warn!(
                stream_id = %stream_id,
                error = %e,
                retry_after_ms = %dur.as_millis(),
                "Transient transaction failure, retrying save"
            );
        })
        .await
        .map_err(|e| e.with_stream(stream_id))?;

        debug!(
            namespace,
            stream_id = %stream_id,
            version = stream.last_version,
            first_position = positions.first().copied().unwrap_or_default(),
            count = positions.len(),
            "Saved events"
        );

        let committed = events
            .into_iter()
            .zip(positions)
            .map(|(event, position)| event.with_metadata(POSITION_KEY, position))
            .collect();
        notify_handler(self.handler.as_ref(), committed).await
    }

    async fn load_from(
        &self,
        namespace: &str,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<Event>> {
        let collections = Collections::new(namespace);
        let load = |e: DriverError| EventStoreError::storage(Operation::Load, e).with_stream(stream_id);
        let mut session = self.db.session().await.map_err(load)?;

        let documents = session
            .find(
                &collections.events,
                doc! {
                    "stream_id": stream_id.to_string(),
                    "version": { "$gte": from_version as i64 },
                },
                Some(doc! { "version": 1 }),
            )
            .await
            .map_err(load)?;

        if documents.is_empty() {
            let known = session
                .count(&collections.streams, doc! { "_id": stream_id.to_string() })
                .await
                .map_err(load)?;
            if known == 0 {
                return Err(
                    EventStoreError::new(Operation::Load, ErrorKind::StreamNotFound)
                        .with_stream(stream_id),
                );
            }
        }

        let mut events = Vec::with_capacity(documents.len());
        for document in documents {
            let event =
                decode_event(&self.registry, document).map_err(|e| e.with_stream(stream_id))?;
            events.push(event);
        }

        debug!(namespace, stream_id = %stream_id, count = events.len(), "Loaded events");
        Ok(events)
    }

    async fn stream_info(&self, namespace: &str, stream_id: Uuid) -> Result<StreamInfo> {
        let load = |e: DriverError| EventStoreError::storage(Operation::Load, e).with_stream(stream_id);
        let mut session = self.db.session().await.map_err(load)?;
        let document = session
            .find_one(
                &collection_name(namespace, STREAMS_COLLECTION),
                doc! { "_id": stream_id.to_string() },
            )
            .await
            .map_err(load)?
            .ok_or_else(|| {
                EventStoreError::new(Operation::Load, ErrorKind::StreamNotFound)
                    .with_stream(stream_id)
            })?;
        let record = StreamRecord::from_document(document)
            .map_err(|e| EventStoreError::codec(Operation::Load, e).with_stream(stream_id))?;

        Ok(StreamInfo {
            stream_id,
            stream_type: record.stream_type,
            version: record.version.max(0) as u64,
            position: Some(record.position.max(0) as u64),
            updated_at: record.updated_at.map(|t| t.to_chrono()),
        })
    }
}

/// Body of the save transaction. Returns the positions assigned to the batch.
async fn append(
    session: &mut dyn Session,
    collections: &Collections,
    stream: &BatchStream,
    original_version: u64,
    records: Vec<EventRecord>,
) -> Result<Vec<i64>> {
    let op = Operation::Save;
    let storage = |e: DriverError| EventStoreError::storage(op, e);
    let conflict = || {
        EventStoreError::new(op, ErrorKind::VersionConflict).with_version(original_version)
    };
    let count = records.len() as i64;

    let counter = session
        .find_one_and_update(
            &collections.streams,
            doc! { "_id": GLOBAL_STREAM_ID },
            doc! { "$inc": { "position": count } },
            true,
        )
        .await
        .map_err(storage)?;
    let base = match counter {
        Some(document) => {
            StreamRecord::from_document(document)
                .map_err(|e| EventStoreError::codec(op, e))?
                .position
        }
        None => 0,
    };

    let mut positions = Vec::with_capacity(records.len());
    let mut documents = Vec::with_capacity(records.len());
    for (offset, mut record) in records.into_iter().enumerate() {
        let position = base + 1 + offset as i64;
        record.position = Some(position);
        record.metadata.insert(POSITION_KEY, position);
        documents.push(record.to_document().map_err(|e| EventStoreError::codec(op, e))?);
        positions.push(position);
    }

    let ids = match session.insert_many(&collections.events, documents).await {
        Ok(ids) => ids,
        Err(e) if e.duplicate_index().is_some() => return Err(conflict()),
        Err(e) => return Err(storage(e)),
    };
    let assigned = ids.iter().zip(&positions).all(|(id, position)| match id {
        Bson::Int64(id) => id == position,
        Bson::Int32(id) => i64::from(*id) == *position,
        _ => false,
    });
    if !assigned || ids.len() != positions.len() {
        return Err(storage(DriverError::InvalidOperation(format!(
            "inserted ids {ids:?} do not match positions {positions:?}"
        ))));
    }

    let last_position = positions.last().copied().unwrap_or(base);
    let now = bson::DateTime::now();
    let version = stream.last_version as i64;
    if original_version == 0 {
        let summary = StreamRecord {
            id: stream.stream_id.to_string(),
            position: last_position,
            stream_type: stream.stream_type.clone(),
            version,
            updated_at: Some(now),
        };
        let document = summary
            .to_document()
            .map_err(|e| EventStoreError::codec(op, e))?;
        match session.insert_one(&collections.streams, document).await {
            Ok(_) => {}
            Err(e) if e.duplicate_index().is_some() => return Err(conflict()),
            Err(e) => return Err(storage(e)),
        }
    } else {
        let outcome = session
            .update_one(
                &collections.streams,
                doc! {
                    "_id": stream.stream_id.to_string(),
                    "version": original_version as i64,
                },
                doc! {
                    "$set": {
                        "position": last_position,
                        "stream_type": stream.stream_type.as_str(),
                        "version": version,
                        "updated_at": now,
                    }
                },
                false,
            )
            .await
            .map_err(storage)?;
        if outcome.matched == 0 {
            return Err(conflict());
        }
    }

    Ok(positions)
}

/// Decode a stored event. Failures name the event's stream and version.
fn decode_event(registry: &EventRegistry, document: bson::Document) -> Result<Event> {
    let record =
        EventRecord::from_document(document).map_err(|e| EventStoreError::codec(Operation::Load, e))?;
    let stream_id = Uuid::parse_str(&record.stream_id).ok();
    let version = record.version.max(0) as u64;
    registry.decode(record).map_err(|e| {
        let err = EventStoreError::codec(Operation::Load, e).with_version(version);
        match stream_id {
            Some(stream_id) => err.with_stream(stream_id),
            None => err,
        }
    })
}

/// An event delivered by a tailer.
#[derive(Debug, Clone)]
pub struct TailedEvent {
    pub event: Event,
    /// Resume token of the change that carried the event.
    pub token: ResumeToken,
}

/// Live feed of events committed to one namespace.
///
/// Dropping the subscription stops its tailer.
pub struct EventSubscription {
    inner: Subscription,
    registry: Arc<EventRegistry>,
}

impl EventSubscription {
    /// Next committed event. `None` once the tailer has stopped.
    ///
    /// Changes other than inserts (maintenance rewrites, drops) are skipped.
    pub async fn recv(&mut self) -> Option<Result<TailedEvent>> {
        loop {
            let change = self.inner.recv().await?;
            if change.operation != ChangeOperation::Insert {
                continue;
            }
            let Some(document) = change.full_document else {
                continue;
            };
            let decoded = decode_event(&self.registry, document);
            return Some(decoded.map(|event| TailedEvent {
                event,
                token: change.token,
            }));
        }
    }

    /// Token of the last change handed over. Persist it to resume later.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.inner.resume_token()
    }

    pub async fn stop(self) {
        self.inner.stop().await;
    }
}

#[cfg(test)]
mod tests;
