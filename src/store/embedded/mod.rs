//! Embedded layout: one document per stream.
//!
//! ```text
//! events: { _id: <stream id>, stream_type, version, updated_at,
//!           events: [ { event_type, payload, timestamp, stream_type,
//!                       stream_id, version, metadata }, ... ] }
//! ```
//!
//! A new stream is an insert; an append is one conditional update matched on
//! `{_id, version: original_version}` that pushes the batch and bumps the
//! version. A stale version matches nothing, which is the conflict signal.
//! No global order is kept.

mod maintenance;

use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    batch, collection_name, notify_handler, ErrorKind, EventStore, EventStoreError, Operation,
    Result, StoreOptions, StreamInfo, EVENTS_COLLECTION,
};
use crate::codec::{self, AggregateRecord, EventRegistry};
use crate::driver::{Database, DriverError, IndexSpec};
use crate::event::{Event, EventHandler};

/// Event store using the embedded layout.
pub struct EmbeddedStore {
    db: Arc<dyn Database>,
    registry: Arc<EventRegistry>,
    handler: Option<Arc<dyn EventHandler>>,
}

impl EmbeddedStore {
    /// Open the store and bootstrap indexes for every configured namespace.
    pub async fn open(
        db: Arc<dyn Database>,
        registry: Arc<EventRegistry>,
        options: StoreOptions,
    ) -> Result<Self> {
        let store = Self {
            db,
            registry,
            handler: options.event_handler.clone(),
        };
        for namespace in options.bootstrap_namespaces() {
            store.init_namespace(&namespace).await?;
        }
        Ok(store)
    }

    /// Create the indexes for one namespace. Idempotent.
    pub async fn init_namespace(&self, namespace: &str) -> Result<()> {
        let events = collection_name(namespace, EVENTS_COLLECTION);
        self.db
            .create_index(
                &events,
                IndexSpec::new("events_event_type", doc! { "events.event_type": 1 }),
            )
            .await
            .map_err(|e| EventStoreError::storage(Operation::Init, e))?;
        info!(namespace, collection = %events, "Embedded event store initialized");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.db
            .ping()
            .await
            .map_err(|e| EventStoreError::storage(Operation::Init, e))
    }

    pub async fn close(&self) -> Result<()> {
        self.db
            .close()
            .await
            .map_err(|e| EventStoreError::storage(Operation::Init, e))
    }

    async fn find_aggregate(
        &self,
        op: Operation,
        namespace: &str,
        stream_id: Uuid,
    ) -> Result<AggregateRecord> {
        let mut session = self
            .db
            .session()
            .await
            .map_err(|e| EventStoreError::storage(op, e).with_stream(stream_id))?;
        let document = session
            .find_one(
                &collection_name(namespace, EVENTS_COLLECTION),
                doc! { "_id": stream_id.to_string() },
            )
            .await
            .map_err(|e| EventStoreError::storage(op, e).with_stream(stream_id))?
            .ok_or_else(|| {
                EventStoreError::new(op, ErrorKind::StreamNotFound).with_stream(stream_id)
            })?;
        AggregateRecord::from_document(document)
            .map_err(|e| EventStoreError::codec(op, e).with_stream(stream_id))
    }
}

#[async_trait]
impl EventStore for EmbeddedStore {
    async fn save(
        &self,
        namespace: &str,
        events: Vec<Event>,
        original_version: u64,
    ) -> Result<()> {
        let stream = batch::validate(&events, original_version)?;
        let stream_id = stream.stream_id;
        let conflict = || {
            EventStoreError::new(Operation::Save, ErrorKind::VersionConflict)
                .with_stream(stream_id)
                .with_version(original_version)
        };
        let storage =
            |e: DriverError| EventStoreError::storage(Operation::Save, e).with_stream(stream_id);

        let mut records = Vec::with_capacity(events.len());
        for event in &events {
            let record = codec::encode(event).map_err(|e| {
                EventStoreError::codec(Operation::Save, e)
                    .with_stream(stream_id)
                    .with_version(event.version())
            })?;
            records.push(record);
        }
        let count = records.len() as i64;
        let collection = collection_name(namespace, EVENTS_COLLECTION);
        let now = bson::DateTime::now();
        let mut session = self.db.session().await.map_err(storage)?;

        if original_version == 0 {
            let aggregate = AggregateRecord {
                id: stream_id.to_string(),
                stream_type: stream.stream_type.clone(),
                version: count,
                events: records,
                updated_at: Some(now),
            };
            let document = aggregate
                .to_document()
                .map_err(|e| EventStoreError::codec(Operation::Save, e).with_stream(stream_id))?;
            match session.insert_one(&collection, document).await {
                Ok(_) => {}
                Err(e) if e.duplicate_index().is_some() => return Err(conflict()),
                Err(e) => return Err(storage(e)),
            }
        } else {
            let mut embedded = Vec::with_capacity(records.len());
            for record in &records {
                let document = record.to_document().map_err(|e| {
                    EventStoreError::codec(Operation::Save, e).with_stream(stream_id)
                })?;
                embedded.push(Bson::Document(document));
            }
            let outcome = session
                .update_one(
                    &collection,
                    doc! { "_id": stream_id.to_string(), "version": original_version as i64 },
                    doc! {
                        "$push": { "events": { "$each": embedded } },
                        "$inc": { "version": count },
                        "$set": { "updated_at": now },
                    },
                    false,
                )
                .await
                .map_err(storage)?;
            if outcome.matched == 0 {
                return Err(conflict());
            }
        }

        debug!(
            namespace,
            stream_id = %stream_id,
            version = stream.last_version,
            count,
            "Saved events"
        );
        notify_handler(self.handler.as_ref(), events).await
    }

    async fn load_from(
        &self,
        namespace: &str,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<Event>> {
        let aggregate = self
            .find_aggregate(Operation::Load, namespace, stream_id)
            .await?;

        let mut events = Vec::with_capacity(aggregate.events.len());
        for record in aggregate.events {
            if record.version < from_version as i64 {
                continue;
            }
            let version = record.version;
            let event = self.registry.decode(record).map_err(|e| {
                EventStoreError::codec(Operation::Load, e)
                    .with_stream(stream_id)
                    .with_version(version.max(0) as u64)
            })?;
            events.push(event);
        }

        debug!(namespace, stream_id = %stream_id, count = events.len(), "Loaded events");
        Ok(events)
    }

    async fn stream_info(&self, namespace: &str, stream_id: Uuid) -> Result<StreamInfo> {
        let aggregate = self
            .find_aggregate(Operation::Load, namespace, stream_id)
            .await?;
        Ok(StreamInfo {
            stream_id,
            stream_type: aggregate.stream_type,
            version: aggregate.version.max(0) as u64,
            position: None,
            updated_at: aggregate.updated_at.map(|t| t.to_chrono()),
        })
    }
}
