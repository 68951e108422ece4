use async_trait::async_trait;
use bson::doc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::EmbeddedStore;
use crate::codec::{self, AggregateRecord, EventRecord};
use crate::driver::{DriverError, Session};
use crate::event::Event;
use crate::store::{
    collection_name, finish, ErrorKind, EventStoreError, EventStoreMaintenance, Operation, Result,
    EVENTS_COLLECTION, SNAPSHOTS_COLLECTION,
};

#[async_trait]
impl EventStoreMaintenance for EmbeddedStore {
    async fn replace(&self, namespace: &str, event: Event) -> Result<()> {
        let stream_id = event.stream_id();
        let version = event.version();
        let record = codec::encode(&event).map_err(|e| {
            EventStoreError::codec(Operation::Replace, e)
                .with_stream(stream_id)
                .with_version(version)
        })?;
        let collection = collection_name(namespace, EVENTS_COLLECTION);

        let mut tx = self.db.begin().await.map_err(|e| {
            EventStoreError::storage(Operation::Replace, e).with_stream(stream_id)
        })?;
        let result = replace_in(tx.as_mut(), &collection, stream_id, record).await;
        finish(Operation::Replace, tx, result)
            .await
            .map_err(|e| e.with_stream(stream_id))?;

        info!(namespace, stream_id = %stream_id, version, "Replaced event");
        Ok(())
    }

    async fn rename_event(&self, namespace: &str, from: &str, to: &str) -> Result<()> {
        let collection = collection_name(namespace, EVENTS_COLLECTION);
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| EventStoreError::storage(Operation::RenameEvent, e))?;
        let result = rename_in(tx.as_mut(), &collection, from, to).await;
        let streams = finish(Operation::RenameEvent, tx, result).await?;

        info!(namespace, from, to, streams, "Renamed event type");
        Ok(())
    }

    async fn remove(&self, namespace: &str, stream_id: Uuid) -> Result<()> {
        let storage =
            |e: DriverError| EventStoreError::storage(Operation::Remove, e).with_stream(stream_id);
        let id = stream_id.to_string();

        let mut tx = self.db.begin().await.map_err(storage)?;
        let deleted = match tx
            .delete_many(
                &collection_name(namespace, EVENTS_COLLECTION),
                doc! { "_id": id.as_str() },
            )
            .await
        {
            Ok(deleted) => deleted,
            Err(e) => return finish(Operation::Remove, tx, Err(storage(e))).await,
        };
        finish(Operation::Remove, tx, Ok(())).await?;
        if deleted == 0 {
            debug!(namespace, stream_id = %stream_id, "Stream already absent");
        }

        let mut tx = self.db.begin().await.map_err(storage)?;
        match tx
            .delete_many(
                &collection_name(namespace, SNAPSHOTS_COLLECTION),
                doc! { "stream_id": id.as_str() },
            )
            .await
        {
            Ok(snapshots) => {
                finish(Operation::Remove, tx, Ok(())).await?;
                debug!(namespace, stream_id = %stream_id, snapshots, "Removed snapshots");
            }
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "Snapshot removal failed");
                return finish(Operation::Remove, tx, Err(storage(e))).await;
            }
        }

        info!(namespace, stream_id = %stream_id, "Removed stream");
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        self.db
            .drop_collection(&collection_name(namespace, EVENTS_COLLECTION))
            .await
            .map_err(|e| EventStoreError::storage(Operation::Clear, e))?;
        self.init_namespace(namespace)
            .await
            .map_err(|e| EventStoreError { op: Operation::Clear, ..e })?;
        warn!(namespace, "Cleared event store");
        Ok(())
    }
}

/// Swap the event at `record.version` inside the stream document.
async fn replace_in(
    session: &mut dyn Session,
    collection: &str,
    stream_id: Uuid,
    record: EventRecord,
) -> Result<()> {
    let op = Operation::Replace;
    let version = record.version.max(0) as u64;
    let document = session
        .find_one(collection, doc! { "_id": stream_id.to_string() })
        .await
        .map_err(|e| EventStoreError::storage(op, e))?
        .ok_or_else(|| EventStoreError::new(op, ErrorKind::StreamNotFound))?;
    let mut aggregate =
        AggregateRecord::from_document(document).map_err(|e| EventStoreError::codec(op, e))?;

    let slot = aggregate
        .events
        .iter_mut()
        .find(|existing| existing.version == record.version)
        .ok_or_else(|| EventStoreError::new(op, ErrorKind::EventNotFound).with_version(version))?;
    *slot = record;

    let replacement = aggregate
        .to_document()
        .map_err(|e| EventStoreError::codec(op, e))?;
    let outcome = session
        .replace_one(
            collection,
            doc! { "_id": aggregate.id.as_str(), "version": aggregate.version },
            replacement,
        )
        .await
        .map_err(|e| EventStoreError::storage(op, e))?;
    if outcome.matched == 0 {
        return Err(EventStoreError::new(op, ErrorKind::VersionConflict).with_version(version));
    }
    Ok(())
}

/// Retag every embedded event of type `from`. Returns the number of streams
/// touched.
async fn rename_in(
    session: &mut dyn Session,
    collection: &str,
    from: &str,
    to: &str,
) -> Result<u64> {
    let op = Operation::RenameEvent;
    let documents = session
        .find(collection, doc! { "events.event_type": from }, None)
        .await
        .map_err(|e| EventStoreError::storage(op, e))?;

    let mut touched = 0;
    for document in documents {
        let mut aggregate =
            AggregateRecord::from_document(document).map_err(|e| EventStoreError::codec(op, e))?;
        for event in aggregate.events.iter_mut().filter(|e| e.event_type == from) {
            event.event_type = to.to_string();
        }
        let replacement = aggregate
            .to_document()
            .map_err(|e| EventStoreError::codec(op, e))?;
        session
            .replace_one(
                collection,
                doc! { "_id": aggregate.id.as_str(), "version": aggregate.version },
                replacement,
            )
            .await
            .map_err(|e| EventStoreError::storage(op, e))?;
        touched += 1;
    }
    Ok(touched)
}
