use async_trait::async_trait;
use bson::{doc, Bson, Document};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Collections, NormalizedStore};
use crate::codec::{self, EventRecord};
use crate::driver::{DriverError, Session};
use crate::event::{Event, POSITION_KEY};
use crate::store::{
    finish, ErrorKind, EventStoreError, EventStoreMaintenance, Operation, Result,
};

#[async_trait]
impl EventStoreMaintenance for NormalizedStore {
    async fn replace(&self, namespace: &str, event: Event) -> Result<()> {
        let stream_id = event.stream_id();
        let version = event.version();
        let record = codec::encode(&event).map_err(|e| {
            EventStoreError::codec(Operation::Replace, e)
                .with_stream(stream_id)
                .with_version(version)
        })?;
        let collections = Collections::new(namespace);

        let mut tx = self.db.begin().await.map_err(|e| {
            EventStoreError::storage(Operation::Replace, e).with_stream(stream_id)
        })?;
        let result = replace_in(tx.as_mut(), &collections, stream_id, record).await;
        let position = finish(Operation::Replace, tx, result)
            .await
            .map_err(|e| e.with_stream(stream_id).with_version(version))?;

        info!(namespace, stream_id = %stream_id, version, position, "Replaced event");
        Ok(())
    }

    async fn rename_event(&self, namespace: &str, from: &str, to: &str) -> Result<()> {
        let collections = Collections::new(namespace);
        let storage = |e: DriverError| EventStoreError::storage(Operation::RenameEvent, e);

        let mut tx = self.db.begin().await.map_err(storage)?;
        let result = tx
            .update_many(
                &collections.events,
                doc! { "event_type": from },
                doc! { "$set": { "event_type": to } },
            )
            .await
            .map_err(storage);
        let outcome = finish(Operation::RenameEvent, tx, result).await?;

        info!(namespace, from, to, events = outcome.modified, "Renamed event type");
        Ok(())
    }

    async fn remove(&self, namespace: &str, stream_id: Uuid) -> Result<()> {
        let collections = Collections::new(namespace);
        let id = stream_id.to_string();

        let streams = self
            .delete_in_tx(stream_id, &collections.streams, doc! { "_id": id.as_str() })
            .await?;
        let events = self
            .delete_in_tx(stream_id, &collections.events, doc! { "stream_id": id.as_str() })
            .await?;
        let snapshots = self
            .delete_in_tx(stream_id, &collections.snapshots, doc! { "stream_id": id.as_str() })
            .await
            .inspect_err(|e| warn!(stream_id = %stream_id, error = %e, "Snapshot removal failed"))?;

        if streams == 0 {
            debug!(namespace, stream_id = %stream_id, "Stream summary already absent");
        }
        info!(namespace, stream_id = %stream_id, events, snapshots, "Removed stream");
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        let collections = Collections::new(namespace);
        for collection in [&collections.events, &collections.streams] {
            self.db
                .drop_collection(collection)
                .await
                .map_err(|e| EventStoreError::storage(Operation::Clear, e))?;
        }
        self.init_namespace(namespace)
            .await
            .map_err(|e| EventStoreError { op: Operation::Clear, ..e })?;
        warn!(namespace, "Cleared event store");
        Ok(())
    }
}

impl NormalizedStore {
    /// Delete every match in its own transaction. Finding nothing is fine.
    async fn delete_in_tx(
        &self,
        stream_id: Uuid,
        collection: &str,
        filter: Document,
    ) -> Result<u64> {
        let storage =
            |e: DriverError| EventStoreError::storage(Operation::Remove, e).with_stream(stream_id);
        let mut tx = self.db.begin().await.map_err(storage)?;
        let result = tx.delete_many(collection, filter).await.map_err(storage);
        finish(Operation::Remove, tx, result).await
    }
}

/// Overwrite the event at `(stream_id, record.version)`, keeping its global
/// position. Returns that position.
async fn replace_in(
    session: &mut dyn Session,
    collections: &Collections,
    stream_id: Uuid,
    mut record: EventRecord,
) -> Result<i64> {
    let op = Operation::Replace;
    let storage = |e: DriverError| EventStoreError::storage(op, e);
    let id = stream_id.to_string();

    let streams = session
        .count(&collections.streams, doc! { "_id": id.as_str() })
        .await
        .map_err(storage)?;
    if streams == 0 {
        return Err(EventStoreError::new(op, ErrorKind::StreamNotFound));
    }

    let existing = session
        .find_one(
            &collections.events,
            doc! { "stream_id": id.as_str(), "version": record.version },
        )
        .await
        .map_err(storage)?
        .ok_or_else(|| EventStoreError::new(op, ErrorKind::EventNotFound))?;
    let position = match existing.get("_id") {
        Some(Bson::Int64(position)) => *position,
        Some(Bson::Int32(position)) => i64::from(*position),
        other => {
            return Err(storage(DriverError::InvalidOperation(format!(
                "event has no numeric position: {other:?}"
            ))))
        }
    };

    record.position = Some(position);
    record.metadata.insert(POSITION_KEY, position);
    let replacement = record
        .to_document()
        .map_err(|e| EventStoreError::codec(op, e))?;
    session
        .replace_one(&collections.events, doc! { "_id": position }, replacement)
        .await
        .map_err(storage)?;
    Ok(position)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::EventRegistry;
    use crate::driver::{Database, MemoryDatabase};
    use crate::store::{EventStore, StoreOptions, SNAPSHOTS_COLLECTION};

    async fn store_with(db: &MemoryDatabase) -> NormalizedStore {
        NormalizedStore::open(
            Arc::new(db.clone()),
            Arc::new(EventRegistry::empty()),
            StoreOptions::new(),
        )
        .await
        .unwrap()
    }

    fn placed(stream_id: Uuid, version: u64) -> Event {
        Event::new("Placed", "order", stream_id, version)
    }

    #[tokio::test]
    async fn test_replace_keeps_position() {
        let db = MemoryDatabase::new();
        let store = store_with(&db).await;
        let other = Uuid::new_v4();
        let id = Uuid::new_v4();
        store.save("", vec![placed(other, 1)], 0).await.unwrap();
        store
            .save("", vec![placed(id, 1), placed(id, 2)], 0)
            .await
            .unwrap();

        store
            .replace("", Event::new("Corrected", "order", id, 2))
            .await
            .unwrap();

        let loaded = store.load("", id).await.unwrap();
        assert_eq!(loaded[1].event_type(), "Corrected");
        assert_eq!(loaded[1].position(), Some(3));
        assert_eq!(store.global_position("").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_replace_missing_event() {
        let db = MemoryDatabase::new();
        let store = store_with(&db).await;
        let id = Uuid::new_v4();

        let err = store.replace("", placed(id, 1)).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::StreamNotFound));

        store.save("", vec![placed(id, 1)], 0).await.unwrap();
        let err = store.replace("", placed(id, 2)).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::EventNotFound));
        assert_eq!(err.version, Some(2));
    }

    #[tokio::test]
    async fn test_remove_deletes_all_three_parts() {
        let db = MemoryDatabase::new();
        let store = store_with(&db).await;
        let id = Uuid::new_v4();
        let kept = Uuid::new_v4();
        store.save("", vec![placed(id, 1), placed(id, 2)], 0).await.unwrap();
        store.save("", vec![placed(kept, 1)], 0).await.unwrap();
        let mut session = db.session().await.unwrap();
        session
            .insert_one(SNAPSHOTS_COLLECTION, doc! { "stream_id": id.to_string() })
            .await
            .unwrap();

        store.remove("", id).await.unwrap();

        assert!(store.stream_info("", id).await.unwrap_err().is_not_found());
        assert!(store.load("", id).await.unwrap_err().is_not_found());
        assert_eq!(db.document_count(SNAPSHOTS_COLLECTION).await, 0);
        assert_eq!(store.load("", kept).await.unwrap().len(), 1);
        // Counter document survives.
        assert_eq!(store.global_position("").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_clear_resets_counter() {
        let db = MemoryDatabase::new();
        let store = store_with(&db).await;
        let id = Uuid::new_v4();
        store.save("", vec![placed(id, 1)], 0).await.unwrap();

        store.clear("").await.unwrap();

        assert_eq!(store.global_position("").await.unwrap(), 0);
        store.save("", vec![placed(id, 1)], 0).await.unwrap();
        assert_eq!(store.load("", id).await.unwrap()[0].position(), Some(1));
    }
}
