//! MongoDB storage driver.
//!
//! Requires a replica set: the normalized store uses multi-document
//! transactions and the change feed uses change streams. Reads and writes
//! use majority concerns so committed events survive failover and tailers
//! never observe writes that could roll back.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::{Stream, TryStreamExt};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    Acknowledgment, ClientOptions, FullDocumentType, IndexOptions, ReadConcern, ReadPreference,
    ReturnDocument, SelectionCriteria, WriteConcern,
};
use mongodb::{Client, ClientSession, Collection, IndexModel};
use tracing::{debug, info};

use super::{
    ChangeCursor, ChangeEvent, ChangeOperation, ChangeStream, Database, DriverError, IndexSpec, Result,
    ResumeToken, Session, UpdateOutcome,
};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// MongoDB-backed [`Database`].
#[derive(Clone)]
pub struct MongoDatabase {
    client: Client,
    database: mongodb::Database,
}

impl MongoDatabase {
    /// Connect to `uri` and verify the deployment is reachable.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.write_concern = Some(
            WriteConcern::builder()
                .w(Acknowledgment::Majority)
                .build(),
        );
        options.read_concern = Some(ReadConcern::majority());
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            ReadPreference::Primary,
        ));

        let client = Client::with_options(options)?;
        let db = Self::from_client(client, database);
        db.ping().await?;

        info!(database, "Connected to MongoDB");
        Ok(db)
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client, database: &str) -> Self {
        Self {
            database: client.database(database),
            client,
        }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }
}

/// Map a write error with code 11000 to [`DriverError::DuplicateKey`].
fn map_write_error(collection: &str, error: mongodb::error::Error) -> DriverError {
    let duplicate = match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE => {
            Some(write.message.clone())
        }
        ErrorKind::InsertMany(failure) => failure.write_errors.as_ref().and_then(|errors| {
            errors
                .iter()
                .find(|e| e.code == DUPLICATE_KEY_CODE)
                .map(|e| e.message.clone())
        }),
        ErrorKind::Command(command) if command.code == DUPLICATE_KEY_CODE => {
            Some(command.message.clone())
        }
        _ => None,
    };

    match duplicate {
        Some(message) => DriverError::DuplicateKey {
            collection: collection.to_string(),
            index: index_name(&message).unwrap_or("_id_").to_string(),
        },
        None => DriverError::Mongo(error),
    }
}

/// Extract the index name from an E11000 message
/// (`... index: stream_version dup key: { ... }`).
fn index_name(message: &str) -> Option<&str> {
    let rest = message.split("index: ").nth(1)?;
    rest.split_whitespace().next()
}

#[async_trait]
impl Database for MongoDatabase {
    async fn session(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(MongoSession {
            database: self.clone(),
            session: None,
        }))
    }

    async fn begin(&self) -> Result<Box<dyn Session>> {
        let mut session = self.client.start_session().await?;
        session
            .start_transaction()
            .read_concern(ReadConcern::majority())
            .write_concern(WriteConcern::majority())
            .await?;
        Ok(Box::new(MongoSession {
            database: self.clone(),
            session: Some(session),
        }))
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<()> {
        let model = IndexModel::builder()
            .keys(index.keys)
            .options(
                IndexOptions::builder()
                    .name(index.name.clone())
                    .unique(index.unique)
                    .build(),
            )
            .build();
        self.collection(collection).create_index(model).await?;
        debug!(collection, index = %index.name, "Ensured index");
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.collection(collection).drop().await?;
        Ok(())
    }

    async fn watch(
        &self,
        collection: &str,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream> {
        let resume: Option<mongodb::change_stream::event::ResumeToken> = match resume_after {
            Some(token) => Some(bson::from_bson(token.into_bson())?),
            None => None,
        };
        // start_after also accepts the token of an invalidate event, which
        // a dropped collection leaves behind.
        let events = self.collection(collection);
        let mut watch = events.watch().full_document(FullDocumentType::UpdateLookup);
        if let Some(token) = resume {
            watch = watch.start_after(token);
        }
        let stream = watch.await?;

        Ok(Box::new(MongoChangeStream {
            collection: collection.to_string(),
            inner: Box::pin(stream),
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.database.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

struct MongoChangeStream {
    collection: String,
    inner: Pin<Box<mongodb::change_stream::ChangeStream<ChangeStreamEvent<Document>>>>,
}

impl Stream for MongoChangeStream {
    type Item = Result<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let next = this.inner.as_mut().poll_next(cx);
        next.map(|event| {
            event.map(|event| {
                event
                    .map_err(DriverError::from)
                    .and_then(|event| to_change_event(&this.collection, event))
            })
        })
    }
}

impl ChangeCursor for MongoChangeStream {
    fn resume_token(&self) -> Option<ResumeToken> {
        let token = self.inner.resume_token()?;
        bson::to_bson(&token).ok().map(ResumeToken::from_bson)
    }
}

fn to_change_event(collection: &str, event: ChangeStreamEvent<Document>) -> Result<ChangeEvent> {
    let operation = match event.operation_type {
        OperationType::Insert => ChangeOperation::Insert,
        OperationType::Update => ChangeOperation::Update,
        OperationType::Replace => ChangeOperation::Replace,
        OperationType::Delete => ChangeOperation::Delete,
        OperationType::Drop => ChangeOperation::Drop,
        other => ChangeOperation::Other(format!("{other:?}")),
    };
    Ok(ChangeEvent {
        token: ResumeToken::from_bson(bson::to_bson(&event.id)?),
        operation,
        collection: event
            .ns
            .and_then(|ns| ns.coll)
            .unwrap_or_else(|| collection.to_string()),
        document_key: event.document_key,
        full_document: event.full_document,
    })
}

// ============================================================================
// Sessions
// ============================================================================

/// Session over a [`MongoDatabase`]. Holds a client session only while a
/// transaction is open.
pub struct MongoSession {
    database: MongoDatabase,
    session: Option<ClientSession>,
}

#[async_trait]
impl Session for MongoSession {
    async fn find_one(&mut self, collection: &str, filter: Document) -> Result<Option<Document>> {
        let coll = self.database.collection(collection);
        let found = match self.session.as_mut() {
            Some(session) => coll.find_one(filter).session(session).await?,
            None => coll.find_one(filter).await?,
        };
        Ok(found)
    }

    async fn find(
        &mut self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
    ) -> Result<Vec<Document>> {
        let coll = self.database.collection(collection);
        let mut documents = Vec::new();
        match self.session.as_mut() {
            Some(session) => {
                let mut cursor = match sort {
                    Some(sort) => coll.find(filter).sort(sort).session(&mut *session).await?,
                    None => coll.find(filter).session(&mut *session).await?,
                };
                while cursor.advance(session).await? {
                    documents.push(cursor.deserialize_current()?);
                }
            }
            None => {
                let cursor = match sort {
                    Some(sort) => coll.find(filter).sort(sort).await?,
                    None => coll.find(filter).await?,
                };
                documents = cursor.try_collect().await?;
            }
        }
        Ok(documents)
    }

    async fn count(&mut self, collection: &str, filter: Document) -> Result<u64> {
        let coll = self.database.collection(collection);
        let count = match self.session.as_mut() {
            Some(session) => coll.count_documents(filter).session(session).await?,
            None => coll.count_documents(filter).await?,
        };
        Ok(count)
    }

    async fn insert_one(&mut self, collection: &str, document: Document) -> Result<Bson> {
        let coll = self.database.collection(collection);
        let result = match self.session.as_mut() {
            Some(session) => coll.insert_one(document).session(session).await,
            None => coll.insert_one(document).await,
        };
        result
            .map(|r| r.inserted_id)
            .map_err(|e| map_write_error(collection, e))
    }

    async fn insert_many(
        &mut self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Bson>> {
        let count = documents.len();
        let coll = self.database.collection(collection);
        let result = match self.session.as_mut() {
            Some(session) => coll.insert_many(documents).session(session).await,
            None => coll.insert_many(documents).await,
        };
        let mut inserted = result
            .map_err(|e| map_write_error(collection, e))?
            .inserted_ids;
        (0..count)
            .map(|i| {
                inserted.remove(&i).ok_or_else(|| {
                    DriverError::InvalidOperation(format!(
                        "insert_many into {collection} returned no id for document {i}"
                    ))
                })
            })
            .collect()
    }

    async fn update_one(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let coll = self.database.collection(collection);
        let result = match self.session.as_mut() {
            Some(session) => {
                coll.update_one(filter, update)
                    .upsert(upsert)
                    .session(session)
                    .await
            }
            None => coll.update_one(filter, update).upsert(upsert).await,
        }
        .map_err(|e| map_write_error(collection, e))?;
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: result.upserted_id.is_some(),
        })
    }

    async fn update_many(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<UpdateOutcome> {
        let coll = self.database.collection(collection);
        let result = match self.session.as_mut() {
            Some(session) => coll.update_many(filter, update).session(session).await,
            None => coll.update_many(filter, update).await,
        }
        .map_err(|e| map_write_error(collection, e))?;
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: false,
        })
    }

    async fn find_one_and_update(
        &mut self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<Option<Document>> {
        let coll = self.database.collection(collection);
        let result = match self.session.as_mut() {
            Some(session) => {
                coll.find_one_and_update(filter, update)
                    .upsert(upsert)
                    .return_document(ReturnDocument::Before)
                    .session(session)
                    .await
            }
            None => {
                coll.find_one_and_update(filter, update)
                    .upsert(upsert)
                    .return_document(ReturnDocument::Before)
                    .await
            }
        };
        result.map_err(|e| map_write_error(collection, e))
    }

    async fn replace_one(
        &mut self,
        collection: &str,
        filter: Document,
        replacement: Document,
    ) -> Result<UpdateOutcome> {
        let coll = self.database.collection(collection);
        let result = match self.session.as_mut() {
            Some(session) => coll.replace_one(filter, replacement).session(session).await,
            None => coll.replace_one(filter, replacement).await,
        }
        .map_err(|e| map_write_error(collection, e))?;
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: false,
        })
    }

    async fn delete_many(&mut self, collection: &str, filter: Document) -> Result<u64> {
        let coll = self.database.collection(collection);
        let result = match self.session.as_mut() {
            Some(session) => coll.delete_many(filter).session(session).await?,
            None => coll.delete_many(filter).await?,
        };
        Ok(result.deleted_count)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if let Some(mut session) = self.session {
            session.commit_transaction().await?;
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        if let Some(mut session) = self.session {
            session.abort_transaction().await?;
        }
        Ok(())
    }
}
