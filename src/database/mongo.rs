//! MongoDB connector using the official async driver.

use crate::database::connection_string::{ConnectionBuilder, ConnectionTarget, DocumentTarget};
use crate::database::descriptor::{BackendKind, ConnectionDescriptor};
use crate::database::result::{CollectionInfo, WriteSummary};
use crate::database::traits::{Connector, DocumentBackend};
use crate::error::{DatabaseError, DbResult};
use crate::security::SanitizedQuery;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::Client;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

const APP_NAME: &str = "db-gateway";

/// Builds one `mongodb::Client` (and thus one driver-managed pool) per descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoConnector;

impl MongoConnector {
    pub fn new() -> Self {
        Self
    }

    async fn client(target: &DocumentTarget) -> DbResult<Client> {
        let mut options = ClientOptions::parse(&target.uri)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        options.app_name = Some(APP_NAME.to_string());
        options.max_pool_size = Some(target.pool.max_size);
        options.min_pool_size = Some(target.pool.min_size);
        options.max_idle_time = Some(target.pool.idle_timeout);
        options.connect_timeout = Some(target.pool.connect_timeout);
        options.server_selection_timeout = Some(target.pool.connect_timeout);

        Client::with_options(options).map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))
    }

    async fn ping(client: &Client) -> DbResult<()> {
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| DatabaseError::ProbeFailed(e.to_string()))
    }
}

/// A live MongoDB client.
pub struct MongoHandle {
    client: Client,
    endpoint: String,
}

impl MongoHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn collection(&self, database: &str, collection: &str) -> mongodb::Collection<Document> {
        self.client.database(database).collection::<Document>(collection)
    }
}

#[async_trait]
impl Connector for MongoConnector {
    type Handle = MongoHandle;

    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    #[instrument(skip(self, descriptor), fields(connection_id = %descriptor.id))]
    async fn build(&self, descriptor: &ConnectionDescriptor) -> DbResult<MongoHandle> {
        let target = match ConnectionBuilder::build(descriptor)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
        {
            ConnectionTarget::Document(target) => target,
            ConnectionTarget::Relational(_) => {
                return Err(DatabaseError::ConnectionFailed(
                    "descriptor does not describe a document store".into(),
                ));
            }
        };

        info!("Connecting to MongoDB at {}", target.endpoint());
        let client = Self::client(&target).await?;

        // Client creation is lazy; the ping forces server selection and auth.
        if let Err(e) = Self::ping(&client).await {
            client.shutdown().await;
            return Err(DatabaseError::ConnectionFailed(e.to_string()));
        }

        info!(
            "MongoDB client ready with pool {}..{}",
            target.pool.min_size, target.pool.max_size
        );
        Ok(MongoHandle {
            client,
            endpoint: target.endpoint().to_string(),
        })
    }

    async fn probe(&self, handle: &MongoHandle) -> DbResult<()> {
        Self::ping(&handle.client).await
    }

    async fn close(&self, handle: &MongoHandle) {
        debug!("Shutting down MongoDB client for {}", handle.endpoint);
        handle.client.clone().shutdown().await;
    }
}

#[async_trait]
impl DocumentBackend for MongoHandle {
    #[instrument(skip(self), fields(db = "mongodb"))]
    async fn list_databases(&self) -> DbResult<Vec<String>> {
        let mut names = self
            .client
            .list_database_names()
            .await
            .map_err(mongo_error)?;
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(db = "mongodb"))]
    async fn list_collections(&self, database: &str) -> DbResult<Vec<CollectionInfo>> {
        let db = self.client.database(database);
        let names = db.list_collection_names().await.map_err(mongo_error)?;

        let mut collections = Vec::with_capacity(names.len());
        for name in names {
            let info = match db.run_command(doc! { "collStats": name.as_str() }).await {
                Ok(stats) => CollectionInfo {
                    count: number(&stats, "count"),
                    size_bytes: number(&stats, "size"),
                    avg_object_size: number(&stats, "avgObjSize"),
                    name,
                },
                Err(e) => {
                    // Views and restricted roles reject collStats.
                    debug!("collStats unavailable for {}: {}", name, e);
                    let count = db
                        .collection::<Document>(&name)
                        .estimated_document_count()
                        .await
                        .unwrap_or(0);
                    CollectionInfo {
                        name,
                        count,
                        size_bytes: 0,
                        avg_object_size: 0,
                    }
                }
            };
            collections.push(info);
        }

        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(collections)
    }

    #[instrument(skip(self, query), fields(db = "mongodb"))]
    async fn find(
        &self,
        database: &str,
        collection: &str,
        query: &SanitizedQuery,
    ) -> DbResult<(Vec<Value>, u64)> {
        let coll = self.collection(database, collection);
        let filter = to_document(&query.filter)?;

        let total = coll
            .count_documents(filter.clone())
            .await
            .map_err(mongo_error)?;

        let mut find = coll.find(filter).skip(query.skip).limit(query.limit);
        if !query.sort.is_empty() {
            find = find.sort(to_document(&query.sort)?);
        }
        if !query.projection.is_empty() {
            find = find.projection(to_document(&query.projection)?);
        }

        let documents: Vec<Document> = find
            .await
            .map_err(mongo_error)?
            .try_collect()
            .await
            .map_err(mongo_error)?;

        debug!("Fetched {} of {} documents", documents.len(), total);
        Ok((documents.into_iter().map(to_json).collect(), total))
    }

    #[instrument(skip(self, pipeline), fields(db = "mongodb", stages = pipeline.len()))]
    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> DbResult<Vec<Value>> {
        let stages = pipeline
            .iter()
            .map(|stage| match stage {
                Value::Object(map) => to_document(map),
                _ => Err(DatabaseError::QueryFailed(
                    "pipeline stage is not an object".into(),
                )),
            })
            .collect::<DbResult<Vec<Document>>>()?;

        let documents: Vec<Document> = self
            .collection(database, collection)
            .aggregate(stages)
            .await
            .map_err(mongo_error)?
            .try_collect()
            .await
            .map_err(mongo_error)?;

        Ok(documents.into_iter().map(to_json).collect())
    }

    #[instrument(skip(self, document), fields(db = "mongodb"))]
    async fn insert_one(
        &self,
        database: &str,
        collection: &str,
        document: &Map<String, Value>,
    ) -> DbResult<WriteSummary> {
        let result = self
            .collection(database, collection)
            .insert_one(to_document(document)?)
            .await
            .map_err(mongo_error)?;
        Ok(WriteSummary::inserted(result.inserted_id.into_relaxed_extjson()))
    }

    #[instrument(skip(self, filter, update), fields(db = "mongodb"))]
    async fn update_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Map<String, Value>,
        update: &Map<String, Value>,
    ) -> DbResult<WriteSummary> {
        let result = self
            .collection(database, collection)
            .update_many(to_document(filter)?, to_document(update)?)
            .await
            .map_err(mongo_error)?;
        Ok(WriteSummary::updated(
            result.matched_count,
            result.modified_count,
        ))
    }

    #[instrument(skip(self, filter), fields(db = "mongodb"))]
    async fn delete_many(
        &self,
        database: &str,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> DbResult<WriteSummary> {
        let result = self
            .collection(database, collection)
            .delete_many(to_document(filter)?)
            .await
            .map_err(mongo_error)?;
        Ok(WriteSummary::deleted(result.deleted_count))
    }
}

/// Parse a JSON object as Extended JSON, so `{"$oid": ...}` and friends become BSON types.
fn to_document(map: &Map<String, Value>) -> DbResult<Document> {
    Document::try_from(map.clone()).map_err(|e| DatabaseError::QueryFailed(e.to_string()))
}

fn to_json(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

/// Read a numeric stats field regardless of its BSON width.
fn number(document: &Document, key: &str) -> u64 {
    match document.get(key) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) if *n > 0.0 => *n as u64,
        _ => 0,
    }
}

fn mongo_error(e: mongodb::error::Error) -> DatabaseError {
    match *e.kind {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::Authentication { .. } => {
            warn!("MongoDB connection error: {}", e);
            DatabaseError::ConnectionFailed(e.to_string())
        }
        _ => DatabaseError::Mongo(e.to_string()),
    }
}
