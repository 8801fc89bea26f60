use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions, ReturnDocument, ServerApi, ServerApiVersion,
    UpdateOptions,
};
use mongodb::{Client, Database};
use opentelemetry::KeyValue;
use serde::Serialize;
use uuid::Uuid;

use super::constant::JOBS_COLLECTION;
use super::error::DatabaseError;
use super::JobStore;
use crate::types::jobs::job_item::JobItem;
use crate::types::params::DatabaseArgs;
use crate::utils::metrics::ORCHESTRATOR_METRICS;

/// MongoDB-backed job store.
///
/// Single-document atomic operations (`find_one_and_update` with
/// `ReturnDocument::After`) are the only concurrency mechanism; there are no
/// transactions and no sessions.
pub struct MongoDbClient {
    #[allow(dead_code)]
    client: Client,
    database: Arc<Database>,
}

pub trait ToDocument {
    fn to_document(&self) -> Result<Document, DatabaseError>;
}

impl<T: Serialize> ToDocument for T {
    fn to_document(&self) -> Result<Document, DatabaseError> {
        let doc = mongodb::bson::to_bson(self)?;

        if let Bson::Document(doc) = doc {
            Ok(doc)
        } else {
            Err(DatabaseError::FailedToSerializeDocument(format!("Failed to serialize item to document: {:?}", doc)))
        }
    }
}

impl MongoDbClient {
    pub async fn new(args: &DatabaseArgs) -> Result<Self, DatabaseError> {
        let mut client_options = ClientOptions::parse(&args.connection_uri).await?;
        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);
        let client = Client::with_options(client_options)?;

        // Fail fast if the deployment is unreachable.
        client.database("admin").run_command(doc! {"ping": 1}, None).await?;
        tracing::debug!(database = %args.database_name, "database client connected");

        let database = Arc::new(client.database(&args.database_name));
        Ok(Self { client, database })
    }

    fn get_job_collection(&self) -> mongodb::Collection<JobItem> {
        self.database.collection(JOBS_COLLECTION)
    }

    /// Stamp `updated_at` and bump `version` on every mutation so readers
    /// can tell stale claims from fresh ones.
    fn with_audit_fields(mut update: Document) -> Document {
        let now = Bson::DateTime(Utc::now().into());
        match update.get_document_mut("$set") {
            Ok(set) => {
                set.insert("updated_at", now);
            }
            Err(_) => {
                update.insert("$set", doc! { "updated_at": now });
            }
        }
        match update.get_document_mut("$inc") {
            Ok(inc) => {
                inc.insert("version", 1);
            }
            Err(_) => {
                update.insert("$inc", doc! { "version": 1 });
            }
        }
        update
    }
}

/// Times a database call and records the result on the shared meter.
async fn record_metrics<T, F>(operation: &'static str, f: F) -> Result<T, DatabaseError>
where
    F: std::future::Future<Output = Result<T, DatabaseError>>,
{
    let start = Instant::now();
    let result = f.await;
    let duration = start.elapsed().as_secs_f64();
    let attributes = [KeyValue::new("db_operation_name", operation)];
    ORCHESTRATOR_METRICS.db_calls_response_time.record(duration, &attributes);
    result
}

#[async_trait]
impl JobStore for MongoDbClient {
    #[tracing::instrument(skip_all, fields(job_id = %job.id), err)]
    async fn create_job(&self, job: JobItem) -> Result<JobItem, DatabaseError> {
        record_metrics("create_job", async {
            let options = UpdateOptions::builder().upsert(true).build();

            let updates = job.to_document()?;
            let filter = doc! { "id": mongodb::bson::Uuid::from(job.id) };

            let result = self
                .get_job_collection()
                .update_one(filter, doc! { "$setOnInsert": updates }, options)
                .await
                .map_err(DatabaseError::MongoError)?;

            if result.matched_count == 0 {
                Ok(job)
            } else {
                Err(DatabaseError::ItemAlreadyExists(format!("job with id {}", job.id)))
            }
        })
        .await
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<JobItem>, DatabaseError> {
        record_metrics("get_job_by_id", async {
            let filter = doc! { "id": mongodb::bson::Uuid::from(id) };
            Ok(self.get_job_collection().find_one(filter, None).await?)
        })
        .await
    }

    async fn find_one(&self, filter: Document) -> Result<Option<JobItem>, DatabaseError> {
        record_metrics("find_one", async {
            let options = FindOneOptions::builder().build();
            Ok(self.get_job_collection().find_one(filter, options).await?)
        })
        .await
    }

    async fn find_many(&self, filter: Document, sort: Option<Document>) -> Result<Vec<JobItem>, DatabaseError> {
        record_metrics("find_many", async {
            let options = FindOptions::builder().sort(sort).build();
            let cursor = self.get_job_collection().find(filter, options).await?;
            Ok(cursor.try_collect().await?)
        })
        .await
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        array_filters: Option<Vec<Document>>,
    ) -> Result<Option<JobItem>, DatabaseError> {
        record_metrics("find_one_and_update", async {
            let options = FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .array_filters(array_filters)
                .build();
            let update = Self::with_audit_fields(update);
            Ok(self.get_job_collection().find_one_and_update(filter, update, options).await?)
        })
        .await
    }

    async fn update_one(
        &self,
        filter: Document,
        update: Document,
        array_filters: Option<Vec<Document>>,
    ) -> Result<u64, DatabaseError> {
        record_metrics("update_one", async {
            let options = UpdateOptions::builder().array_filters(array_filters).build();
            let update = Self::with_audit_fields(update);
            let result = self.get_job_collection().update_one(filter, update, options).await?;
            Ok(result.modified_count)
        })
        .await
    }

    async fn update_many(&self, filter: Document, update: Document) -> Result<u64, DatabaseError> {
        record_metrics("update_many", async {
            let update = Self::with_audit_fields(update);
            let result = self.get_job_collection().update_many(filter, update, None).await?;
            Ok(result.modified_count)
        })
        .await
    }

    async fn distinct(&self, field: &str, filter: Document) -> Result<Vec<String>, DatabaseError> {
        record_metrics("distinct", async {
            let values = self.get_job_collection().distinct(field, filter, None).await?;
            Ok(values
                .into_iter()
                .filter_map(|v| match v {
                    Bson::String(s) => Some(s),
                    _ => None,
                })
                .collect())
        })
        .await
    }
}
