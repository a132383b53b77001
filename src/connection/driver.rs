//! Driver seam: what the registry and executor need from a native client.
//!
//! Everything above this module sees driver results only as "did it fail" and
//! "how many documents were affected". `MongoConnector`/`MongoClient` are the
//! production implementation on top of the official driver.

use std::future::Future;
use std::time::Duration;

use mongodb::Client;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ClientOptions;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::DriverOptions;

/// Builds native clients from a connection string and operator options.
pub trait Connector: Send + Sync + 'static {
    type Client: DocumentClient;

    /// Connect and verify reachability before returning.
    fn connect(
        &self,
        connection_string: &str,
        options: &DriverOptions,
    ) -> impl Future<Output = Result<Self::Client>> + Send;
}

/// Result of a single-document save (insert or replace-by-id with upsert).
#[derive(Clone, Debug, PartialEq)]
pub struct SaveOutcome {
    pub id: Bson,
    pub affected: u64,
}

/// Single-operation document calls against a live client.
pub trait DocumentClient: Send + Sync + 'static {
    /// Inserted ids, in input order.
    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> impl Future<Output = Result<Vec<Bson>>> + Send;

    /// Insert when the document has no `_id`, otherwise replace-or-insert by `_id`.
    fn save(
        &self,
        database: &str,
        collection: &str,
        document: Document,
    ) -> impl Future<Output = Result<SaveOutcome>> + Send;

    /// Replace the document with `_id == id`; returns the modified count.
    fn replace_by_id(
        &self,
        database: &str,
        collection: &str,
        id: Bson,
        replacement: Document,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn delete_many(
        &self,
        database: &str,
        collection: &str,
        filter: Document,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Stored `_id` of a document matching `{ _id: id }`, if any.
    fn find_id(
        &self,
        database: &str,
        collection: &str,
        id: Bson,
    ) -> impl Future<Output = Result<Option<Bson>>> + Send;

    fn delete_by_id(
        &self,
        database: &str,
        collection: &str,
        id: Bson,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Close the client. Callers treat failures as best-effort.
    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Connector for the official MongoDB driver.
#[derive(Clone, Debug, Default)]
pub struct MongoConnector;

impl Connector for MongoConnector {
    type Client = MongoClient;

    async fn connect(&self, connection_string: &str, options: &DriverOptions) -> Result<MongoClient> {
        let mut client_options = ClientOptions::parse(connection_string)
            .await
            .map_err(|err| Error::InvalidUri(err.to_string()))?;
        apply_driver_options(&mut client_options, options)?;

        let client = Client::with_options(client_options)?;

        // Ping to verify connection
        client.database("admin").run_command(doc! { "ping": 1 }).await?;

        Ok(MongoClient { client })
    }
}

/// Live driver client owned by one registry entry.
#[derive(Clone, Debug)]
pub struct MongoClient {
    client: Client,
}

impl MongoClient {
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn collection(&self, database: &str, collection: &str) -> mongodb::Collection<Document> {
        self.client.database(database).collection::<Document>(collection)
    }
}

impl DocumentClient for MongoClient {
    async fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Bson>> {
        let result = self.collection(database, collection).insert_many(documents).await?;
        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_unstable_by_key(|(index, _)| *index);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn save(&self, database: &str, collection: &str, document: Document) -> Result<SaveOutcome> {
        let coll = self.collection(database, collection);

        match document.get("_id").cloned() {
            Some(id) => {
                let result =
                    coll.replace_one(doc! { "_id": id.clone() }, document).upsert(true).await?;
                let affected = if result.upserted_id.is_some() { 1 } else { result.matched_count };
                Ok(SaveOutcome { id, affected })
            }
            None => {
                let result = coll.insert_one(document).await?;
                Ok(SaveOutcome { id: result.inserted_id, affected: 1 })
            }
        }
    }

    async fn replace_by_id(
        &self,
        database: &str,
        collection: &str,
        id: Bson,
        replacement: Document,
    ) -> Result<u64> {
        let result =
            self.collection(database, collection).replace_one(doc! { "_id": id }, replacement).await?;
        Ok(result.modified_count)
    }

    async fn delete_many(&self, database: &str, collection: &str, filter: Document) -> Result<u64> {
        let result = self.collection(database, collection).delete_many(filter).await?;
        Ok(result.deleted_count)
    }

    async fn find_id(&self, database: &str, collection: &str, id: Bson) -> Result<Option<Bson>> {
        let found = self
            .collection(database, collection)
            .find_one(doc! { "_id": id })
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(found.and_then(|doc| doc.get("_id").cloned()))
    }

    async fn delete_by_id(&self, database: &str, collection: &str, id: Bson) -> Result<u64> {
        let result = self.collection(database, collection).delete_one(doc! { "_id": id }).await?;
        Ok(result.deleted_count)
    }

    async fn shutdown(&self) -> Result<()> {
        self.client.clone().shutdown().immediate(true).await;
        Ok(())
    }
}

/// Apply the operator's JSON options on top of the parsed URI options.
/// Unknown keys are kept in the handle but ignored here.
pub fn apply_driver_options(target: &mut ClientOptions, options: &DriverOptions) -> Result<()> {
    for (key, value) in options {
        match key.as_str() {
            "appName" => target.app_name = Some(expect_str(key, value)?.to_string()),
            "connectTimeoutMS" => target.connect_timeout = Some(expect_millis(key, value)?),
            "serverSelectionTimeoutMS" => {
                target.server_selection_timeout = Some(expect_millis(key, value)?)
            }
            "maxPoolSize" => target.max_pool_size = Some(expect_u32(key, value)?),
            "minPoolSize" => target.min_pool_size = Some(expect_u32(key, value)?),
            "directConnection" => target.direct_connection = Some(expect_bool(key, value)?),
            "retryWrites" => target.retry_writes = Some(expect_bool(key, value)?),
            "retryReads" => target.retry_reads = Some(expect_bool(key, value)?),
            other => log::debug!("Ignoring unsupported driver option '{other}'"),
        }
    }
    Ok(())
}

fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| Error::InvalidOptions(format!("{key} must be a string")))
}

fn expect_bool(key: &str, value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| Error::InvalidOptions(format!("{key} must be a boolean")))
}

fn expect_u32(key: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Error::InvalidOptions(format!("{key} must be a non-negative integer")))
}

fn expect_millis(key: &str, value: &Value) -> Result<Duration> {
    value
        .as_u64()
        .map(Duration::from_millis)
        .ok_or_else(|| Error::InvalidOptions(format!("{key} must be milliseconds")))
}
