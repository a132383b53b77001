//! Document mutations against a registered connection.
//!
//! Each call resolves its connection, validates the database name, then runs
//! decoding and the driver call inside one tunnel scope. Failures are
//! classified into a stable kind and never escape as `Err`.

use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::Document;

use crate::bson::{decode, decode_document, documents_from_array, into_document, is_array_like};
use crate::connection::broker::TunnelFactory;
use crate::connection::driver::{Connector, DocumentClient};
use crate::connection::ops::id_resolver::candidate_ids;
use crate::connection::registry::{ConnectionHandle, ConnectionRegistry};
use crate::connection::types::{DocumentTarget, OperationResult, Timeouts, with_timeout};
use crate::error::{Error, Result};
use crate::helpers::is_valid_database_name;

pub struct DocumentOperationExecutor<'a, C: Connector, F: TunnelFactory> {
    registry: &'a ConnectionRegistry<C, F>,
    timeouts: Timeouts,
}

impl<'a, C: Connector, F: TunnelFactory> DocumentOperationExecutor<'a, C, F> {
    pub fn new(registry: &'a ConnectionRegistry<C, F>) -> Self {
        Self { registry, timeouts: registry.timeouts() }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Insert one document (save semantics) or, for an array payload, all of
    /// them. Reports the first inserted id.
    pub async fn insert_document(&self, target: &DocumentTarget, payload: &str) -> OperationResult {
        let result = self.try_insert(target, payload).await;
        finish("insert", target, result)
    }

    /// Replace the stored document carrying the payload's `_id`.
    pub async fn update_document(&self, target: &DocumentTarget, payload: &str) -> OperationResult {
        let result = self.try_update(target, payload).await;
        finish("update", target, result)
    }

    /// Delete everything matching `filter`. No filter, or a blank one, matches
    /// all documents; a filter that does not decode deletes nothing.
    pub async fn mass_delete_documents(
        &self,
        target: &DocumentTarget,
        filter: Option<&str>,
    ) -> OperationResult {
        let result = self.try_mass_delete(target, filter).await;
        finish("mass delete", target, result)
    }

    /// Delete one document by an id given as text, matching the id's stored type.
    pub async fn delete_document_by_id(&self, target: &DocumentTarget, id: &str) -> OperationResult {
        let result = self.try_delete_by_id(target, id).await;
        finish("delete by id", target, result)
    }

    fn resolve(&self, target: &DocumentTarget) -> Result<Arc<ConnectionHandle<C::Client, F>>> {
        let handle = self
            .registry
            .get(&target.connection)
            .ok_or_else(|| Error::InvalidConnection(target.connection.clone()))?;
        if !is_valid_database_name(&target.database) {
            return Err(Error::InvalidDatabaseName(target.database.clone()));
        }
        Ok(handle)
    }

    async fn try_insert(&self, target: &DocumentTarget, payload: &str) -> Result<OperationResult> {
        let handle = self.resolve(target)?;
        let client = handle.client();
        let limit = self.timeouts.operation;
        let (db, coll) = (target.database.as_str(), target.collection.as_str());

        handle
            .scope(move |_| async move {
                let value = decode(payload)?;

                if is_array_like(&value) {
                    let documents = documents_from_array(value)?;
                    if documents.is_empty() {
                        return Err(Error::Insert("no documents to insert".to_string()));
                    }
                    let ids = with_timeout(limit, "insert_many", client.insert_many(db, coll, documents))
                        .await
                        .map_err(into_insert_error)?;
                    let count = ids.len() as u64;
                    let id = ids
                        .into_iter()
                        .next()
                        .ok_or_else(|| Error::Insert("no documents were inserted".to_string()))?;
                    Ok(OperationResult::Inserted { id, count })
                } else {
                    let document = into_document(value)?;
                    let saved = with_timeout(limit, "save", client.save(db, coll, document))
                        .await
                        .map_err(into_insert_error)?;
                    if saved.affected == 0 {
                        return Err(Error::Insert("no documents were inserted".to_string()));
                    }
                    Ok(OperationResult::Inserted { id: saved.id, count: 1 })
                }
            })
            .await
    }

    async fn try_update(&self, target: &DocumentTarget, payload: &str) -> Result<OperationResult> {
        let handle = self.resolve(target)?;
        let client = handle.client();
        let limit = self.timeouts.operation;
        let (db, coll) = (target.database.as_str(), target.collection.as_str());

        handle
            .scope(move |_| async move {
                let document = decode_document(payload)?;
                let Some(id) = document.get("_id").cloned() else {
                    return Err(Error::NoMatchingDocument("document has no _id".to_string()));
                };

                let modified =
                    with_timeout(limit, "replace_one", client.replace_by_id(db, coll, id, document))
                        .await
                        .map_err(|err| reclassify(err, Error::NoMatchingDocument))?;
                // A zero modify count almost always means a wrong _id.
                if modified == 0 {
                    return Err(Error::NoMatchingDocument("no document matched the supplied _id".to_string()));
                }
                Ok(OperationResult::Updated(modified))
            })
            .await
    }

    async fn try_mass_delete(
        &self,
        target: &DocumentTarget,
        filter: Option<&str>,
    ) -> Result<OperationResult> {
        let handle = self.resolve(target)?;
        let client = handle.client();
        let limit = self.timeouts.operation;
        let (db, coll) = (target.database.as_str(), target.collection.as_str());

        handle
            .scope(move |_| async move {
                let filter = parse_filter(filter)?;
                let deleted = with_timeout(limit, "delete_many", client.delete_many(db, coll, filter))
                    .await
                    .map_err(|err| reclassify(err, Error::InvalidQuery))?;
                if deleted == 0 {
                    return Err(Error::InvalidQuery("no documents matched the filter".to_string()));
                }
                Ok(OperationResult::Deleted(deleted))
            })
            .await
    }

    async fn try_delete_by_id(&self, target: &DocumentTarget, id: &str) -> Result<OperationResult> {
        let handle = self.resolve(target)?;
        let client = handle.client();
        let limit = self.timeouts.operation;
        let (db, coll) = (target.database.as_str(), target.collection.as_str());

        handle
            .scope(move |_| async move {
                let stored_id = resolve_stored_id(client, db, coll, id, limit).await?;
                let deleted =
                    with_timeout(limit, "delete_one", client.delete_by_id(db, coll, stored_id))
                        .await
                        .map_err(|err| reclassify(err, Error::DocumentNotFound))?;
                if deleted == 0 {
                    return Err(Error::DocumentNotFound(id.to_string()));
                }
                Ok(OperationResult::Deleted(deleted))
            })
            .await
    }
}

/// Probe the typed candidates for `raw` and return the `_id` as stored.
async fn resolve_stored_id<K: DocumentClient>(
    client: &K,
    db: &str,
    coll: &str,
    raw: &str,
    limit: Duration,
) -> Result<mongodb::bson::Bson> {
    for candidate in candidate_ids(raw) {
        let found = with_timeout(limit, "find_one", client.find_id(db, coll, candidate))
            .await
            .map_err(|err| reclassify(err, Error::DocumentNotFound))?;
        if let Some(stored) = found {
            return Ok(stored);
        }
    }
    Err(Error::DocumentNotFound(raw.to_string()))
}

fn parse_filter(filter: Option<&str>) -> Result<Document> {
    match filter.map(str::trim).filter(|text| !text.is_empty()) {
        None => Ok(Document::new()),
        Some(text) => decode(text)
            .and_then(into_document)
            .map_err(|err| Error::InvalidQuery(err.to_string())),
    }
}

fn into_insert_error(err: Error) -> Error {
    match err {
        Error::Insert(_) => err,
        other => reclassify(other, Error::Insert),
    }
}

/// Timeouts keep their own kind; anything else becomes `wrap(message)`.
fn reclassify(err: Error, wrap: fn(String) -> Error) -> Error {
    match err {
        Error::Timeout(_) => err,
        other => wrap(other.to_string()),
    }
}

fn finish(operation: &str, target: &DocumentTarget, result: Result<OperationResult>) -> OperationResult {
    match result {
        Ok(outcome) => {
            log::debug!("{} on {} succeeded: {:?}", operation, target, outcome);
            outcome
        }
        Err(err) => {
            log::error!("{} on {} failed: {}", operation, target, err);
            OperationResult::failed(&err)
        }
    }
}
