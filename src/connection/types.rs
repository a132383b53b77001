use std::future::Future;
use std::time::Duration;

use mongodb::bson::Bson;
use serde::Serialize;
use serde_json::Value;

use crate::bson::id_to_json;
use crate::error::{Error, ErrorKind, Result};

/// Addresses one collection behind a registered connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentTarget {
    pub connection: String,
    pub database: String,
    pub collection: String,
}

impl DocumentTarget {
    pub fn new(
        connection: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self { connection: connection.into(), database: database.into(), collection: collection.into() }
    }
}

impl std::fmt::Display for DocumentTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.connection, self.database, self.collection)
    }
}

/// Upper bounds for the suspension points of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub tunnel: Duration,
    pub connect: Duration,
    pub operation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tunnel: Duration::from_secs(10),
            connect: Duration::from_secs(10),
            operation: Duration::from_secs(30),
        }
    }
}

/// Await `fut`, failing with `Error::Timeout` once `limit` elapses.
pub async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{what} did not finish within {limit:?}"))),
    }
}

/// Tagged outcome of a document operation.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationResult {
    /// `id` is the first inserted document's id when `count > 1`.
    Inserted { id: Bson, count: u64 },
    Updated(u64),
    Deleted(u64),
    Failed { kind: ErrorKind, reason: String },
}

impl OperationResult {
    pub fn failed(err: &Error) -> Self {
        Self::Failed { kind: err.kind(), reason: err.to_string() }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn inserted_id(&self) -> Option<&Bson> {
        match self {
            Self::Inserted { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        if self.is_success() { 200 } else { 400 }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Inserted { count: 1, .. } => "Document successfully added",
            Self::Inserted { .. } => "Documents successfully added",
            Self::Updated(_) => "Document successfully updated",
            Self::Deleted(_) => "Document(s) successfully deleted",
            Self::Failed { kind, .. } => kind.default_message(),
        }
    }

    /// Transport-agnostic rendering: `{ msg, kind?, doc_id?, count? }`.
    pub fn to_response(&self) -> OperationResponse {
        let (kind, doc_id, count) = match self {
            Self::Inserted { id, count } => (None, Some(id_to_json(id)), Some(*count)),
            Self::Updated(n) | Self::Deleted(n) => (None, None, Some(*n)),
            Self::Failed { kind, .. } => (Some(*kind), None, None),
        };
        OperationResponse { status: self.status_code(), msg: self.message(), kind, doc_id, count }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationResponse {
    #[serde(skip)]
    pub status: u16,
    pub msg: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}
