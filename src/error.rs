use serde::Serialize;
use thiserror::Error;

/// Application-wide error type.
///
/// Variants above the transparent conversions are the stable, caller-visible
/// failure kinds. The `#[from]` variants carry raw driver/io/ssh failures until
/// the component that observed them maps them onto one of the stable kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error("A connection named '{0}' already exists")]
    NameAlreadyExists(String),

    #[error("Invalid connection string: {0}")]
    InvalidUri(String),

    #[error("Error in connection options: {0}")]
    InvalidOptions(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Cannot create SSH tunnel: {0}")]
    Tunnel(String),

    #[error("Invalid connection name: {0}")]
    InvalidConnection(String),

    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Error inserting document(s): {0}")]
    Insert(String),

    #[error("Error updating document: {0}")]
    NoMatchingDocument(String),

    #[error("Invalid query specified: {0}")]
    InvalidQuery(String),

    #[error("Cannot find document by id: {0}")]
    DocumentNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Config error: {0}")]
    ConfigSave(String),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
}

impl Error {
    /// Stable kind reported at the operation boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NameAlreadyExists(_) => ErrorKind::NameAlreadyExists,
            Error::InvalidUri(_) => ErrorKind::InvalidUri,
            Error::InvalidOptions(_) | Error::Json(_) => ErrorKind::InvalidOptions,
            Error::Connect(_) | Error::Mongo(_) | Error::Io(_) => ErrorKind::ConnectError,
            Error::Tunnel(_) | Error::Ssh(_) => ErrorKind::TunnelError,
            Error::InvalidConnection(_) => ErrorKind::InvalidConnection,
            Error::InvalidDatabaseName(_) => ErrorKind::InvalidDatabaseName,
            Error::Syntax(_) => ErrorKind::SyntaxError,
            Error::Insert(_) => ErrorKind::InsertError,
            Error::NoMatchingDocument(_) => ErrorKind::NoMatchingDocument,
            Error::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Error::DocumentNotFound(_) => ErrorKind::DocumentNotFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ConfigSave(_) => ErrorKind::ConfigSave,
        }
    }

    /// Re-tag a tunnel-layer failure so callers see `TunnelError`.
    pub(crate) fn into_tunnel(self) -> Self {
        match self {
            Error::Tunnel(_) | Error::Timeout(_) => self,
            other => Error::Tunnel(other.to_string()),
        }
    }

    /// Re-tag a driver connect failure so callers see `ConnectError`.
    pub(crate) fn into_connect(self) -> Self {
        match self {
            Error::Mongo(err) => Error::Connect(err.to_string()),
            Error::Io(err) => Error::Connect(err.to_string()),
            other => other,
        }
    }
}

/// Stable failure kinds. The serialized name is part of the external contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    NameAlreadyExists,
    InvalidUri,
    InvalidOptions,
    ConnectError,
    TunnelError,
    InvalidConnection,
    InvalidDatabaseName,
    SyntaxError,
    InsertError,
    NoMatchingDocument,
    InvalidQuery,
    DocumentNotFound,
    Timeout,
    ConfigSave,
}

/// Coarse grouping of failure kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorCategory {
    Configuration,
    Connectivity,
    Validation,
    Payload,
    Semantic,
    Timeout,
    Persistence,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::NameAlreadyExists | ErrorKind::InvalidUri | ErrorKind::InvalidOptions => {
                ErrorCategory::Configuration
            }
            ErrorKind::ConnectError | ErrorKind::TunnelError => ErrorCategory::Connectivity,
            ErrorKind::InvalidConnection | ErrorKind::InvalidDatabaseName => {
                ErrorCategory::Validation
            }
            ErrorKind::SyntaxError | ErrorKind::InvalidQuery => ErrorCategory::Payload,
            ErrorKind::InsertError | ErrorKind::NoMatchingDocument | ErrorKind::DocumentNotFound => {
                ErrorCategory::Semantic
            }
            ErrorKind::Timeout => ErrorCategory::Timeout,
            ErrorKind::ConfigSave => ErrorCategory::Persistence,
        }
    }

    /// Built-in English message catalog.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::NameAlreadyExists => {
                "Config error: A connection by that name already exists"
            }
            ErrorKind::InvalidUri => "Config error: Invalid connection string",
            ErrorKind::InvalidOptions => "Error in connection options",
            ErrorKind::ConnectError => "Config error: Unable to connect",
            ErrorKind::TunnelError => "Cannot create SSH Tunnel",
            ErrorKind::InvalidConnection => "Invalid connection name",
            ErrorKind::InvalidDatabaseName => "Invalid database name",
            ErrorKind::SyntaxError => "Syntax error. Please check the syntax",
            ErrorKind::InsertError => "Error inserting document(s)",
            ErrorKind::NoMatchingDocument => "Error updating document: Syntax error",
            ErrorKind::InvalidQuery => "Error deleting document(s): Invalid query specified",
            ErrorKind::DocumentNotFound => "Cannot find document by Id",
            ErrorKind::Timeout => "The operation timed out",
            ErrorKind::ConfigSave => "Config error",
        }
    }
}

/// Convenience Result type using our Error
pub type Result<T> = std::result::Result<T, Error>;
