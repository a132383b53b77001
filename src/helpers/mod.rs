pub mod validate;

pub use validate::{
    DEFAULT_MONGODB_PORT, REDACTED_PASSWORD, extract_port_from_uri, is_valid_database_name,
    redact_uri_password, validate_mongodb_uri,
};
