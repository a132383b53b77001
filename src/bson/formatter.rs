//! Rendering of document identifiers for responses and logs.

use mongodb::bson::Bson;
use serde_json::Value;

/// Human-readable id: ObjectId as hex, strings verbatim, anything else as
/// relaxed Extended JSON.
pub fn display_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

/// Id as relaxed Extended JSON, for transport payloads.
pub fn id_to_json(id: &Bson) -> Value {
    id.clone().into_relaxed_extjson()
}
