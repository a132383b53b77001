//! Typed `_id` candidates for an id supplied as text.
//!
//! A stored `_id` may be an ObjectId, a number or a plain string, and a filter
//! of the wrong type matches nothing. The executor probes the candidates in
//! order and deletes by the first one that finds a document.

use mongodb::bson::Bson;
use mongodb::bson::oid::ObjectId;

use crate::bson::decode;

/// Candidates in probe order: explicit Extended JSON scalar, ObjectId hex,
/// integer, float, then the raw string. Duplicates are removed.
pub fn candidate_ids(raw: &str) -> Vec<Bson> {
    let mut candidates = Vec::new();
    let trimmed = raw.trim();

    if looks_explicit(trimmed)
        && let Ok(value) = decode(trimmed)
        && is_scalar(&value)
    {
        push_unique(&mut candidates, value);
    }

    if let Ok(oid) = ObjectId::parse_str(trimmed) {
        push_unique(&mut candidates, Bson::ObjectId(oid));
    }

    if let Ok(n) = trimmed.parse::<i32>() {
        push_unique(&mut candidates, Bson::Int32(n));
    } else if let Ok(n) = trimmed.parse::<i64>() {
        push_unique(&mut candidates, Bson::Int64(n));
    } else if let Ok(n) = trimmed.parse::<f64>()
        && n.is_finite()
    {
        push_unique(&mut candidates, Bson::Double(n));
    }

    if !raw.is_empty() {
        push_unique(&mut candidates, Bson::String(raw.to_string()));
    }

    candidates
}

/// Extended JSON wrappers, shell constructors and quoted strings.
fn looks_explicit(text: &str) -> bool {
    text.starts_with('{')
        || text.starts_with('"')
        || text.starts_with('\'')
        || text.contains('(')
}

fn is_scalar(value: &Bson) -> bool {
    !matches!(value, Bson::Document(_) | Bson::Array(_) | Bson::Null)
}

fn push_unique(candidates: &mut Vec<Bson>, value: Bson) {
    if !candidates.contains(&value) {
        candidates.push(value);
    }
}
