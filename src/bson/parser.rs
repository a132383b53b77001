//! Extended-document codec: text payloads to BSON values.
//!
//! Accepts canonical and relaxed Extended JSON, JSON5 niceties (unquoted keys,
//! single-quoted strings, trailing commas) and the common Mongo shell
//! constructors (`ObjectId("..")`, `ISODate("..")`, `NumberLong(..)` and friends).
//! The shell constructors are rewritten to their Extended JSON equivalents
//! before parsing, so extended scalar types survive the round trip.

use std::borrow::Cow;

use base64::Engine as _;
use mongodb::bson::{self, Bson, Document, oid::ObjectId};
use serde_json::Value;

use crate::error::{Error, Result};

/// Parse a text payload into a BSON value. Never yields a partial value.
pub fn decode(input: &str) -> Result<Bson> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::Syntax("payload is empty".to_string()));
    }

    let expanded = expand_shell_constructors(trimmed)?;
    let value = parse_json_value(&expanded)?;
    Bson::try_from(value).map_err(|err| Error::Syntax(err.to_string()))
}

/// Parse a payload whose root must be a single document.
pub fn decode_document(input: &str) -> Result<Document> {
    into_document(decode(input)?)
}

/// Unwrap a decoded value that must be a single document.
pub fn into_document(value: Bson) -> Result<Document> {
    match value {
        Bson::Document(doc) => Ok(doc),
        other => Err(Error::Syntax(format!("expected a document, found {}", type_label(&other)))),
    }
}

/// Whether a decoded payload is a sequence of documents rather than one.
pub fn is_array_like(value: &Bson) -> bool {
    matches!(value, Bson::Array(_))
}

/// Unwrap the elements of an array payload, each of which must be a document.
pub fn documents_from_array(value: Bson) -> Result<Vec<Document>> {
    let Bson::Array(values) = value else {
        return Err(Error::Syntax(format!("expected an array, found {}", type_label(&value))));
    };
    values
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Bson::Document(doc) => Ok(doc),
            other => Err(Error::Syntax(format!(
                "array item {i} is {}, not a document",
                type_label(&other)
            ))),
        })
        .collect()
}

fn parse_json_value(input: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(input) {
        Ok(value) => Ok(value),
        Err(strict_err) => json5::from_str::<Value>(input).map_err(|_| {
            // The strict parser reports line/column, which is more useful.
            Error::Syntax(strict_err.to_string())
        }),
    }
}

fn type_label(value: &Bson) -> &'static str {
    match value {
        Bson::Document(_) => "a document",
        Bson::Array(_) => "an array",
        Bson::String(_) => "a string",
        Bson::Null => "null",
        Bson::Boolean(_) => "a boolean",
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => "a number",
        _ => "a scalar",
    }
}

// =============================================================================
// Shell constructor preprocessing
// =============================================================================

#[derive(Clone, Copy)]
enum Constructor {
    ObjectId,
    Date,
    NumberLong,
    NumberInt,
    NumberDouble,
    NumberDecimal,
    Uuid,
}

fn lookup_constructor(name: &str) -> Option<Constructor> {
    Some(match name {
        "ObjectId" | "ObjectID" => Constructor::ObjectId,
        "ISODate" | "Date" => Constructor::Date,
        "NumberLong" => Constructor::NumberLong,
        "NumberInt" => Constructor::NumberInt,
        "NumberDouble" => Constructor::NumberDouble,
        "NumberDecimal" => Constructor::NumberDecimal,
        "UUID" => Constructor::Uuid,
        _ => return None,
    })
}

/// Rewrite shell constructors outside string literals into Extended JSON.
fn expand_shell_constructors(input: &str) -> Result<Cow<'_, str>> {
    if !input.contains('(') {
        return Ok(Cow::Borrowed(input));
    }

    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '"' || c == '\'' {
            let end = skip_string(&chars, i);
            out.extend(&chars[i..end]);
            i = end;
            continue;
        }

        let starts_ident = (c.is_ascii_alphabetic() || c == '_')
            && (i == 0 || !is_ident_char(chars[i - 1]));
        if !starts_ident {
            out.push(c);
            i += 1;
            continue;
        }

        let ident_end = scan_ident(&chars, i);
        let ident: String = chars[i..ident_end].iter().collect();

        // `new ObjectId(...)` → drop the `new`
        if ident == "new" {
            let next = skip_whitespace(&chars, ident_end);
            let next_end = scan_ident(&chars, next);
            let next_ident: String = chars[next..next_end].iter().collect();
            if lookup_constructor(&next_ident).is_some() {
                i = next;
                continue;
            }
        }

        let open = skip_whitespace(&chars, ident_end);
        match lookup_constructor(&ident) {
            Some(ctor) if chars.get(open) == Some(&'(') => {
                let close = find_closing_paren(&chars, open).ok_or_else(|| {
                    Error::Syntax(format!("unterminated {ident}( constructor"))
                })?;
                let arg: String = chars[open + 1..close].iter().collect();
                out.push_str(&render_constructor(ctor, &ident, unquote(arg.trim()))?);
                i = close + 1;
            }
            _ => {
                out.push_str(&ident);
                i = ident_end;
            }
        }
    }

    Ok(Cow::Owned(out))
}

fn render_constructor(ctor: Constructor, name: &str, arg: &str) -> Result<String> {
    let quoted = |s: &str| serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""));

    let rendered = match ctor {
        Constructor::ObjectId => {
            let oid = if arg.is_empty() {
                ObjectId::new()
            } else {
                ObjectId::parse_str(arg)
                    .map_err(|_| Error::Syntax(format!("{name}: invalid ObjectId '{arg}'")))?
            };
            format!(r#"{{"$oid":"{}"}}"#, oid.to_hex())
        }
        Constructor::Date => {
            if arg.is_empty() {
                let now = bson::DateTime::now();
                format!(r#"{{"$date":{{"$numberLong":"{}"}}}}"#, now.timestamp_millis())
            } else if let Ok(millis) = arg.parse::<i64>() {
                format!(r#"{{"$date":{{"$numberLong":"{millis}"}}}}"#)
            } else {
                format!(r#"{{"$date":{}}}"#, quoted(arg))
            }
        }
        Constructor::NumberLong => {
            let n = arg
                .parse::<i64>()
                .map_err(|_| Error::Syntax(format!("{name}: invalid integer '{arg}'")))?;
            format!(r#"{{"$numberLong":"{n}"}}"#)
        }
        Constructor::NumberInt => {
            let n = arg
                .parse::<i32>()
                .map_err(|_| Error::Syntax(format!("{name}: invalid integer '{arg}'")))?;
            format!(r#"{{"$numberInt":"{n}"}}"#)
        }
        Constructor::NumberDouble => {
            arg.parse::<f64>()
                .map_err(|_| Error::Syntax(format!("{name}: invalid number '{arg}'")))?;
            format!(r#"{{"$numberDouble":{}}}"#, quoted(arg))
        }
        Constructor::NumberDecimal => format!(r#"{{"$numberDecimal":{}}}"#, quoted(arg)),
        Constructor::Uuid => {
            let uuid = uuid::Uuid::parse_str(arg)
                .map_err(|_| Error::Syntax(format!("{name}: invalid UUID '{arg}'")))?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(uuid.as_bytes());
            format!(r#"{{"$binary":{{"base64":"{encoded}","subType":"04"}}}}"#)
        }
    };

    Ok(rendered)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn scan_ident(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len() && is_ident_char(chars[end]) {
        end += 1;
    }
    end
}

fn skip_whitespace(chars: &[char], start: usize) -> usize {
    let mut pos = start;
    while pos < chars.len() && chars[pos].is_whitespace() {
        pos += 1;
    }
    pos
}

/// Index one past the closing quote of the string starting at `start`
/// (or the end of input when unterminated; the parser reports that).
fn skip_string(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut pos = start + 1;
    while pos < chars.len() {
        match chars[pos] {
            '\\' => pos += 2,
            c if c == quote => return pos + 1,
            _ => pos += 1,
        }
    }
    chars.len()
}

fn find_closing_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut pos = open;
    while pos < chars.len() {
        match chars[pos] {
            '"' | '\'' => {
                pos = skip_string(chars, pos);
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
            _ => {}
        }
        pos += 1;
    }
    None
}

fn unquote(arg: &str) -> &str {
    let bytes = arg.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &arg[1..arg.len() - 1]
    } else {
        arg
    }
}
