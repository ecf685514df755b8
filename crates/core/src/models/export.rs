use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::CoreError;

/// Flat, human-readable interchange format for all events and price history.
/// Timestamps are ISO-8601 strings so that the import path can report
/// exactly which record and field is malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub events: Vec<ExportedEvent>,
    pub price_history: Vec<ExportedPrice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedEvent {
    pub id: String,
    pub occurred_at: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedPrice {
    pub effective_from: String,
    pub amount_per_bundle: f64,
    pub units_per_bundle: i64,
    pub currency: String,
}

/// What an import added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub events: usize,
    pub prices: usize,
}

// ── Record decoding ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text,
    OptionalText,
    Number,
    Integer,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.is_string(),
            FieldKind::OptionalText => value.is_string() || value.is_null(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64(),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            FieldKind::Text => "a string",
            FieldKind::OptionalText => "a string or null",
            FieldKind::Number => "a number",
            FieldKind::Integer => "a whole number",
        }
    }
}

const EVENT_FIELDS: &[(&str, FieldKind, bool)] = &[
    ("id", FieldKind::Text, true),
    ("occurredAt", FieldKind::Text, true),
    ("note", FieldKind::OptionalText, false),
];

const PRICE_FIELDS: &[(&str, FieldKind, bool)] = &[
    ("effectiveFrom", FieldKind::Text, true),
    ("amountPerBundle", FieldKind::Number, true),
    ("unitsPerBundle", FieldKind::Integer, true),
    ("currency", FieldKind::Text, true),
];

impl ExportDocument {
    /// Decode an already-parsed JSON document record by record, so a bad
    /// record is reported as `events[i].field` or `priceHistory[i].field`.
    pub fn from_json_value(value: Value) -> Result<Self, CoreError> {
        let mut root = match value {
            Value::Object(root) => root,
            other => {
                return Err(CoreError::validation(
                    "document",
                    format!("expected an object, got {}", kind_of(&other)),
                ))
            }
        };

        let events = records(&mut root, "events")?
            .into_iter()
            .enumerate()
            .map(|(i, record)| decode(&format!("events[{i}]"), record, EVENT_FIELDS))
            .collect::<Result<Vec<ExportedEvent>, _>>()?;
        let price_history = records(&mut root, "priceHistory")?
            .into_iter()
            .enumerate()
            .map(|(i, record)| decode(&format!("priceHistory[{i}]"), record, PRICE_FIELDS))
            .collect::<Result<Vec<ExportedPrice>, _>>()?;

        Ok(Self { events, price_history })
    }
}

/// A missing list is empty; anything other than an array is rejected.
fn records(root: &mut Map<String, Value>, key: &str) -> Result<Vec<Value>, CoreError> {
    match root.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(CoreError::validation(
            key,
            format!("expected an array, got {}", kind_of(&other)),
        )),
    }
}

fn decode<T: DeserializeOwned>(
    prefix: &str,
    record: Value,
    fields: &[(&str, FieldKind, bool)],
) -> Result<T, CoreError> {
    let Value::Object(map) = &record else {
        return Err(CoreError::validation(
            prefix,
            format!("expected an object, got {}", kind_of(&record)),
        ));
    };

    for (name, kind, required) in fields {
        match map.get(*name) {
            None if *required => {
                return Err(CoreError::validation(format!("{prefix}.{name}"), "is required"));
            }
            Some(value) if !kind.accepts(value) => {
                return Err(CoreError::validation(
                    format!("{prefix}.{name}"),
                    format!("expected {}, got {}", kind.expected(), kind_of(value)),
                ));
            }
            _ => {}
        }
    }

    serde_json::from_value(record).map_err(|e| CoreError::validation(prefix, e.to_string()))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
