//! Field-value model and the static priority-weight table.
//!
//! User queries and grant records are compared field by field. Each field is
//! either a single string or an ordered list of strings; anything else is
//! rejected at the JSON boundary here, never deeper in the pipeline.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Weight applied to fields absent from the priority table.
pub const DEFAULT_FIELD_WEIGHT: f32 = 1.0;

// Priority weights are static configuration: which fields matter most when
// ranking a grant against a query. A topic match counts five times as much as
// a loose prose-description match.
static PRIORITY_WEIGHTS: [(&str, f32); 5] = [
    ("fundingTopics", 10.0),
    ("ecosystem", 9.0),
    ("fundingType", 4.0),
    ("description", 2.0),
    ("totalFundingAvailable", 1.0),
];

/// Priority weight for a field name; unknown fields weigh [`DEFAULT_FIELD_WEIGHT`].
pub fn field_weight(field: &str) -> f32 {
    PRIORITY_WEIGHTS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, weight)| *weight)
        .unwrap_or(DEFAULT_FIELD_WEIGHT)
}

/// Names of the fields carrying explicit priority weights, in table order.
///
/// The offline corpus builder embeds exactly this field set for every grant.
pub fn weighted_field_names() -> impl Iterator<Item = &'static str> {
    PRIORITY_WEIGHTS.iter().map(|(name, _)| *name)
}

/// One attribute of a query or grant: a single string or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// A single free-text value.
    Scalar(String),
    /// An ordered list of values, e.g. several funding topics.
    List(Vec<String>),
}

impl FieldValue {
    /// Values in order, whitespace-trimmed, with blank entries dropped.
    pub fn trimmed_values(&self) -> Vec<String> {
        let raw: &[String] = match self {
            FieldValue::Scalar(value) => std::slice::from_ref(value),
            FieldValue::List(values) => values,
        };
        raw.iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(FieldValue::Scalar(text.clone())),
            Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(text) => values.push(text.clone()),
                        _ => return None,
                    }
                }
                Some(FieldValue::List(values))
            }
            _ => None,
        }
    }
}

/// A record of named field values with malformed shapes already screened out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl FieldRecord {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one field, replacing any previous value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of fields present.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields are present.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses an arbitrary JSON object into a record (live query boundary).
    ///
    /// Fields whose value is neither a string nor an array of strings are
    /// skipped, never an error; their names come back so callers can warn.
    pub fn from_json_map(map: &Map<String, Value>) -> (Self, Vec<String>) {
        let mut record = Self::new();
        let mut skipped = Vec::new();
        for (name, value) in map {
            match FieldValue::from_json(value) {
                Some(parsed) => record.insert(name.clone(), parsed),
                None => skipped.push(name.clone()),
            }
        }
        (record, skipped)
    }

    /// Projects the weighted field set out of a raw grant record (corpus
    /// builder boundary).
    ///
    /// Absent fields become empty scalars so the builder's sentinel blank
    /// policy applies to them uniformly; malformed shapes are skipped and
    /// reported like [`FieldRecord::from_json_map`].
    pub fn from_weighted_json(map: &Map<String, Value>) -> (Self, Vec<String>) {
        let mut record = Self::new();
        let mut skipped = Vec::new();
        for name in weighted_field_names() {
            match map.get(name) {
                None => record.insert(name, FieldValue::Scalar(String::new())),
                Some(value) => match FieldValue::from_json(value) {
                    Some(parsed) => record.insert(name, parsed),
                    None => skipped.push(name.to_string()),
                },
            }
        }
        (record, skipped)
    }
}
