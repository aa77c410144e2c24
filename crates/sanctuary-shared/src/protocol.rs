//! Row-change records delivered by the backend's replication stream, and
//! the topic filters used to subscribe to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::RoomId;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// One committed row change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    /// New row image (INSERT / UPDATE).
    #[serde(default)]
    pub record: Value,
    /// Old row image (UPDATE / DELETE); usually only the primary key.
    #[serde(default)]
    pub old_record: Value,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, schema: &str, table: &str, record: Value, old_record: Value) -> Self {
        Self {
            kind,
            schema: schema.to_string(),
            table: table.to_string(),
            record,
            old_record,
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// The row image that carries the column values for filtering.
    pub fn row(&self) -> &Value {
        match self.kind {
            ChangeKind::Delete => &self.old_record,
            _ => &self.record,
        }
    }
}

/// What a room subscribes to on the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    pub topic: RoomId,
    pub schema: String,
    pub table: String,
    /// `None` subscribes to every change kind.
    pub event: Option<ChangeKind>,
    /// Row filter in `column=eq.value` form.
    pub filter: Option<String>,
}

impl TopicFilter {
    /// Event name as sent in a join request (`*` for all kinds).
    pub fn event_name(&self) -> &'static str {
        self.event.map(|k| k.as_str()).unwrap_or("*")
    }

    /// Check whether a change belongs to this subscription.
    pub fn matches(&self, change: &ChangeRecord) -> bool {
        if change.schema != self.schema || change.table != self.table {
            return false;
        }

        if let Some(kind) = self.event {
            if kind != change.kind {
                return false;
            }
        }

        match self.filter.as_deref().and_then(parse_eq_filter) {
            Some((column, expected)) => match change.row().get(column) {
                Some(value) => value_matches(value, expected),
                // Deletes often carry only the primary key.
                None => change.kind == ChangeKind::Delete,
            },
            None => true,
        }
    }
}

/// Sink for committed changes; implemented by in-process transports so an
/// in-process backend can emulate the replication stream.
pub trait ChangeFeed: Send + Sync {
    fn publish(&self, change: ChangeRecord);
}

/// Split `column=eq.value` into `(column, value)`.
pub fn parse_eq_filter(filter: &str) -> Option<(&str, &str)> {
    let (column, rest) = filter.split_once('=')?;
    let value = rest.strip_prefix("eq.")?;
    Some((column, value))
}

/// Compare a JSON column value with its textual filter form.
pub fn value_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Bool(b) => expected == if *b { "true" } else { "false" },
        Value::Number(n) => n.to_string() == expected,
        Value::Null => expected == "null",
        _ => false,
    }
}
