//! In-process backend.
//!
//! Keeps tables as JSON rows, assigns `id` and `created_at` on insert, and
//! publishes every committed write to an attached [`ChangeFeed`] the way the
//! hosted backend's replication stream would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use sanctuary_shared::constants::{
    COLUMN_CREATED_AT, COLUMN_ID, COLUMN_USER_ID, DEFAULT_SCHEMA, TABLE_PROFILES,
};
use sanctuary_shared::protocol::value_matches;
use sanctuary_shared::{ChangeFeed, ChangeKind, ChangeRecord};

use crate::backend::Backend;
use crate::error::{BackendError, Result};
use crate::query::Query;

/// `alias:fk_column(col, ...)` inside a select projection.
#[derive(Debug, PartialEq)]
struct Embed {
    alias: String,
    fk_column: String,
    columns: Vec<String>,
}

struct Tables {
    rows: HashMap<String, Vec<Value>>,
    last_created: Option<DateTime<Utc>>,
    denied_writes: HashSet<String>,
    failing_selects: HashSet<String>,
    offline: bool,
}

pub struct MemoryBackend {
    state: Mutex<Tables>,
    feed: Mutex<Option<Arc<dyn ChangeFeed>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Tables {
                rows: HashMap::new(),
                last_created: None,
                denied_writes: HashSet::new(),
                failing_selects: HashSet::new(),
                offline: false,
            }),
            feed: Mutex::new(None),
        }
    }

    /// Publish committed writes to `feed`.
    pub fn attach_feed(&self, feed: Arc<dyn ChangeFeed>) {
        *self.feed.lock().unwrap_or_else(|p| p.into_inner()) = Some(feed);
    }

    fn state(&self) -> MutexGuard<'_, Tables> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, change: ChangeRecord) {
        let feed = self.feed.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(feed) = feed {
            feed.publish(change);
        }
    }

    /// Add a pre-existing row without publishing it. Missing `id` and
    /// `created_at` columns are filled in.
    pub fn seed(&self, table: &str, row: Value) -> Value {
        let mut state = self.state();
        let row = stamp(&mut state, row);
        state.rows.entry(table.to_string()).or_default().push(row.clone());
        row
    }

    /// Reject every write to `table` with a permission error.
    pub fn deny_writes(&self, table: &str) {
        self.state().denied_writes.insert(table.to_string());
    }

    /// Fail every select on `table` with a server error.
    pub fn fail_selects(&self, table: &str) {
        self.state().failing_selects.insert(table.to_string());
    }

    /// Clear every rule set by `deny_writes`, `fail_selects` and `set_offline`.
    pub fn reset_rules(&self) {
        let mut state = self.state();
        state.denied_writes.clear();
        state.failing_selects.clear();
        state.offline = false;
    }

    /// While offline, every operation fails as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state().rows.get(table).cloned().unwrap_or_default()
    }

    fn check_write(state: &Tables, table: &str) -> Result<()> {
        if state.offline {
            return Err(BackendError::transport("memory backend is offline"));
        }
        if state.denied_writes.contains(table) {
            return Err(BackendError::permission_denied(format!(
                "permission denied for table {table}"
            )));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Fill in `id` and a non-decreasing `created_at`.
fn stamp(state: &mut Tables, row: Value) -> Value {
    let mut obj = match row {
        Value::Object(obj) => obj,
        other => return other,
    };

    if !obj.contains_key(COLUMN_ID) {
        obj.insert(COLUMN_ID.to_string(), json!(Uuid::new_v4().to_string()));
    }
    if !obj.contains_key(COLUMN_CREATED_AT) {
        let now = Utc::now();
        let created = match state.last_created {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        state.last_created = Some(created);
        obj.insert(
            COLUMN_CREATED_AT.to_string(),
            json!(created.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }
    Value::Object(obj)
}

fn parse_embeds(projection: &str) -> Vec<Embed> {
    let mut embeds = Vec::new();
    let mut rest = projection;

    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')').map(|i| open + i) else {
            break;
        };
        let head = rest[..open].rsplit(',').next().unwrap_or_default().trim();
        if let Some((alias, fk_column)) = head.split_once(':') {
            embeds.push(Embed {
                alias: alias.trim().to_string(),
                fk_column: fk_column.trim().to_string(),
                columns: rest[open + 1..close]
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect(),
            });
        }
        rest = &rest[close + 1..];
    }
    embeds
}

/// Resolve each embed against the `profiles` table by primary key.
fn resolve_embeds(state: &Tables, row: &mut Value, embeds: &[Embed]) {
    let profiles = state.rows.get(TABLE_PROFILES);

    for embed in embeds {
        let target = row.get(&embed.fk_column).and_then(|fk| {
            profiles?.iter().find(|p| {
                p.get(COLUMN_ID)
                    .zip(fk.as_str())
                    .is_some_and(|(id, fk)| value_matches(id, fk))
            })
        });

        let embedded = match target {
            Some(profile) => {
                let picked: Map<String, Value> = embed
                    .columns
                    .iter()
                    .map(|c| (c.clone(), profile.get(c).cloned().unwrap_or(Value::Null)))
                    .collect();
                Value::Object(picked)
            }
            None => Value::Null,
        };
        if let Value::Object(obj) = row {
            obj.insert(embed.alias.clone(), embedded);
        }
    }
}

fn id_matches(row: &Value, id: &str) -> bool {
    row.get(COLUMN_ID).is_some_and(|value| value_matches(value, id))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let state = self.state();
        if state.offline {
            return Err(BackendError::transport("memory backend is offline"));
        }
        if state.failing_selects.contains(table) {
            return Err(BackendError::new(
                Some(503),
                None,
                format!("select on {table} is unavailable"),
            ));
        }

        let rows = state.rows.get(table).cloned().unwrap_or_default();
        let mut selected = query.apply(rows);

        let embeds = query.select.as_deref().map(parse_embeds).unwrap_or_default();
        if !embeds.is_empty() {
            for row in &mut selected {
                resolve_embeds(&state, row, &embeds);
            }
        }

        debug!(table, rows = selected.len(), "Memory select");
        Ok(selected)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        if !row.is_object() {
            return Err(BackendError::new(Some(400), None, "row must be a JSON object"));
        }

        let committed = {
            let mut state = self.state();
            Self::check_write(&state, table)?;
            let row = stamp(&mut state, row);
            state.rows.entry(table.to_string()).or_default().push(row.clone());
            row
        };

        let author = committed.get(COLUMN_USER_ID).cloned().unwrap_or(Value::Null);
        info!(table, id = %committed[COLUMN_ID], author = %author, "Row inserted");
        self.publish(ChangeRecord::new(
            ChangeKind::Insert,
            DEFAULT_SCHEMA,
            table,
            committed.clone(),
            Value::Null,
        ));
        Ok(committed)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        let Value::Object(fields) = patch else {
            return Err(BackendError::new(Some(400), None, "patch must be a JSON object"));
        };

        let updated = {
            let mut state = self.state();
            Self::check_write(&state, table)?;
            let row = state
                .rows
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|row| id_matches(row, id)))
                .ok_or_else(|| {
                    BackendError::new(Some(404), Some("PGRST116"), format!("no row {id} in {table}"))
                })?;

            if let Value::Object(obj) = row {
                for (column, value) in fields {
                    if column != COLUMN_ID {
                        obj.insert(column, value);
                    }
                }
            }
            row.clone()
        };

        debug!(table, id, "Row updated");
        self.publish(ChangeRecord::new(
            ChangeKind::Update,
            DEFAULT_SCHEMA,
            table,
            updated.clone(),
            json!({ COLUMN_ID: id }),
        ));
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let removed = {
            let mut state = self.state();
            Self::check_write(&state, table)?;
            match state.rows.get_mut(table) {
                Some(rows) => {
                    let before = rows.len();
                    rows.retain(|row| !id_matches(row, id));
                    rows.len() != before
                }
                None => false,
            }
        };

        if removed {
            debug!(table, id, "Row deleted");
            self.publish(ChangeRecord::new(
                ChangeKind::Delete,
                DEFAULT_SCHEMA,
                table,
                Value::Null,
                json!({ COLUMN_ID: id }),
            ));
        }
        Ok(())
    }
}
