//! Room descriptions: which table a room lives in, how it is scoped, and
//! how its rows decode into [`Message`]s and [`RoomEvent`]s.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};

use crate::constants::{
    COLUMN_CREATED_AT, COLUMN_ID, COLUMN_USER_ID, DEFAULT_SCHEMA, PROFILE_EMBED_KEY,
    TABLE_PRAYER_CHAT, TABLE_PRAYER_REQUESTS, TABLE_STREAM_CHAT,
};
use crate::error::DecodeError;
use crate::message::{AuthorProfile, Message, MessagePatch, RoomEvent};
use crate::protocol::{ChangeKind, ChangeRecord, TopicFilter};
use crate::types::{ActorId, MessageId, RoomId};

/// Alternate embed key used by some queries (`user:profiles(...)`).
const USER_EMBED_KEY: &str = "user";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomSpec {
    pub room_id: RoomId,
    pub schema: String,
    pub table: String,
    /// `(column, value)` restricting the table to this room.
    pub scope: Option<(String, String)>,
    pub body_column: String,
    /// `None` follows inserts, updates and deletes.
    pub events: Option<ChangeKind>,
}

impl RoomSpec {
    pub fn new(room_id: impl Into<String>, table: &str, body_column: &str) -> Self {
        Self {
            room_id: RoomId::new(room_id),
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.to_string(),
            scope: None,
            body_column: body_column.to_string(),
            events: None,
        }
    }

    pub fn scoped(mut self, column: &str, value: &str) -> Self {
        self.scope = Some((column.to_string(), value.to_string()));
        self
    }

    pub fn only(mut self, kind: ChangeKind) -> Self {
        self.events = Some(kind);
        self
    }

    /// Chat attached to one live stream.
    pub fn stream_chat(stream_id: &str) -> Self {
        Self::new(format!("{TABLE_STREAM_CHAT}:{stream_id}"), TABLE_STREAM_CHAT, "message")
            .scoped("stream_id", stream_id)
            .only(ChangeKind::Insert)
    }

    /// Chat attached to one prayer request.
    pub fn prayer_chat(prayer_id: &str) -> Self {
        Self::new(format!("{TABLE_PRAYER_CHAT}:{prayer_id}"), TABLE_PRAYER_CHAT, "message")
            .scoped("prayer_id", prayer_id)
            .only(ChangeKind::Insert)
    }

    /// The prayer wall: every change to `prayer_requests`.
    pub fn prayer_wall() -> Self {
        Self::new("prayer-wall", TABLE_PRAYER_REQUESTS, "content")
    }

    /// Feed of newly submitted prayer requests (admin alerts).
    pub fn prayer_requests() -> Self {
        Self::new("prayer-requests", TABLE_PRAYER_REQUESTS, "content").only(ChangeKind::Insert)
    }

    pub fn topic_filter(&self) -> TopicFilter {
        TopicFilter {
            topic: self.room_id.clone(),
            schema: self.schema.clone(),
            table: self.table.clone(),
            event: self.events,
            filter: self
                .scope
                .as_ref()
                .map(|(column, value)| format!("{column}=eq.{value}")),
        }
    }

    /// Scope restriction as PostgREST query parameters.
    pub fn scope_params(&self) -> Vec<(String, String)> {
        self.scope
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{value}")))
            .collect()
    }

    /// Row to insert when `author` posts `body` in this room.
    pub fn new_row(&self, author: &ActorId, body: &str) -> Value {
        let mut row = Map::new();
        if let Some((column, value)) = &self.scope {
            row.insert(column.clone(), Value::String(value.clone()));
        }
        row.insert(COLUMN_USER_ID.to_string(), json!(author.as_str()));
        row.insert(self.body_column.clone(), json!(body));
        Value::Object(row)
    }

    fn is_reserved(&self, column: &str) -> bool {
        column == COLUMN_ID
            || column == COLUMN_CREATED_AT
            || column == COLUMN_USER_ID
            || column == PROFILE_EMBED_KEY
            || column == USER_EMBED_KEY
            || column == self.body_column
            || self.scope.as_ref().is_some_and(|(c, _)| c == column)
    }

    /// Decode a full row into a message of this room.
    pub fn message_from_row(&self, row: &Value) -> Result<Message, DecodeError> {
        self.decode_message(row, None)
    }

    fn decode_message(
        &self,
        row: &Value,
        fallback_time: Option<DateTime<Utc>>,
    ) -> Result<Message, DecodeError> {
        let obj = row.as_object().ok_or(DecodeError::NotAnObject)?;

        let id = read_id(obj)?;
        let created_at = match obj.get(COLUMN_CREATED_AT) {
            Some(value) if !value.is_null() => parse_timestamp(COLUMN_CREATED_AT, value)?,
            _ => fallback_time.ok_or_else(|| DecodeError::MissingColumn(COLUMN_CREATED_AT.into()))?,
        };
        let body = match obj.get(&self.body_column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        let attributes = obj
            .iter()
            .filter(|(column, _)| !self.is_reserved(column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();

        Ok(Message {
            id,
            room_id: self.room_id.clone(),
            author_id: read_author_id(obj),
            body,
            created_at,
            author: read_profile(obj),
            attributes,
        })
    }

    /// Decode an update row image into an identifier and patch.
    pub fn patch_from_row(&self, row: &Value) -> Result<(MessageId, MessagePatch), DecodeError> {
        let obj = row.as_object().ok_or(DecodeError::NotAnObject)?;
        let id = read_id(obj)?;

        let body = match obj.get(&self.body_column) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        let attributes = obj
            .iter()
            .filter(|(column, _)| !self.is_reserved(column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();

        Ok((
            id,
            MessagePatch {
                body,
                author: read_profile(obj),
                author_id: read_author_id(obj),
                attributes,
            },
        ))
    }

    /// Turn a replication change into a room event.
    pub fn decode_change(&self, change: &ChangeRecord) -> Result<RoomEvent, DecodeError> {
        match change.kind {
            ChangeKind::Insert => self
                .decode_message(&change.record, change.commit_timestamp)
                .map(RoomEvent::Inserted),
            ChangeKind::Update => {
                let (id, patch) = self.patch_from_row(&change.record)?;
                Ok(RoomEvent::Updated { id, patch })
            }
            ChangeKind::Delete => {
                let obj = change.old_record.as_object().ok_or(DecodeError::NotAnObject)?;
                Ok(RoomEvent::Deleted(read_id(obj)?))
            }
        }
    }
}

fn read_id(obj: &Map<String, Value>) -> Result<MessageId, DecodeError> {
    match obj.get(COLUMN_ID) {
        Some(Value::String(s)) => Ok(MessageId(s.clone())),
        Some(Value::Number(n)) => Ok(MessageId(n.to_string())),
        Some(other) => Err(DecodeError::InvalidColumn {
            column: COLUMN_ID.into(),
            reason: format!("unexpected value {other}"),
        }),
        None => Err(DecodeError::MissingColumn(COLUMN_ID.into())),
    }
}

fn read_author_id(obj: &Map<String, Value>) -> Option<ActorId> {
    obj.get(COLUMN_USER_ID)
        .and_then(Value::as_str)
        .map(ActorId::new)
}

fn read_profile(obj: &Map<String, Value>) -> Option<AuthorProfile> {
    let embed = obj
        .get(PROFILE_EMBED_KEY)
        .or_else(|| obj.get(USER_EMBED_KEY))?
        .as_object()?;

    Some(AuthorProfile {
        username: embed.get("username").and_then(Value::as_str).map(str::to_string),
        avatar_url: embed.get("avatar_url").and_then(Value::as_str).map(str::to_string),
    })
}

/// Parse a timestamp column. Accepts RFC 3339 and the zone-less forms the
/// replication stream emits for `timestamp` columns (read as UTC).
pub fn parse_timestamp(column: &str, value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    let text = value.as_str().ok_or_else(|| DecodeError::InvalidColumn {
        column: column.to_string(),
        reason: "expected a string".into(),
    })?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(DecodeError::InvalidColumn {
        column: column.to_string(),
        reason: format!("unrecognised timestamp {text:?}"),
    })
}
