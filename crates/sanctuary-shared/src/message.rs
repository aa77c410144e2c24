use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{ANONYMOUS_NAME, COLUMN_IS_ANONYMOUS, COLUMN_IS_PRIVATE};
use crate::types::{ActorId, MessageId, RoomId};

/// Denormalized author display fields joined from `profiles`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuthorProfile {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

/// A chat message (or prayer request) belonging to one room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique within the room, never changes after creation.
    pub id: MessageId,
    /// Never changes after creation.
    pub room_id: RoomId,
    /// Absent for anonymous posts.
    pub author_id: Option<ActorId>,
    pub body: String,
    /// Assigned by the backend; non-decreasing per room.
    pub created_at: DateTime<Utc>,
    pub author: Option<AuthorProfile>,
    /// Remaining table columns (`title`, `is_private`, ...).
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Message {
    /// Room order: creation timestamp ascending, ties broken by identifier.
    pub fn order_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Author name to show. Anonymous posts never reveal their author.
    pub fn display_name(&self) -> &str {
        if self.is_anonymous() {
            return ANONYMOUS_NAME;
        }
        self.author
            .as_ref()
            .and_then(|a| a.username.as_deref())
            .unwrap_or(ANONYMOUS_NAME)
    }

    pub fn flag(&self, column: &str) -> bool {
        self.attributes
            .get(column)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_private(&self) -> bool {
        self.flag(COLUMN_IS_PRIVATE)
    }

    pub fn is_anonymous(&self) -> bool {
        self.flag(COLUMN_IS_ANONYMOUS)
    }

    pub fn attribute_str(&self, column: &str) -> Option<&str> {
        self.attributes.get(column).and_then(Value::as_str)
    }
}

/// Partial update for an existing message. Identifier, room and creation
/// time are not patchable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessagePatch {
    pub body: Option<String>,
    pub author: Option<AuthorProfile>,
    /// Present only when the update carried the author column.
    pub author_id: Option<ActorId>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl MessagePatch {
    pub fn is_empty(&self) -> bool {
        self.body.is_none()
            && self.author.is_none()
            && self.author_id.is_none()
            && self.attributes.is_empty()
    }

    /// Merge the patch fields into `message`.
    pub fn apply_to(&self, message: &mut Message) {
        if let Some(ref body) = self.body {
            message.body = body.clone();
        }
        if let Some(ref author) = self.author {
            message.author = Some(author.clone());
        }
        if let Some(ref author_id) = self.author_id {
            message.author_id = Some(author_id.clone());
        }
        for (key, value) in &self.attributes {
            message.attributes.insert(key.clone(), value.clone());
        }
    }

    pub fn flag(&self, column: &str) -> Option<bool> {
        self.attributes.get(column).and_then(Value::as_bool)
    }
}

/// A transport-level change for one room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Inserted(Message),
    Updated { id: MessageId, patch: MessagePatch },
    Deleted(MessageId),
}

impl RoomEvent {
    pub fn message_id(&self) -> &MessageId {
        match self {
            RoomEvent::Inserted(message) => &message.id,
            RoomEvent::Updated { id, .. } => id,
            RoomEvent::Deleted(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RoomEvent::Inserted(_) => "insert",
            RoomEvent::Updated { .. } => "update",
            RoomEvent::Deleted(_) => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(id: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            room_id: RoomId::from("room"),
            author_id: None,
            body: String::new(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            author: None,
            attributes: Map::new(),
        }
    }

    #[test]
    fn test_order_by_timestamp_then_id() {
        let early = message("z", 10);
        let late = message("a", 20);
        assert_eq!(early.order_cmp(&late), Ordering::Less);

        let tie_a = message("a", 10);
        let tie_b = message("b", 10);
        assert_eq!(tie_a.order_cmp(&tie_b), Ordering::Less);
        assert_eq!(tie_b.order_cmp(&tie_a), Ordering::Greater);
    }

    #[test]
    fn test_display_name_defaults_to_anonymous() {
        let mut msg = message("m", 1);
        assert_eq!(msg.display_name(), "Anonymous");

        msg.author = Some(AuthorProfile {
            username: Some("grace".into()),
            avatar_url: None,
        });
        assert_eq!(msg.display_name(), "grace");
    }

    #[test]
    fn test_anonymous_post_hides_author() {
        let mut msg = message("m", 1);
        msg.author = Some(AuthorProfile {
            username: Some("grace".into()),
            avatar_url: None,
        });
        msg.attributes
            .insert("is_anonymous".into(), Value::Bool(true));
        assert_eq!(msg.display_name(), "Anonymous");
    }

    #[test]
    fn test_patch_keeps_identity() {
        let mut msg = message("m", 1);
        msg.body = "before".into();

        let mut patch = MessagePatch {
            body: Some("after".into()),
            ..Default::default()
        };
        patch
            .attributes
            .insert("is_private".into(), Value::Bool(true));
        patch.apply_to(&mut msg);

        assert_eq!(msg.body, "after");
        assert_eq!(msg.id.as_str(), "m");
        assert!(msg.is_private());
    }
}
