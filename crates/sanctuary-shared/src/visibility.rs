//! Which rows of a room the current actor is allowed to see.

use crate::constants::COLUMN_IS_PRIVATE;
use crate::message::{Message, RoomEvent};
use crate::types::ActorId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// No row-level restriction (chat tables).
    Everyone,
    /// Only rows whose `is_private` flag is false.
    PublicOnly,
    /// Public rows, plus private rows authored by the actor.
    PublicOrOwnedBy(ActorId),
}

impl Visibility {
    /// Public-or-owned when signed in, public-only otherwise.
    pub fn for_actor(actor: Option<ActorId>) -> Self {
        match actor {
            Some(actor) => Visibility::PublicOrOwnedBy(actor),
            None => Visibility::PublicOnly,
        }
    }

    pub fn permits(&self, is_private: bool, author: Option<&ActorId>) -> bool {
        match self {
            Visibility::Everyone => true,
            Visibility::PublicOnly => !is_private,
            Visibility::PublicOrOwnedBy(actor) => !is_private || author == Some(actor),
        }
    }

    pub fn permits_message(&self, message: &Message) -> bool {
        self.permits(message.is_private(), message.author_id.as_ref())
    }

    /// Screen a live event before it reaches the merger.
    ///
    /// Hidden inserts are dropped. Updates are judged on the `is_private`
    /// column they carry; one that hides a row the viewer may no longer see
    /// becomes a local delete. `known_author` stands in when the update does
    /// not carry the author column. Deletes always pass: removing an unknown
    /// id is a no-op.
    pub fn screen_event(&self, event: RoomEvent, known_author: Option<&ActorId>) -> Option<RoomEvent> {
        match event {
            RoomEvent::Inserted(ref message) if !self.permits_message(message) => None,
            RoomEvent::Updated { id, patch } => match patch.flag(COLUMN_IS_PRIVATE) {
                Some(is_private) => {
                    let author = patch.author_id.as_ref().or(known_author);
                    if self.permits(is_private, author) {
                        Some(RoomEvent::Updated { id, patch })
                    } else {
                        Some(RoomEvent::Deleted(id))
                    }
                }
                None => Some(RoomEvent::Updated { id, patch }),
            },
            other => Some(other),
        }
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Everyone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePatch;
    use crate::types::MessageId;
    use serde_json::Value;

    #[test]
    fn test_for_actor() {
        assert_eq!(Visibility::for_actor(None), Visibility::PublicOnly);
        assert_eq!(
            Visibility::for_actor(Some(ActorId::from("u1"))),
            Visibility::PublicOrOwnedBy(ActorId::from("u1"))
        );
    }

    #[test]
    fn test_private_rows_visible_to_owner_only() {
        let owner = ActorId::from("owner");
        let other = ActorId::from("other");
        let vis = Visibility::PublicOrOwnedBy(owner.clone());

        assert!(vis.permits(false, Some(&other)));
        assert!(vis.permits(true, Some(&owner)));
        assert!(!vis.permits(true, Some(&other)));
        assert!(!vis.permits(true, None));
        assert!(!Visibility::PublicOnly.permits(true, Some(&owner)));
        assert!(Visibility::Everyone.permits(true, None));
    }

    #[test]
    fn test_update_events_judged_on_carried_flag() {
        let vis = Visibility::PublicOnly;
        let mut patch = MessagePatch::default();
        let id = MessageId::from("m1");

        let plain = RoomEvent::Updated { id: id.clone(), patch: patch.clone() };
        assert_eq!(vis.screen_event(plain.clone(), None), Some(plain));

        patch.attributes.insert("is_private".into(), Value::Bool(true));
        let hiding = RoomEvent::Updated { id: id.clone(), patch };
        assert_eq!(vis.screen_event(hiding, None), Some(RoomEvent::Deleted(id.clone())));

        let delete = RoomEvent::Deleted(id);
        assert_eq!(vis.screen_event(delete.clone(), None), Some(delete));
    }

    #[test]
    fn test_owner_keeps_row_made_private() {
        let owner = ActorId::from("owner");
        let vis = Visibility::PublicOrOwnedBy(owner.clone());
        let id = MessageId::from("m1");
        let mut patch = MessagePatch::default();
        patch.attributes.insert("is_private".into(), Value::Bool(true));
        let update = RoomEvent::Updated { id: id.clone(), patch };

        assert_eq!(vis.screen_event(update.clone(), Some(&owner)), Some(update.clone()));
        assert_eq!(
            vis.screen_event(update, Some(&ActorId::from("other"))),
            Some(RoomEvent::Deleted(id))
        );
    }
}
