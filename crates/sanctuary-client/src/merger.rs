//! The ordered message log of one room.
//!
//! Messages are kept sorted by `(created_at, id)`. Every operation is
//! idempotent and operations on distinct ids commute, so the same snapshot
//! plus the same events always yields the same log regardless of how the
//! events interleave.

use std::cmp::Ordering;
use std::collections::HashSet;

use sanctuary_shared::{Message, MessageId, MessagePatch, RoomEvent};

#[derive(Debug, Clone, Default)]
pub struct RoomLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl RoomLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: impl IntoIterator<Item = Message>) -> Self {
        let mut log = Self::new();
        for message in snapshot {
            log.apply_insert(message);
        }
        log
    }

    /// Insert at the position dictated by `(created_at, id)`. A repeated id
    /// is ignored. Returns whether the log changed.
    pub fn apply_insert(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|existing| existing.order_cmp(&message) == Ordering::Less);
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }

    /// Merge `patch` into the message with `id`. Unknown ids are ignored:
    /// the insert may have been filtered out by visibility.
    pub fn apply_update(&mut self, id: &MessageId, patch: &MessagePatch) -> bool {
        if !self.ids.contains(id) {
            return false;
        }
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                let before = message.clone();
                patch.apply_to(message);
                *message != before
            }
            None => false,
        }
    }

    pub fn apply_delete(&mut self, id: &MessageId) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.messages.retain(|m| &m.id != id);
        true
    }

    pub fn apply(&mut self, event: RoomEvent) -> bool {
        match event {
            RoomEvent::Inserted(message) => self.apply_insert(message),
            RoomEvent::Updated { id, patch } => self.apply_update(&id, &patch),
            RoomEvent::Deleted(id) => self.apply_delete(&id),
        }
    }

    /// Replace the contents with a fresh snapshot. Events committed after
    /// the snapshot was read must be applied afterwards.
    pub fn rebase(&mut self, snapshot: Vec<Message>) {
        *self = Self::from_snapshot(snapshot);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl PartialEq for RoomLog {
    fn eq(&self, other: &Self) -> bool {
        self.messages == other.messages
    }
}
