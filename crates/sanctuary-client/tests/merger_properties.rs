//! Property tests for the room log merge rules.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Map;

use sanctuary_client::RoomLog;
use sanctuary_shared::{Message, MessageId, MessagePatch, RoomEvent, RoomId};

fn message(id: u8, secs: i64) -> Message {
    Message {
        id: MessageId::new(format!("m{id:03}")),
        room_id: RoomId::from("svc-1"),
        author_id: None,
        body: format!("body {id}"),
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        author: None,
        attributes: Map::new(),
    }
}

/// Distinct messages, with timestamps drawn from a narrow range so ties are
/// common.
fn messages() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::btree_map(any::<u8>(), 0i64..4, 0..24).prop_map(|map: BTreeMap<u8, i64>| {
        map.into_iter().map(|(id, secs)| message(id, secs)).collect()
    })
}

fn inserted(messages: &[Message]) -> RoomLog {
    let mut log = RoomLog::new();
    for m in messages {
        log.apply(RoomEvent::Inserted(m.clone()));
    }
    log
}

proptest! {
    #[test]
    fn test_log_is_sorted_and_unique(batch in messages()) {
        let log = inserted(&batch);
        prop_assert_eq!(log.len(), batch.len());
        for pair in log.messages().windows(2) {
            prop_assert!(pair[0].created_at < pair[1].created_at
                || (pair[0].created_at == pair[1].created_at && pair[0].id < pair[1].id));
        }
    }

    #[test]
    fn test_replayed_inserts_are_ignored(batch in messages()) {
        let once = inserted(&batch);
        let mut twice = once.clone();
        for m in &batch {
            prop_assert!(!twice.apply_insert(m.clone()));
        }
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn test_insert_order_does_not_matter(
        (batch, shuffled) in messages().prop_flat_map(|batch| {
            let shuffled = Just(batch.clone()).prop_shuffle();
            (Just(batch), shuffled)
        })
    ) {
        prop_assert_eq!(inserted(&batch), inserted(&shuffled));
    }

    #[test]
    fn test_events_on_distinct_ids_commute(batch in messages(), pick in any::<prop::sample::Index>()) {
        prop_assume!(batch.len() >= 2);
        let (base, rest) = batch.split_at(batch.len() / 2);
        let updated = pick.get(base).id.clone();
        let fresh = rest[0].clone();

        let patch = MessagePatch {
            body: Some("edited".to_string()),
            ..Default::default()
        };
        let update = RoomEvent::Updated { id: updated, patch };
        let insert = RoomEvent::Inserted(fresh);

        let mut forward = RoomLog::from_snapshot(base.to_vec());
        forward.apply(update.clone());
        forward.apply(insert.clone());

        let mut backward = RoomLog::from_snapshot(base.to_vec());
        backward.apply(insert);
        backward.apply(update);

        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn test_unknown_ids_are_noops(batch in messages(), stray in any::<u8>()) {
        let mut log = inserted(&batch);
        let before = log.clone();
        let stray = MessageId::new(format!("stray{stray}"));

        let delete = RoomEvent::Deleted(stray.clone());
        let update = RoomEvent::Updated { id: stray, patch: MessagePatch::default() };
        prop_assert!(!log.apply(delete));
        prop_assert!(!log.apply(update));
        prop_assert_eq!(log, before);
    }

    #[test]
    fn test_delete_removes_exactly_one(batch in messages(), pick in any::<prop::sample::Index>()) {
        prop_assume!(!batch.is_empty());
        let victim = pick.get(&batch).id.clone();

        let mut log = inserted(&batch);
        prop_assert!(log.apply(RoomEvent::Deleted(victim.clone())));
        prop_assert_eq!(log.len(), batch.len() - 1);
        prop_assert!(log.get(&victim).is_none());
    }
}
