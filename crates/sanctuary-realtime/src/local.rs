//! In-process realtime transport.
//!
//! Fans published change records out to every matching subscription. Used
//! with the in-memory backend for local development and tests; it can also
//! simulate an unreachable transport or a silent network drop.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sanctuary_shared::{ChangeFeed, ChangeRecord, ConnectionError, TopicFilter};

use crate::transport::{RealtimeTransport, SubscriptionHandle};

struct Subscription {
    filter: TopicFilter,
    sink: mpsc::Sender<ChangeRecord>,
}

struct LocalState {
    next_id: u64,
    subscriptions: HashMap<u64, Subscription>,
    reachable: bool,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
}

pub struct LocalTransport {
    state: Mutex<LocalState>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LocalState {
                next_id: 1,
                subscriptions: HashMap::new(),
                reachable: true,
                subscribe_calls: 0,
                unsubscribe_calls: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While unreachable, every subscribe attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Drop every subscription without notice, like a network blip.
    pub fn disconnect_all(&self) {
        let dropped = std::mem::take(&mut self.state().subscriptions);
        warn!(count = dropped.len(), "Dropping all local subscriptions");
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.state().unsubscribe_calls
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for LocalTransport {
    async fn subscribe(
        &self,
        filter: TopicFilter,
        sink: mpsc::Sender<ChangeRecord>,
    ) -> Result<SubscriptionHandle, ConnectionError> {
        let mut state = self.state();
        state.subscribe_calls += 1;

        if !state.reachable {
            return Err(ConnectionError::Unreachable(
                "local transport is offline".to_string(),
            ));
        }

        let id = state.next_id;
        state.next_id += 1;

        let handle = SubscriptionHandle {
            id,
            topic: filter.topic.clone(),
        };
        debug!(topic = %filter.topic, subscription = id, "Local subscription added");
        state.subscriptions.insert(id, Subscription { filter, sink });

        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut state = self.state();
        state.unsubscribe_calls += 1;
        if state.subscriptions.remove(&handle.id).is_some() {
            debug!(topic = %handle.topic, subscription = handle.id, "Local subscription removed");
        }
    }
}

impl ChangeFeed for LocalTransport {
    fn publish(&self, change: ChangeRecord) {
        let state = self.state();
        for (id, subscription) in &state.subscriptions {
            if !subscription.filter.matches(&change) {
                continue;
            }
            // At-most-once: a lagging subscriber loses the change.
            if let Err(e) = subscription.sink.try_send(change.clone()) {
                warn!(
                    topic = %subscription.filter.topic,
                    subscription = id,
                    error = %e,
                    "Change not delivered"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sanctuary_shared::{ChangeKind, RoomSpec};
    use serde_json::{json, Value};

    fn wall_insert(id: &str) -> ChangeRecord {
        ChangeRecord::new(
            ChangeKind::Insert,
            "public",
            "prayer_requests",
            json!({"id": id, "content": "pray", "created_at": "2024-01-01T00:00:00Z"}),
            Value::Null,
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let transport = LocalTransport::new();
        let (wall_tx, mut wall_rx) = mpsc::channel(4);
        let (chat_tx, mut chat_rx) = mpsc::channel(4);

        transport
            .subscribe(RoomSpec::prayer_wall().topic_filter(), wall_tx)
            .await
            .unwrap();
        transport
            .subscribe(RoomSpec::stream_chat("s1").topic_filter(), chat_tx)
            .await
            .unwrap();

        transport.publish(wall_insert("p1"));

        assert_eq!(wall_rx.recv().await.unwrap().record["id"], "p1");
        assert!(chat_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_counts_calls() {
        let transport = LocalTransport::new();
        let (tx, _rx) = mpsc::channel(4);

        let handle = transport
            .subscribe(RoomSpec::prayer_wall().topic_filter(), tx)
            .await
            .unwrap();
        assert_eq!(transport.active_subscriptions(), 1);

        transport.unsubscribe(handle).await;
        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(transport.unsubscribe_calls(), 1);
        assert_eq!(transport.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_all_ends_streams() {
        let transport = LocalTransport::new();
        let (tx, mut rx) = mpsc::channel(4);
        transport
            .subscribe(RoomSpec::prayer_wall().topic_filter(), tx)
            .await
            .unwrap();

        transport.disconnect_all();
        assert!(rx.recv().await.is_none());
    }
}
