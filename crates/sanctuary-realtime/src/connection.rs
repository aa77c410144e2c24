//! A single live subscription to one room topic.
//!
//! A [`ChannelConnection`] owns the transport subscription plus a forwarding
//! task that decodes raw change records into [`RoomEvent`]s and hands them,
//! in delivery order, to an [`EventSink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sanctuary_shared::{ChangeRecord, ConnectionError, RoomEvent, RoomId, RoomSpec};

use crate::transport::{RealtimeTransport, SubscriptionHandle};

/// What a connection reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// A decoded change for the room.
    Event(RoomEvent),
    /// The transport dropped the subscription without being asked to.
    /// Events may have been missed.
    Interrupted,
}

/// Receiver of a connection's signals.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, signal: ChannelSignal);
}

/// Feeds one consumer's bounded queue without ever waiting on it.
///
/// A full queue drops the signal and raises the lag flag instead, so a slow
/// consumer cannot stall the connection or the other subscribers sharing it.
/// The consumer must treat a raised flag as a gap and resync.
#[derive(Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<ChannelSignal>,
    lagged: Arc<AtomicBool>,
}

impl QueueSink {
    pub fn new(tx: mpsc::Sender<ChannelSignal>) -> Self {
        Self {
            tx,
            lagged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raised whenever a signal could not be queued.
    pub fn lag_flag(&self) -> Arc<AtomicBool> {
        self.lagged.clone()
    }
}

#[async_trait]
impl EventSink for QueueSink {
    async fn deliver(&self, signal: ChannelSignal) {
        match self.tx.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.lagged.swap(true, Ordering::SeqCst) {
                    warn!("Event queue full, subscriber marked as lagging");
                }
            }
            Err(TrySendError::Closed(_)) => debug!("Event receiver dropped, signal discarded"),
        }
    }
}

struct Live {
    transport: Arc<dyn RealtimeTransport>,
    handle: SubscriptionHandle,
    forwarder: JoinHandle<()>,
}

/// Exactly one transport subscription for one room.
pub struct ChannelConnection {
    room_id: RoomId,
    live: Mutex<Option<Live>>,
}

impl ChannelConnection {
    /// Subscribe to the room described by `spec`.
    ///
    /// `buffer` bounds the queue between the transport and the decoder.
    pub async fn open(
        transport: Arc<dyn RealtimeTransport>,
        spec: RoomSpec,
        sink: Arc<dyn EventSink>,
        buffer: usize,
    ) -> Result<Self, ConnectionError> {
        let (change_tx, change_rx) = mpsc::channel::<ChangeRecord>(buffer.max(1));

        let handle = transport.subscribe(spec.topic_filter(), change_tx).await?;
        info!(room = %spec.room_id, subscription = handle.id, "Channel connection opened");

        let room_id = spec.room_id.clone();
        let forwarder = tokio::spawn(forward_changes(spec, change_rx, sink));

        Ok(Self {
            room_id,
            live: Mutex::new(Some(Live {
                transport,
                handle,
                forwarder,
            })),
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn is_open(&self) -> bool {
        self.live
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Release the subscription. Safe to call any number of times; after the
    /// first call no further signal reaches the sink.
    pub async fn close(&self) {
        let live = match self.live.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(live) = live else {
            return;
        };

        // Stop forwarding first so an intentional close is never reported
        // as an interruption.
        live.forwarder.abort();
        live.transport.unsubscribe(live.handle.clone()).await;
        info!(room = %self.room_id, subscription = live.handle.id, "Channel connection closed");
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        let live = match self.live.get_mut() {
            Ok(live) => live.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(live) = live {
            live.forwarder.abort();
            warn!(room = %self.room_id, "Channel connection dropped without close");
        }
    }
}

async fn forward_changes(
    spec: RoomSpec,
    mut changes: mpsc::Receiver<ChangeRecord>,
    sink: Arc<dyn EventSink>,
) {
    while let Some(change) = changes.recv().await {
        match spec.decode_change(&change) {
            Ok(event) => {
                debug!(
                    room = %spec.room_id,
                    kind = event.kind(),
                    id = %event.message_id(),
                    "Change received"
                );
                sink.deliver(ChannelSignal::Event(event)).await;
            }
            Err(e) => {
                warn!(room = %spec.room_id, error = %e, "Dropping undecodable change");
            }
        }
    }

    warn!(room = %spec.room_id, "Change stream ended by transport");
    sink.deliver(ChannelSignal::Interrupted).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use sanctuary_shared::{ChangeFeed, ChangeKind};
    use serde_json::{json, Value};

    fn insert(id: &str, stream: &str) -> ChangeRecord {
        ChangeRecord::new(
            ChangeKind::Insert,
            "public",
            "stream_chat",
            json!({
                "id": id,
                "stream_id": stream,
                "user_id": "alice",
                "message": "hi",
                "created_at": "2024-01-01T00:00:00Z"
            }),
            Value::Null,
        )
    }

    #[tokio::test]
    async fn test_events_forwarded_in_order() {
        let transport = Arc::new(LocalTransport::new());
        let (tx, mut rx) = mpsc::channel(16);

        let conn = ChannelConnection::open(
            transport.clone(),
            RoomSpec::stream_chat("s1"),
            Arc::new(QueueSink::new(tx)),
            16,
        )
        .await
        .unwrap();
        assert!(conn.is_open());

        transport.publish(insert("m1", "s1"));
        transport.publish(insert("other", "s2"));
        transport.publish(insert("m2", "s1"));

        for expected in ["m1", "m2"] {
            match rx.recv().await.unwrap() {
                ChannelSignal::Event(event) => assert_eq!(event.message_id().as_str(), expected),
                other => panic!("unexpected signal {other:?}"),
            }
        }

        conn.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Arc::new(LocalTransport::new());
        let (tx, _rx) = mpsc::channel(4);

        let conn = ChannelConnection::open(
            transport.clone(),
            RoomSpec::stream_chat("s1"),
            Arc::new(QueueSink::new(tx)),
            4,
        )
        .await
        .unwrap();

        conn.close().await;
        conn.close().await;
        assert!(!conn.is_open());
        assert_eq!(transport.unsubscribe_calls(), 1);
        assert_eq!(transport.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_open_fails_when_unreachable() {
        let transport = Arc::new(LocalTransport::new());
        transport.set_reachable(false);
        let (tx, _rx) = mpsc::channel(4);

        let sink = Arc::new(QueueSink::new(tx));
        let result = ChannelConnection::open(transport, RoomSpec::prayer_wall(), sink, 4).await;
        assert!(matches!(result, Err(ConnectionError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_transport_drop_reports_interruption() {
        let transport = Arc::new(LocalTransport::new());
        let (tx, mut rx) = mpsc::channel(4);

        let conn = ChannelConnection::open(
            transport.clone(),
            RoomSpec::prayer_wall(),
            Arc::new(QueueSink::new(tx)),
            4,
        )
        .await
        .unwrap();

        transport.disconnect_all();
        assert_eq!(rx.recv().await, Some(ChannelSignal::Interrupted));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_full_queue_marks_lag_without_blocking() {
        let transport = Arc::new(LocalTransport::new());
        let (tx, mut rx) = mpsc::channel(1);
        let sink = QueueSink::new(tx);
        let lagged = sink.lag_flag();

        let conn = ChannelConnection::open(
            transport.clone(),
            RoomSpec::stream_chat("s1"),
            Arc::new(sink),
            16,
        )
        .await
        .unwrap();

        transport.publish(insert("m1", "s1"));
        transport.publish(insert("m2", "s1"));

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !lagged.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("overflow was never flagged");

        match rx.recv().await.unwrap() {
            ChannelSignal::Event(event) => assert_eq!(event.message_id().as_str(), "m1"),
            other => panic!("unexpected signal {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        // The forwarder kept running: a drained queue accepts new events.
        transport.publish(insert("m4", "s1"));
        match rx.recv().await.unwrap() {
            ChannelSignal::Event(event) => assert_eq!(event.message_id().as_str(), "m4"),
            other => panic!("unexpected signal {other:?}"),
        }

        conn.close().await;
    }
}
