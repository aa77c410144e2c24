//! Process-wide map from room to its single shared channel connection.
//!
//! The first `acquire` for a room opens the connection; later acquirers join
//! its fan-out. The connection is closed when the last handle is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use sanctuary_realtime::{ChannelConnection, ChannelSignal, EventSink, RealtimeTransport};
use sanctuary_shared::{ConnectionError, RoomId, RoomSpec};

/// Proof of one `acquire`. Released by value, so it cannot be released twice.
#[derive(Debug, PartialEq, Eq)]
pub struct SharedHandle {
    room_id: RoomId,
    subscriber: u64,
}

impl SharedHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}

/// Delivers every signal of one connection to all of the room's subscribers.
/// Subscribers are [`QueueSink`](sanctuary_realtime::QueueSink)s, so one slow
/// subscriber never delays the rest.
#[derive(Default)]
struct Fanout {
    subscribers: Mutex<HashMap<u64, Arc<dyn EventSink>>>,
    interrupted: AtomicBool,
}

impl Fanout {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn EventSink>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl EventSink for Fanout {
    async fn deliver(&self, signal: ChannelSignal) {
        if signal == ChannelSignal::Interrupted {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        let sinks: Vec<Arc<dyn EventSink>> = self.subscribers().values().cloned().collect();
        for sink in sinks {
            sink.deliver(signal.clone()).await;
        }
    }
}

struct Entry {
    spec: RoomSpec,
    connection: ChannelConnection,
    fanout: Arc<Fanout>,
    refcount: usize,
}

pub struct RoomRegistry {
    transport: Arc<dyn RealtimeTransport>,
    buffer: usize,
    rooms: AsyncMutex<HashMap<RoomId, Entry>>,
    next_subscriber: AtomicU64,
}

impl RoomRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>, buffer: usize) -> Self {
        Self {
            transport,
            buffer,
            rooms: AsyncMutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Join the room's fan-out, opening its connection if this is the
    /// first subscriber.
    pub async fn acquire(
        &self,
        spec: RoomSpec,
        sink: Arc<dyn EventSink>,
    ) -> Result<SharedHandle, ConnectionError> {
        let mut rooms = self.rooms.lock().await;
        let subscriber = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let room_id = spec.room_id.clone();

        if let Some(entry) = rooms.get_mut(&room_id) {
            entry.fanout.subscribers().insert(subscriber, sink);
            entry.refcount += 1;
            debug!(room = %room_id, refcount = entry.refcount, "Joined shared connection");
            return Ok(SharedHandle { room_id, subscriber });
        }

        let fanout = Arc::new(Fanout::default());
        fanout.subscribers().insert(subscriber, sink);
        let connection =
            ChannelConnection::open(self.transport.clone(), spec.clone(), fanout.clone(), self.buffer)
                .await?;

        info!(room = %room_id, "Room registered");
        rooms.insert(
            room_id.clone(),
            Entry {
                spec,
                connection,
                fanout,
                refcount: 1,
            },
        );
        Ok(SharedHandle { room_id, subscriber })
    }

    /// Drop one subscriber. The last release closes the connection.
    pub async fn release(&self, handle: SharedHandle) {
        let mut rooms = self.rooms.lock().await;

        let remaining = match rooms.get_mut(&handle.room_id) {
            Some(entry) => {
                entry.fanout.subscribers().remove(&handle.subscriber);
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount
            }
            None => {
                warn!(room = %handle.room_id, "Release for unknown room");
                return;
            }
        };

        if remaining > 0 {
            debug!(room = %handle.room_id, refcount = remaining, "Released shared connection");
            return;
        }

        if let Some(entry) = rooms.remove(&handle.room_id) {
            entry.connection.close().await;
            info!(room = %handle.room_id, "Room unregistered");
        }
    }

    /// Reopen the room's connection if the transport dropped it. Existing
    /// subscribers keep their place in the fan-out. Returns whether a new
    /// connection was opened.
    pub async fn revive(&self, handle: &SharedHandle) -> Result<bool, ConnectionError> {
        let mut rooms = self.rooms.lock().await;
        let Some(entry) = rooms.get_mut(&handle.room_id) else {
            return Err(ConnectionError::Closed);
        };
        if !entry.fanout.interrupted.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let connection = ChannelConnection::open(
            self.transport.clone(),
            entry.spec.clone(),
            entry.fanout.clone(),
            self.buffer,
        )
        .await?;

        let stale = std::mem::replace(&mut entry.connection, connection);
        stale.close().await;
        entry.fanout.interrupted.store(false, Ordering::SeqCst);
        info!(room = %handle.room_id, "Room connection reopened");
        Ok(true)
    }

    /// Whether the room's connection is up and has not been interrupted.
    pub async fn is_live(&self, room_id: &RoomId) -> bool {
        self.rooms.lock().await.get(room_id).is_some_and(|entry| {
            entry.connection.is_open() && !entry.fanout.interrupted.load(Ordering::SeqCst)
        })
    }

    pub async fn refcount(&self, room_id: &RoomId) -> usize {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .map(|entry| entry.refcount)
            .unwrap_or(0)
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.rooms.lock().await.keys().cloned().collect();
        rooms.sort();
        rooms
    }
}
