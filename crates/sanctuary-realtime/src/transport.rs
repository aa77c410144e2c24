//! The seam between room connections and whatever carries the backend's
//! change stream.

use async_trait::async_trait;
use tokio::sync::mpsc;

use sanctuary_shared::{ChangeRecord, ConnectionError, RoomId, TopicFilter};

/// Identifies one live subscription on a transport; used only for teardown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: RoomId,
}

/// A realtime pub/sub transport.
///
/// Changes matching the filter are pushed into `sink` in the order the
/// transport received them. Delivery is at-most-once: when the transport
/// loses its connection it drops the sink without replaying anything, and
/// the receiver observes end-of-stream.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(
        &self,
        filter: TopicFilter,
        sink: mpsc::Sender<ChangeRecord>,
    ) -> Result<SubscriptionHandle, ConnectionError>;

    /// Release a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}
