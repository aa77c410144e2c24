// Realtime layer: one subscription per room topic on top of the backend's
// change stream.

pub mod connection;
pub mod local;
pub mod phoenix;
pub mod transport;

pub use connection::{ChannelConnection, ChannelSignal, EventSink, QueueSink};
pub use local::LocalTransport;
pub use phoenix::{PhoenixConfig, PhoenixTransport};
pub use transport::{RealtimeTransport, SubscriptionHandle};
