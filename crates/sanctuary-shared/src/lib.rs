//! Types shared by every Sanctuary crate: identifiers, chat records,
//! realtime change records, room descriptions and the error taxonomy.

pub mod constants;
pub mod error;
pub mod message;
pub mod protocol;
pub mod room;
pub mod types;
pub mod visibility;

pub use error::{ConnectionError, DecodeError, FetchError, SendError};
pub use message::{AuthorProfile, Message, MessagePatch, RoomEvent};
pub use protocol::{ChangeFeed, ChangeKind, ChangeRecord, TopicFilter};
pub use room::RoomSpec;
pub use types::{ActorId, MessageId, RoomId};
pub use visibility::Visibility;
