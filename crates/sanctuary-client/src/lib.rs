//! # sanctuary-client
//!
//! Room subscriptions for the Sanctuary community app: the ordered
//! per-room message log, the session lifecycle that ties a snapshot fetch
//! to a live connection, the registry that shares one connection per room
//! across sessions, and the services the app's screens are built on.

pub mod config;
pub mod context;
pub mod merger;
pub mod registry;
pub mod services;
pub mod session;

mod error;

pub use config::ClientConfig;
pub use context::ClientContext;
pub use error::{ServiceError, StartError};
pub use merger::RoomLog;
pub use registry::{RoomRegistry, SharedHandle};
pub use session::{RoomSession, SessionState};
