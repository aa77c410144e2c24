//! # sanctuary-backend
//!
//! Data operations against the hosted backend: the [`Backend`] seam, a
//! PostgREST HTTP client, an in-process implementation used for local
//! development and tests, and the providers that tell the client who the
//! current actor is.

pub mod auth;
pub mod backend;
pub mod memory;
pub mod query;
pub mod rest;

mod error;

pub use auth::{ActorProvider, StaticActor, TokenActor};
pub use backend::Backend;
pub use error::{BackendError, Result};
pub use memory::MemoryBackend;
pub use query::{Condition, Direction, Query};
pub use rest::RestBackend;
