//! Application context: the backend, transport, identity provider and room
//! registry every session and service shares.

use std::sync::Arc;

use tracing::info;

use sanctuary_backend::{ActorProvider, Backend, MemoryBackend, RestBackend, TokenActor};
use sanctuary_realtime::{LocalTransport, PhoenixTransport, RealtimeTransport};
use sanctuary_shared::{ActorId, RoomSpec, Visibility};

use crate::config::ClientConfig;
use crate::error::{ServiceError, StartError};
use crate::registry::RoomRegistry;
use crate::session::{RoomSession, SessionDeps};

/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct ClientContext {
    pub backend: Arc<dyn Backend>,
    pub actors: Arc<dyn ActorProvider>,
    pub registry: Arc<RoomRegistry>,
    pub config: ClientConfig,
}

impl ClientContext {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn RealtimeTransport>,
        actors: Arc<dyn ActorProvider>,
        config: ClientConfig,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(transport, config.event_buffer));
        Self {
            backend,
            actors,
            registry,
            config,
        }
    }

    /// Connect to the hosted backend described by `config`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ServiceError> {
        let backend = RestBackend::new(&config.backend_url, &config.anon_key)?
            .with_access_token(config.access_token.clone());
        let actors = TokenActor::new(
            &config.backend_url,
            &config.anon_key,
            config.access_token.clone(),
        )?;
        let transport = PhoenixTransport::connect(config.phoenix_config()).await?;

        info!(url = %config.backend_url, signed_in = config.access_token.is_some(), "Connected to backend");
        Ok(Self::new(
            Arc::new(backend),
            Arc::new(transport),
            Arc::new(actors),
            config,
        ))
    }

    /// Wire an in-process backend to an in-process transport so that every
    /// committed write is published to live subscriptions.
    pub fn in_memory(
        actors: Arc<dyn ActorProvider>,
        config: ClientConfig,
    ) -> (Self, Arc<MemoryBackend>, Arc<LocalTransport>) {
        let backend = Arc::new(MemoryBackend::new());
        let transport = Arc::new(LocalTransport::new());
        backend.attach_feed(transport.clone());

        let ctx = Self::new(backend.clone(), transport.clone(), actors, config);
        (ctx, backend, transport)
    }

    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            backend: self.backend.clone(),
            actors: self.actors.clone(),
            registry: self.registry.clone(),
            snapshot_limit: self.config.snapshot_limit,
            event_buffer: self.config.event_buffer,
            resync_after_idle: self.config.resync_after_idle,
        }
    }

    pub async fn current_actor(&self) -> Option<ActorId> {
        self.actors.current_actor().await
    }

    pub async fn open_room(
        &self,
        spec: RoomSpec,
        visibility: Visibility,
    ) -> Result<RoomSession, StartError> {
        RoomSession::start(self.session_deps(), spec, visibility).await
    }
}
