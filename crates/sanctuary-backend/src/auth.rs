//! Who the current actor is.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use sanctuary_shared::ActorId;

use crate::error::{BackendError, Result};

#[async_trait]
pub trait ActorProvider: Send + Sync {
    /// `None` when nobody is signed in.
    async fn current_actor(&self) -> Option<ActorId>;
}

/// A fixed, settable actor.
#[derive(Default)]
pub struct StaticActor {
    actor: RwLock<Option<ActorId>>,
}

impl StaticActor {
    pub fn new(actor: Option<ActorId>) -> Self {
        Self {
            actor: RwLock::new(actor),
        }
    }

    pub fn signed_in(actor: &str) -> Self {
        Self::new(Some(ActorId::new(actor)))
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn set(&self, actor: Option<ActorId>) {
        *self.actor.write().unwrap_or_else(|p| p.into_inner()) = actor;
    }
}

#[async_trait]
impl ActorProvider for StaticActor {
    async fn current_actor(&self) -> Option<ActorId> {
        self.actor.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
}

/// Resolves the actor behind an access token via `GET {url}/auth/v1/user`.
///
/// A definite answer (user or rejected token) is cached; a network failure
/// is not, so the next call tries again.
pub struct TokenActor {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    cached: Mutex<Option<Option<ActorId>>>,
}

impl TokenActor {
    pub fn new(base_url: &str, api_key: &str, access_token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::transport(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token,
            cached: Mutex::new(None),
        })
    }

    async fn resolve(&self, token: &str) -> Result<Option<ActorId>> {
        let resp = self
            .http
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "Access token rejected");
            return Ok(None);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;
        if !status.is_success() {
            return Err(BackendError::from_response(status.as_u16(), &body));
        }

        let user: AuthUser = serde_json::from_str(&body).map_err(|e| {
            BackendError::new(Some(status.as_u16()), None, format!("Invalid user response: {e}"))
        })?;
        let actor = ActorId::new(user.id);
        info!(actor = %actor.short(), "Signed in");
        Ok(Some(actor))
    }
}

#[async_trait]
impl ActorProvider for TokenActor {
    async fn current_actor(&self) -> Option<ActorId> {
        let token = self.access_token.as_deref()?;

        let mut cached = self.cached.lock().await;
        if let Some(actor) = cached.as_ref() {
            return actor.clone();
        }

        match self.resolve(token).await {
            Ok(actor) => {
                *cached = Some(actor.clone());
                actor
            }
            Err(e) => {
                warn!(error = %e, "Could not resolve current user");
                None
            }
        }
    }
}
