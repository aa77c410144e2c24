//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client runs against a local
//! development backend with zero configuration.

use std::str::FromStr;
use std::time::Duration;

use sanctuary_realtime::PhoenixConfig;
use sanctuary_shared::constants::{
    DEFAULT_BACKEND_URL, DEFAULT_EVENT_BUFFER, DEFAULT_HEARTBEAT_SECS, DEFAULT_JOIN_TIMEOUT_SECS,
    DEFAULT_SNAPSHOT_LIMIT,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL.
    /// Env: `SANCTUARY_URL`
    pub backend_url: String,

    /// Project API key.
    /// Env: `SANCTUARY_ANON_KEY`
    pub anon_key: String,

    /// Signed-in user's access token, if any.
    /// Env: `SANCTUARY_ACCESS_TOKEN`
    pub access_token: Option<String>,

    /// Messages fetched when a session starts.
    /// Env: `SANCTUARY_SNAPSHOT_LIMIT`
    pub snapshot_limit: usize,

    /// Bounded queue between a room connection and each session.
    /// Env: `SANCTUARY_EVENT_BUFFER`
    pub event_buffer: usize,

    /// Env: `SANCTUARY_HEARTBEAT_SECS`
    pub heartbeat: Duration,

    /// Env: `SANCTUARY_JOIN_TIMEOUT_SECS`
    pub join_timeout: Duration,

    /// Silence after which a session re-fetches its snapshot. Off by default.
    /// Env: `SANCTUARY_RESYNC_IDLE_SECS`
    pub resync_after_idle: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            anon_key: String::new(),
            access_token: None,
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
            resync_after_idle: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source, falling back to
    /// defaults for missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("SANCTUARY_URL").filter(|v| !v.is_empty()) {
            config.backend_url = url;
        }
        if let Some(key) = lookup("SANCTUARY_ANON_KEY") {
            config.anon_key = key;
        }
        if let Some(token) = lookup("SANCTUARY_ACCESS_TOKEN").filter(|v| !v.is_empty()) {
            config.access_token = Some(token);
        }

        if let Some(n) = parse_var(&lookup, "SANCTUARY_SNAPSHOT_LIMIT") {
            config.snapshot_limit = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "SANCTUARY_EVENT_BUFFER") {
            config.event_buffer = n.max(1);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SANCTUARY_HEARTBEAT_SECS") {
            config.heartbeat = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var(&lookup, "SANCTUARY_JOIN_TIMEOUT_SECS") {
            config.join_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SANCTUARY_RESYNC_IDLE_SECS") {
            config.resync_after_idle = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }

    pub fn phoenix_config(&self) -> PhoenixConfig {
        PhoenixConfig {
            endpoint: self.backend_url.clone(),
            api_key: self.anon_key.clone(),
            access_token: self.access_token.clone(),
            heartbeat: self.heartbeat,
            join_timeout: self.join_timeout,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
