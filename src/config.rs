//! Configuration types for voice session management

use serde::{Deserialize, Serialize};

/// Main configuration for a [`ConnectionManager`](crate::ConnectionManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// Local peer ID (auto-generated if None)
    pub local_peer_id: Option<String>,

    /// Origin claimed on outbound offers and expected as the issuer of
    /// inbound tokens
    pub local_origin: String,

    /// Origins accepted on inbound offers. A claimed origin passes when it
    /// exactly matches or is a prefix of one of these entries.
    pub allowed_origins: Vec<String>,

    /// Bearer token attached to outbound offers. When None, a token is
    /// self-issued from `token_secret` at startup (development mode).
    pub session_token: Option<String>,

    /// Shared HS256 secret used by the local token verifier and issuer
    pub token_secret: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Additional configuration options
    pub options: ConfigOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Additional configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOptions {
    /// Server health probe interval in seconds (default: 30)
    pub probe_interval_secs: u64,

    /// Per-probe timeout in milliseconds (default: 3000)
    pub probe_timeout_ms: u64,

    /// Probe latency above which a reachable server counts as degraded,
    /// in milliseconds (default: 400)
    pub degraded_latency_ms: u64,

    /// Quality sampling interval in milliseconds (default: 2000)
    pub quality_interval_ms: u64,

    /// Strip bandwidth hints and optional codec parameters from outbound
    /// descriptions when that shrinks them (default: true)
    pub trim_descriptions: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            local_peer_id: None,
            local_origin: "http://localhost:3000".to_string(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            session_token: None,
            token_secret: "insecure-dev-secret".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            options: ConfigOptions::default(),
        }
    }
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_ms: 3000,
            degraded_latency_ms: 400,
            quality_interval_ms: 2000,
            trim_descriptions: true,
        }
    }
}

impl ConnectionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a valid WebSocket URL
    /// - `local_origin` or `token_secret` is empty
    /// - `stun_servers` is empty
    /// - `probe_interval_secs` is zero or a timing option is out of range
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.local_origin.is_empty() {
            return Err(Error::InvalidConfig(
                "local_origin must not be empty".to_string(),
            ));
        }

        if self.token_secret.is_empty() {
            return Err(Error::InvalidConfig(
                "token_secret must not be empty".to_string(),
            ));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.options.probe_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "probe_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.options.probe_timeout_ms < 100 || self.options.probe_timeout_ms > 30_000 {
            return Err(Error::InvalidConfig(format!(
                "probe_timeout_ms must be in range 100-30000, got {}",
                self.options.probe_timeout_ms
            )));
        }

        if self.options.quality_interval_ms < 500 || self.options.quality_interval_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "quality_interval_ms must be in range 500-60000, got {}",
                self.options.quality_interval_ms
            )));
        }

        if self.options.degraded_latency_ms < 50 || self.options.degraded_latency_ms > 10_000 {
            return Err(Error::InvalidConfig(format!(
                "degraded_latency_ms must be in range 50-10000, got {}",
                self.options.degraded_latency_ms
            )));
        }

        Ok(())
    }

    /// Set the local peer ID
    ///
    /// Useful for chaining on top of `Default`.
    pub fn with_peer_id(mut self, peer_id: &str) -> Self {
        self.local_peer_id = Some(peer_id.to_string());
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Replace the accepted-origin allow-list
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Set the bearer token attached to outbound offers
    pub fn with_session_token(mut self, token: &str) -> Self {
        self.session_token = Some(token.to_string());
        self
    }

    /// Set the shared token secret
    pub fn with_token_secret(mut self, secret: &str) -> Self {
        self.token_secret = secret.to_string();
        self
    }
}
