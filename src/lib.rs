//! Peer-to-peer voice session management
//!
//! This crate establishes, monitors, and recovers WebRTC voice connections
//! between the participants of a channel, using a relayed signaling
//! transport for negotiation.
//!
//! # Features
//!
//! - **Mesh sessions**: one peer connection per remote participant, with a
//!   deterministic tie-break deciding which side initiates
//! - **Authorization**: inbound offers pass origin allow-list and bearer
//!   token checks before any negotiation state exists
//! - **Recovery**: fixed-schedule backoff reconnection with endpoint
//!   rebuild, bounded at six attempts
//! - **Candidate buffering**: remote ICE candidates arriving before the
//!   remote description are held and flushed in receipt order
//! - **Telemetry**: per-session quality grading and ICE server health
//!   probing
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ConnectionManager (event loop, owns the session map)    │
//! │  ├─ WsSignaling (JSON messages over WebSocket relay)     │
//! │  ├─ SecurityValidator (origin allow-list + token)        │
//! │  ├─ PeerSession per remote peer                          │
//! │  │   ├─ RtcEndpoint (RTCPeerConnection wrapper)          │
//! │  │   ├─ candidate gate + retry schedule                  │
//! │  │   └─ QualityMonitor while Connected                   │
//! │  └─ ServerHealthMonitor (STUN/TURN probe cycle)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use voicemesh::ConnectionConfig;
//!
//! let config = ConnectionConfig::default()
//!     .with_peer_id("peer-alice")
//!     .with_allowed_origins(vec!["https://voice.example.com".to_string()]);
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async usage
//!
//! ```no_run
//! use voicemesh::{ConnectionConfig, ConnectionManager};
//!
//! # async fn example() -> voicemesh::Result<()> {
//! let config = ConnectionConfig::default().with_peer_id("peer-alice");
//! let (manager, mut events) = ConnectionManager::connect(config).await?;
//!
//! manager.join_channel("general").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod peer;
pub mod security;
pub mod signaling;

pub use config::{ConfigOptions, ConnectionConfig, TurnServerConfig};
pub use error::{Error, FailureKind, Result};
pub use events::{FaultLog, FaultRecord, SessionEvent};
pub use health::{
    HealthReport, OverallHealth, ProbeHealth, ServerCategory, ServerHealthMonitor, ServerRecord,
};
pub use manager::{ConnectionManager, ConnectionStatus, PeerSummary};
pub use peer::{
    ConnectionState, QualityGrade, QualitySample, RemoteTrackInfo, SessionRole, TransportStats,
};
pub use security::{AccessClaims, LocalTokenVerifier, SecurityValidator, TokenVerifier};
pub use signaling::{
    CandidateInit, DescriptionKind, SessionDescription, SignalMessage, SignalingTransport,
    WsSignaling,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
