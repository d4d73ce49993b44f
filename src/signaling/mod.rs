//! Signaling transport seam and implementations
//!
//! The manager never talks to a socket directly. It sends through a
//! [`SignalingTransport`] and consumes inbound messages from the
//! `mpsc::Receiver<SignalMessage>` produced when the transport is attached.
//! [`WsSignaling`] is the production implementation over a WebSocket relay;
//! tests attach in-memory hubs behind the same trait.

pub mod protocol;
pub mod websocket;

use async_trait::async_trait;

pub use protocol::{CandidateInit, DescriptionKind, SessionDescription, SignalMessage};
pub use websocket::WsSignaling;

use crate::Result;

/// Outbound half of the signaling bus.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Whether the underlying channel is currently usable.
    ///
    /// `join_channel`/`leave_channel` check this before doing any work and
    /// reject synchronously when it is false.
    fn is_connected(&self) -> bool;

    /// Relay one message. The relay routes peer-addressed messages by
    /// `targetPeerId`; channel announcements fan out to channel members.
    async fn send(&self, message: SignalMessage) -> Result<()>;
}
