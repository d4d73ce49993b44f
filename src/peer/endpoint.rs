//! Peer-connection endpoint seam
//!
//! A [`PeerSession`](crate::peer::session::PeerSession) drives its media
//! transport through the [`MediaEndpoint`] trait and receives everything the
//! transport reports back as [`EndpointEvent`] messages tagged with the
//! producing endpoint's generation. The production implementation wraps a
//! WebRTC peer connection (`rtc` module); tests substitute scripted
//! endpoints and feed synthetic events through the same channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::signaling::{CandidateInit, SessionDescription};
use crate::Result;

/// Connection-level signal reported by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    /// Media transport established
    Connected,
    /// Transport lost, presumed transient
    Disconnected,
    /// Transport failed
    Failed,
}

/// Remote media track handle captured from an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    /// "audio" or "video"
    pub kind: String,
}

/// Events an endpoint reports into the manager loop.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// Transport state edge
    Transport(TransportSignal),
    /// Locally gathered candidate ready to relay to the peer
    Candidate(CandidateInit),
    /// Remote media track arrived
    RemoteTrack(RemoteTrackInfo),
}

/// Envelope delivered on the endpoint event channel.
#[derive(Debug, Clone)]
pub struct EndpointReport {
    pub peer_id: String,
    /// Generation of the endpoint that produced the event. Events from a
    /// replaced endpoint are stale and get dropped by the consumer.
    pub generation: u64,
    pub event: EndpointEvent,
}

/// Sending half handed to each endpoint at creation.
#[derive(Clone)]
pub struct EndpointEventSender {
    peer_id: String,
    generation: u64,
    tx: mpsc::Sender<EndpointReport>,
}

impl EndpointEventSender {
    pub fn new(peer_id: &str, generation: u64, tx: mpsc::Sender<EndpointReport>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    /// Report an event. Dropped silently when the consumer is gone; a torn
    /// down manager has no use for late endpoint events. Dropped with a
    /// warning when the channel is full, which means the manager loop is
    /// not draining reports.
    pub fn emit(&self, event: EndpointEvent) {
        let report = EndpointReport {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        };
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                warn!(
                    peer_id = %self.peer_id,
                    generation = self.generation,
                    event = ?report.event,
                    "endpoint report dropped, event channel is backed up"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Aggregate transport statistics pulled from an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Round-trip estimate from the nominated candidate pair, when known
    pub rtt: Option<Duration>,
}

/// One peer-connection primitive owned by exactly one session.
///
/// Description application is sequenced by the caller: `create_answer` is
/// only valid after a remote offer has been applied, and candidates are only
/// added after a remote description exists (the session's candidate gate
/// enforces that ordering).
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply the peer's description (offer or answer).
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Create an answer to the applied remote offer and apply it locally.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a relayed remote candidate.
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<()>;

    /// Pull current aggregate transport statistics.
    async fn stats(&self) -> Result<TransportStats>;

    /// Release the underlying transport. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Builds endpoints for new or replaced session transports.
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: EndpointEventSender,
    ) -> Result<Arc<dyn MediaEndpoint>>;
}

/// Local capture source collaborator.
///
/// Capture and encoding live outside this crate; the session layer only
/// toggles whether the source feeds the outbound track.
pub trait MediaSource: Send + Sync {
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
}

/// Default [`MediaSource`] backed by a flag the capture pump polls.
#[derive(Debug, Default)]
pub struct CaptureHandle {
    disabled: AtomicBool,
}

impl CaptureHandle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaSource for CaptureHandle {
    fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_handle_starts_enabled() {
        let source = CaptureHandle::new();
        assert!(source.is_enabled());

        source.set_enabled(false);
        assert!(!source.is_enabled());

        source.set_enabled(true);
        assert!(source.is_enabled());
    }

    #[tokio::test]
    async fn test_event_sender_tags_reports() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EndpointEventSender::new("peer-b", 3, tx);

        sender.emit(EndpointEvent::Transport(TransportSignal::Connected));

        let report = rx.recv().await.expect("report");
        assert_eq!(report.peer_id, "peer-b");
        assert_eq!(report.generation, 3);
        assert!(matches!(
            report.event,
            EndpointEvent::Transport(TransportSignal::Connected)
        ));
    }

    #[tokio::test]
    async fn test_event_sender_survives_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EndpointEventSender::new("peer-b", 1, tx);

        sender.emit(EndpointEvent::Transport(TransportSignal::Failed));
    }

    #[tokio::test]
    async fn test_event_sender_drops_overflow_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EndpointEventSender::new("peer-b", 1, tx);

        sender.emit(EndpointEvent::Transport(TransportSignal::Connected));
        sender.emit(EndpointEvent::Transport(TransportSignal::Failed));

        let first = rx.recv().await.expect("first report");
        assert!(matches!(
            first.event,
            EndpointEvent::Transport(TransportSignal::Connected)
        ));
        // the overflow was dropped, not queued
        assert!(rx.try_recv().is_err());

        // capacity freed, reports flow again
        sender.emit(EndpointEvent::Transport(TransportSignal::Disconnected));
        let next = rx.recv().await.expect("next report");
        assert!(matches!(
            next.event,
            EndpointEvent::Transport(TransportSignal::Disconnected)
        ));
    }
}
