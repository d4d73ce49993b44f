//! Two-peer integration harness
//!
//! Wires real [`ConnectionManager`] loops to an in-memory signaling hub and
//! scripted media endpoints so negotiation, recovery, and telemetry flows
//! run end to end without sockets or a live WebRTC stack. Tests run under a
//! paused tokio clock; the retry schedule advances in virtual time.

#![allow(dead_code)]

pub mod hub;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use voicemesh::peer::CaptureHandle;
use voicemesh::security::{LocalTokenVerifier, TokenVerifier};
use voicemesh::signaling::{SessionDescription, SignalMessage};
use voicemesh::{
    ConnectionConfig, ConnectionManager, ConnectionState, FailureKind, FaultRecord, QualityGrade,
    QualitySample, RemoteTrackInfo, SessionEvent,
};

pub use hub::{HubTransport, SignalingHub};
pub use scripted::{ScriptedEndpoint, ScriptedFactory};

/// Ceiling for event waits. The clock is paused, so hitting it costs no
/// wall time; it just has to outlast the longest retry slot.
pub const WAIT_CEILING: Duration = Duration::from_secs(120);

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,voicemesh=debug")
        .try_init();
}

/// One manager wired to the hub over scripted endpoints.
pub struct TestPeer {
    pub manager: Arc<ConnectionManager>,
    pub events: mpsc::Receiver<SessionEvent>,
    pub factory: Arc<ScriptedFactory>,
    pub transport: Arc<HubTransport>,
}

/// Spawn a manager with the default development config.
pub fn spawn_peer(hub: &SignalingHub, peer_id: &str) -> TestPeer {
    spawn_peer_with(hub, ConnectionConfig::default().with_peer_id(peer_id))
}

/// Spawn a manager with a custom config. The peer id must be set so the hub
/// can route to it.
pub fn spawn_peer_with(hub: &SignalingHub, config: ConnectionConfig) -> TestPeer {
    let peer_id = config.local_peer_id.clone().expect("peer id required");
    let (transport, inbound) = hub.register(&peer_id);
    let factory = ScriptedFactory::new(&peer_id);
    let verifier: Arc<dyn TokenVerifier> =
        Arc::new(LocalTokenVerifier::new(config.token_secret.clone()));
    let (manager, events) = ConnectionManager::with_transport(
        config,
        transport.clone(),
        inbound,
        factory.clone(),
        Arc::new(CaptureHandle::new()),
        verifier,
        None,
        None,
    )
    .expect("manager builds");
    TestPeer {
        manager,
        events,
        factory,
        transport,
    }
}

/// A hand-driven peer on the hub: registers like a manager would, but the
/// test script plays its side of the protocol.
pub struct PuppetPeer {
    pub peer_id: String,
    pub transport: Arc<HubTransport>,
    pub inbound: mpsc::Receiver<SignalMessage>,
}

pub fn spawn_puppet(hub: &SignalingHub, peer_id: &str) -> PuppetPeer {
    let (transport, inbound) = hub.register(peer_id);
    PuppetPeer {
        peer_id: peer_id.to_string(),
        transport,
        inbound,
    }
}

impl PuppetPeer {
    /// Announce presence in a channel.
    pub async fn join(&self, channel_id: &str) {
        self.transport
            .send_message(SignalMessage::JoinChannel {
                channel_id: channel_id.to_string(),
                user_id: self.peer_id.clone(),
            })
            .await;
    }

    /// Send a valid offer: the claimed origin and token line up with what a
    /// default-config responder accepts.
    pub async fn send_offer(&self, target: &str) {
        let defaults = ConnectionConfig::default();
        self.send_offer_claiming(target, &defaults.local_origin, &defaults.token_secret)
            .await;
    }

    /// Send an offer with a chosen origin claim and token signing secret,
    /// for driving the rejection paths.
    pub async fn send_offer_claiming(&self, target: &str, origin: &str, secret: &str) {
        let token = LocalTokenVerifier::new(secret.to_string())
            .generate(&self.peer_id, origin, 3600)
            .expect("puppet token issues");
        self.transport
            .send_message(SignalMessage::Offer {
                target_peer_id: target.to_string(),
                from_peer_id: self.peer_id.clone(),
                offer: SessionDescription::offer("v=0\r\n"),
                origin: origin.to_string(),
                token,
            })
            .await;
    }

    /// Answer an initiator.
    pub async fn send_answer(&self, target: &str) {
        self.transport
            .send_message(SignalMessage::Answer {
                target_peer_id: target.to_string(),
                from_peer_id: self.peer_id.clone(),
                answer: SessionDescription::answer("v=0\r\n"),
            })
            .await;
    }

    /// Relay a candidate line to `target`.
    pub async fn send_candidate(&self, target: &str, candidate: &str) {
        self.transport
            .send_message(SignalMessage::IceCandidate {
                target_peer_id: target.to_string(),
                from_peer_id: self.peer_id.clone(),
                candidate: voicemesh::CandidateInit {
                    candidate: candidate.to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                },
            })
            .await;
    }

    /// Wait for an offer addressed to this puppet, skipping other traffic.
    pub async fn expect_offer(&mut self) -> (String, SessionDescription) {
        let wait = async {
            while let Some(message) = self.inbound.recv().await {
                if let SignalMessage::Offer {
                    from_peer_id,
                    offer,
                    ..
                } = message
                {
                    return (from_peer_id, offer);
                }
            }
            panic!("hub closed before an offer arrived");
        };
        tokio::time::timeout(WAIT_CEILING, wait)
            .await
            .expect("timed out waiting for an offer")
    }

    /// Wait for an answer addressed to this puppet.
    pub async fn expect_answer(&mut self) -> (String, SessionDescription) {
        let wait = async {
            while let Some(message) = self.inbound.recv().await {
                if let SignalMessage::Answer {
                    from_peer_id,
                    answer,
                    ..
                } = message
                {
                    return (from_peer_id, answer);
                }
            }
            panic!("hub closed before an answer arrived");
        };
        tokio::time::timeout(WAIT_CEILING, wait)
            .await
            .expect("timed out waiting for an answer")
    }
}

impl HubTransport {
    /// Send through the relay from test code, where failure is a test bug.
    pub async fn send_message(&self, message: SignalMessage) {
        use voicemesh::signaling::SignalingTransport;
        self.send(message).await.expect("hub send");
    }
}

/// Receive events until `peer_id` reaches `state`, skipping everything else.
pub async fn wait_for_state(
    events: &mut mpsc::Receiver<SessionEvent>,
    peer_id: &str,
    state: ConnectionState,
) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::PeerStateChanged {
                peer_id: event_peer,
                state: event_state,
            } = &event
            {
                if event_peer == peer_id && *event_state == state {
                    return;
                }
            }
        }
        panic!("event stream ended before {} reached {}", peer_id, state);
    };
    tokio::time::timeout(WAIT_CEILING, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {} to reach {}", peer_id, state));
}

/// Receive events until a fault of `kind` is reported.
pub async fn wait_for_fault(
    events: &mut mpsc::Receiver<SessionEvent>,
    kind: FailureKind,
) -> FaultRecord {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::Error(record) = event {
                if record.kind == kind {
                    return record;
                }
            }
        }
        panic!("event stream ended before a {} fault", kind);
    };
    tokio::time::timeout(WAIT_CEILING, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for a {} fault", kind))
}

/// Receive events until a remote track for `peer_id` surfaces.
pub async fn wait_for_track(
    events: &mut mpsc::Receiver<SessionEvent>,
    peer_id: &str,
) -> RemoteTrackInfo {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::RemoteTrack {
                peer_id: event_peer,
                track,
            } = event
            {
                if event_peer == peer_id {
                    return track;
                }
            }
        }
        panic!("event stream ended before a track from {}", peer_id);
    };
    tokio::time::timeout(WAIT_CEILING, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for a track from {}", peer_id))
}

/// Receive events until a quality report for `peer_id` lands.
pub async fn wait_for_quality(
    events: &mut mpsc::Receiver<SessionEvent>,
    peer_id: &str,
) -> (QualityGrade, QualitySample) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::Quality {
                peer_id: event_peer,
                grade,
                sample,
            } = event
            {
                if event_peer == peer_id {
                    return (grade, sample);
                }
            }
        }
        panic!("event stream ended before a quality report for {}", peer_id);
    };
    tokio::time::timeout(WAIT_CEILING, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for quality on {}", peer_id))
}

/// Poll until `predicate` holds.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let wait = async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT_CEILING, wait)
        .await
        .expect("timed out waiting for condition");
}
