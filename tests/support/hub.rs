//! In-memory signaling relay
//!
//! Routes [`SignalMessage`]s between registered peers the way the real
//! WebSocket relay does: channel announcements fan out membership events to
//! everyone affected, targeted messages go to `targetPeerId` only, and
//! payloads are never inspected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use voicemesh::signaling::{SignalMessage, SignalingTransport};
use voicemesh::{Error, Result};

const INBOX_CAPACITY: usize = 64;

/// In-memory stand-in for the signaling relay.
#[derive(Default)]
pub struct SignalingHub {
    state: Arc<HubState>,
}

#[derive(Default)]
struct HubState {
    inboxes: Mutex<HashMap<String, mpsc::Sender<SignalMessage>>>,
    channels: Mutex<HashMap<String, Vec<String>>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer with the relay. Returns the transport the peer sends
    /// through and the stream of messages the relay delivers to it.
    pub fn register(&self, peer_id: &str) -> (Arc<HubTransport>, mpsc::Receiver<SignalMessage>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.state.inboxes.lock().insert(peer_id.to_string(), tx);
        let transport = Arc::new(HubTransport {
            state: self.state.clone(),
            connected: AtomicBool::new(true),
        });
        (transport, rx)
    }
}

impl HubState {
    /// Work out every delivery a message causes. Locks are released before
    /// anything is actually sent.
    fn plan(&self, message: SignalMessage) -> Vec<(mpsc::Sender<SignalMessage>, SignalMessage)> {
        let inboxes = self.inboxes.lock();
        let mut deliveries = Vec::new();

        match message {
            SignalMessage::JoinChannel {
                channel_id,
                user_id,
            } => {
                let mut channels = self.channels.lock();
                let members = channels.entry(channel_id.clone()).or_default();
                for member in members.iter() {
                    if let Some(tx) = inboxes.get(member) {
                        deliveries.push((
                            tx.clone(),
                            SignalMessage::PeerJoined {
                                peer_id: user_id.clone(),
                                channel_id: channel_id.clone(),
                            },
                        ));
                    }
                    if let Some(tx) = inboxes.get(&user_id) {
                        deliveries.push((
                            tx.clone(),
                            SignalMessage::PeerJoined {
                                peer_id: member.clone(),
                                channel_id: channel_id.clone(),
                            },
                        ));
                    }
                }
                members.push(user_id);
            }
            SignalMessage::LeaveChannel {
                channel_id,
                user_id,
            } => {
                let mut channels = self.channels.lock();
                if let Some(members) = channels.get_mut(&channel_id) {
                    members.retain(|member| member != &user_id);
                    for member in members.iter() {
                        if let Some(tx) = inboxes.get(member) {
                            deliveries.push((
                                tx.clone(),
                                SignalMessage::PeerLeft {
                                    peer_id: user_id.clone(),
                                },
                            ));
                        }
                    }
                }
            }
            SignalMessage::Offer {
                ref target_peer_id, ..
            }
            | SignalMessage::Answer {
                ref target_peer_id, ..
            }
            | SignalMessage::IceCandidate {
                ref target_peer_id, ..
            } => {
                let inbox = inboxes.get(target_peer_id).cloned();
                if let Some(tx) = inbox {
                    deliveries.push((tx, message));
                }
            }
            // relay-originated kinds are never accepted from clients
            SignalMessage::PeerJoined { .. } | SignalMessage::PeerLeft { .. } => {}
        }

        deliveries
    }
}

/// Transport handle for one registered peer.
pub struct HubTransport {
    state: Arc<HubState>,
    connected: AtomicBool,
}

impl HubTransport {
    /// Simulate losing or regaining the relay link. Sends fail while
    /// offline; inbound delivery is unaffected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingTransport for HubTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: SignalMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SignalingUnavailable(
                "hub transport offline".to_string(),
            ));
        }
        for (tx, message) in self.state.plan(message) {
            let _ = tx.send(message).await;
        }
        Ok(())
    }
}
