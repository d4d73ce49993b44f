//! Scripted media endpoints
//!
//! Endpoints that complete negotiation by bookkeeping instead of ICE: once
//! both a local and a remote description have been applied, the endpoint
//! reports Connected through the same event channel the production WebRTC
//! endpoint uses. Tests inject losses, tracks, and stats the same way.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use voicemesh::peer::{
    EndpointEvent, EndpointEventSender, EndpointFactory, MediaEndpoint, RemoteTrackInfo,
    TransportSignal, TransportStats,
};
use voicemesh::signaling::{CandidateInit, SessionDescription};
use voicemesh::{Error, Result};

/// Behavior switches shared between a factory and its endpoints.
#[derive(Default)]
struct Behavior {
    fail_creates: AtomicBool,
    hold_connected: AtomicBool,
    candidate_on_remote: AtomicBool,
}

/// Builds [`ScriptedEndpoint`]s and keeps hold of every one it made.
pub struct ScriptedFactory {
    label: String,
    behavior: Arc<Behavior>,
    endpoints: Mutex<Vec<Arc<ScriptedEndpoint>>>,
    create_calls: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            behavior: Arc::new(Behavior::default()),
            endpoints: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
        })
    }

    /// Refuse endpoint creation until switched back.
    pub fn set_fail_creates(&self, fail: bool) {
        self.behavior.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Keep endpoints from reporting Connected on their own.
    pub fn set_hold_connected(&self, hold: bool) {
        self.behavior.hold_connected.store(hold, Ordering::SeqCst);
    }

    /// Emit one local candidate after each remote description is applied.
    pub fn set_candidate_on_remote(&self, emit: bool) {
        self.behavior.candidate_on_remote.store(emit, Ordering::SeqCst);
    }

    /// Total `create` calls, refused ones included.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Most recently built endpoint facing `peer_id`.
    pub fn endpoint_for(&self, peer_id: &str) -> Option<Arc<ScriptedEndpoint>> {
        self.endpoints
            .lock()
            .iter()
            .rev()
            .find(|endpoint| endpoint.remote_peer() == peer_id)
            .cloned()
    }

    pub fn endpoints(&self) -> Vec<Arc<ScriptedEndpoint>> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl EndpointFactory for ScriptedFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: EndpointEventSender,
    ) -> Result<Arc<dyn MediaEndpoint>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::PeerConnectionError(
                "scripted factory is refusing endpoints".to_string(),
            ));
        }
        let endpoint = Arc::new(ScriptedEndpoint {
            label: self.label.clone(),
            remote_peer: peer_id.to_string(),
            events,
            behavior: self.behavior.clone(),
            calls: Mutex::new(Vec::new()),
            local_described: AtomicBool::new(false),
            remote_described: AtomicBool::new(false),
            reported_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: Mutex::new(TransportStats::default()),
        });
        self.endpoints.lock().push(endpoint.clone());
        Ok(endpoint)
    }
}

/// One scripted peer-connection primitive. Records every call it receives.
pub struct ScriptedEndpoint {
    label: String,
    remote_peer: String,
    events: EndpointEventSender,
    behavior: Arc<Behavior>,
    calls: Mutex<Vec<String>>,
    local_described: AtomicBool,
    remote_described: AtomicBool,
    reported_connected: AtomicBool,
    closed: AtomicBool,
    stats: Mutex<TransportStats>,
}

impl ScriptedEndpoint {
    /// Remote peer this endpoint faces.
    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Ordered log of the endpoint methods called so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a transport signal as if ICE produced it.
    pub fn report(&self, signal: TransportSignal) {
        if signal == TransportSignal::Connected {
            self.reported_connected.store(true, Ordering::SeqCst);
        }
        self.events.emit(EndpointEvent::Transport(signal));
    }

    /// Report an inbound remote media track.
    pub fn report_track(&self, track_id: &str, stream_id: &str, kind: &str) {
        self.events.emit(EndpointEvent::RemoteTrack(RemoteTrackInfo {
            track_id: track_id.to_string(),
            stream_id: stream_id.to_string(),
            kind: kind.to_string(),
        }));
    }

    /// Replace the stats handed to the quality sampler.
    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    fn log(&self, entry: impl Into<String>) {
        self.calls.lock().push(entry.into());
    }

    fn maybe_report_connected(&self) {
        if self.behavior.hold_connected.load(Ordering::SeqCst) {
            return;
        }
        if !self.local_described.load(Ordering::SeqCst)
            || !self.remote_described.load(Ordering::SeqCst)
        {
            return;
        }
        if self.reported_connected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events
            .emit(EndpointEvent::Transport(TransportSignal::Connected));
    }
}

#[async_trait]
impl MediaEndpoint for ScriptedEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.log("create_offer");
        self.local_described.store(true, Ordering::SeqCst);
        self.maybe_report_connected();
        Ok(SessionDescription::offer(format!(
            "v=0\r\ns={}\r\n",
            self.label
        )))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.log(format!("set_remote:{}", description.kind));
        self.remote_described.store(true, Ordering::SeqCst);
        if self.behavior.candidate_on_remote.load(Ordering::SeqCst) {
            self.events.emit(EndpointEvent::Candidate(CandidateInit {
                candidate: format!(
                    "candidate:{} 1 udp 2130706431 192.0.2.7 50000 typ host",
                    self.label
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
        self.maybe_report_connected();
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.log("create_answer");
        self.local_described.store(true, Ordering::SeqCst);
        self.maybe_report_connected();
        Ok(SessionDescription::answer(format!(
            "v=0\r\ns={}\r\n",
            self.label
        )))
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<()> {
        self.log(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(*self.stats.lock())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.log("close");
        Ok(())
    }
}
