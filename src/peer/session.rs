//! Per-peer session state machine
//!
//! One [`PeerSession`] exists per remote peer in the joined channel. It owns
//! the media endpoint for that peer, the ordered buffer of remote candidates
//! that arrived before a remote description, and the reconnection counter.
//! State transitions are driven exclusively from the manager loop; spawned
//! helpers (retry timers, quality samplers) only send messages back into it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::peer::backoff::RetryPolicy;
use crate::peer::endpoint::{MediaEndpoint, RemoteTrackInfo};
use crate::peer::quality::{QualityGrade, QualitySample};
use crate::signaling::{CandidateInit, SessionDescription};
use crate::Result;

/// Buffered remote candidates older than this are pruned on each arrival.
pub const CANDIDATE_RETENTION: Duration = Duration::from_secs(30);

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry schedule exhausted; stays here until externally forced
    Failed,
    /// Terminal
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// States from which a transport loss triggers the retry schedule.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

/// Which side of the pair drives the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

impl SessionRole {
    /// Deterministic tie-break over the two participant ids: the
    /// lexicographically smaller id initiates. Re-running with the same
    /// pair always yields the same assignment, and exactly one side of a
    /// pair becomes Initiator.
    pub fn assign(local_id: &str, remote_id: &str) -> SessionRole {
        if local_id < remote_id {
            SessionRole::Initiator
        } else {
            SessionRole::Responder
        }
    }
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Initiator => write!(f, "initiator"),
            SessionRole::Responder => write!(f, "responder"),
        }
    }
}

struct PendingCandidate {
    candidate: CandidateInit,
    received_at: Instant,
}

/// Gate between candidate arrival and candidate application.
///
/// Candidates must never reach the endpoint before a remote description is
/// applied. The gate buffers early arrivals in receipt order and flushes
/// them immediately after the description lands. The tokio mutex is held
/// across the endpoint calls so arrivals racing a flush still apply in
/// receipt order. Endpoint rebuilds run under the same lock, so the gate
/// flags and the installed endpoint are always observed as a pair from one
/// generation.
#[derive(Default)]
struct CandidateGate {
    remote_applied: bool,
    pending: VecDeque<PendingCandidate>,
}

impl CandidateGate {
    fn prune_stale(&mut self, now: Instant) {
        while let Some(front) = self.pending.front() {
            if now.duration_since(front.received_at) > CANDIDATE_RETENTION {
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct PeerSession {
    peer_id: String,
    role: SessionRole,
    state: RwLock<ConnectionState>,
    endpoint: RwLock<Arc<dyn MediaEndpoint>>,
    gate: tokio::sync::Mutex<CandidateGate>,
    reconnect_attempts: AtomicU32,
    /// Bumped each time the endpoint is rebuilt; events tagged with an older
    /// generation are stale.
    generation: AtomicU64,
    last_quality: RwLock<Option<(QualitySample, QualityGrade)>>,
    remote_tracks: RwLock<Vec<RemoteTrackInfo>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    policy: RetryPolicy,
}

impl PeerSession {
    pub fn new(
        peer_id: &str,
        role: SessionRole,
        endpoint: Arc<dyn MediaEndpoint>,
        generation: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            role,
            state: RwLock::new(ConnectionState::Disconnected),
            endpoint: RwLock::new(endpoint),
            gate: tokio::sync::Mutex::new(CandidateGate::default()),
            reconnect_attempts: AtomicU32::new(0),
            generation: AtomicU64::new(generation),
            last_quality: RwLock::new(None),
            remote_tracks: RwLock::new(Vec::new()),
            retry_timer: Mutex::new(None),
            sampler: Mutex::new(None),
            policy: RetryPolicy::default(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Transition to `next`, returning the previous state. Logs real edges
    /// only.
    pub fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut guard = self.state.write();
        let previous = *guard;
        if previous != next {
            debug!(
                peer_id = %self.peer_id,
                from = %previous,
                to = %next,
                "session state change"
            );
            *guard = next;
        }
        previous
    }

    pub fn endpoint(&self) -> Arc<dyn MediaEndpoint> {
        self.endpoint.read().clone()
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Install a freshly built endpoint for a retry round and return its
    /// generation. Runs entirely under the candidate gate: buffered
    /// candidates belong to the discarded negotiation and are dropped, and
    /// no negotiation step can interleave with the swap.
    pub async fn replace_endpoint(&self, endpoint: Arc<dyn MediaEndpoint>) -> u64 {
        let mut gate = self.gate.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.endpoint.write() = endpoint;
        gate.remote_applied = false;
        gate.pending.clear();
        generation
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Increment the retry counter before any timer is armed.
    pub fn bump_attempts(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn last_quality(&self) -> Option<(QualitySample, QualityGrade)> {
        *self.last_quality.read()
    }

    pub fn record_quality(&self, sample: QualitySample, grade: QualityGrade) {
        *self.last_quality.write() = Some((sample, grade));
    }

    /// Remember a remote track handle for the roster. Replaced when the
    /// same track id arrives again after a renegotiation.
    pub fn add_remote_track(&self, track: RemoteTrackInfo) {
        let mut tracks = self.remote_tracks.write();
        tracks.retain(|t| t.track_id != track.track_id);
        tracks.push(track);
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrackInfo> {
        self.remote_tracks.read().clone()
    }

    /// Whether a remote description has been applied to the current
    /// endpoint. False right after a rebuild.
    pub async fn has_remote_description(&self) -> bool {
        self.gate.lock().await.remote_applied
    }

    /// True while a scheduled retry timer has not fired yet. Suppresses
    /// duplicate scheduling when loss signals arrive back to back.
    pub fn has_pending_retry(&self) -> bool {
        self.retry_timer
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn store_retry_timer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.retry_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn clear_retry_timer(&self) {
        if let Some(handle) = self.retry_timer.lock().take() {
            handle.abort();
        }
    }

    pub fn store_sampler(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.sampler.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_sampler(&self) {
        if let Some(handle) = self.sampler.lock().take() {
            handle.abort();
        }
    }

    /// Take the gate for a negotiation step armed against `generation`.
    /// Returns the held gate and the endpoint it guards, or None when a
    /// rebuild superseded the step and it must be dropped on the floor.
    async fn open_gate(
        &self,
        generation: u64,
    ) -> Option<(
        tokio::sync::MutexGuard<'_, CandidateGate>,
        Arc<dyn MediaEndpoint>,
    )> {
        let gate = self.gate.lock().await;
        let current = self.current_generation();
        if current != generation {
            debug!(
                peer_id = %self.peer_id,
                armed = generation,
                current,
                "negotiation step outlived its endpoint, dropped"
            );
            return None;
        }
        Some((gate, self.endpoint()))
    }

    async fn apply_and_flush(
        &self,
        gate: &mut CandidateGate,
        endpoint: &Arc<dyn MediaEndpoint>,
        description: SessionDescription,
    ) -> Result<()> {
        endpoint.set_remote_description(description).await?;
        gate.remote_applied = true;
        gate.prune_stale(Instant::now());
        while let Some(entry) = gate.pending.pop_front() {
            if let Err(e) = endpoint.add_remote_candidate(entry.candidate).await {
                warn!(peer_id = %self.peer_id, error = %e, "buffered candidate rejected");
            }
        }
        Ok(())
    }

    /// Apply the peer's description and flush buffered candidates in
    /// receipt order. `generation` is the endpoint generation the caller
    /// was armed with; a description that outlived its endpoint is dropped
    /// without touching the replacement. Stale buffer entries are pruned,
    /// and a candidate the endpoint rejects is logged without aborting the
    /// flush.
    pub async fn apply_remote_description(
        &self,
        generation: u64,
        description: SessionDescription,
    ) -> Result<()> {
        let (mut gate, endpoint) = match self.open_gate(generation).await {
            Some(armed) => armed,
            None => return Ok(()),
        };
        self.apply_and_flush(&mut gate, &endpoint, description).await
    }

    /// Feed one relayed remote candidate through the gate: applied directly
    /// once a remote description exists, buffered with a receipt timestamp
    /// otherwise.
    pub async fn accept_candidate(&self, candidate: CandidateInit) -> Result<()> {
        let mut gate = self.gate.lock().await;
        gate.prune_stale(Instant::now());
        if gate.remote_applied {
            self.endpoint().add_remote_candidate(candidate).await
        } else {
            gate.pending.push_back(PendingCandidate {
                candidate,
                received_at: Instant::now(),
            });
            debug!(
                peer_id = %self.peer_id,
                buffered = gate.pending.len(),
                "candidate buffered ahead of remote description"
            );
            Ok(())
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidate_count(&self) -> usize {
        self.gate.lock().await.pending.len()
    }

    /// Initiator leg, first half: produce an offer on the armed endpoint,
    /// already applied as the local description. None when a rebuild
    /// superseded the leg.
    pub async fn start_offer(&self, generation: u64) -> Result<Option<SessionDescription>> {
        let (_gate, endpoint) = match self.open_gate(generation).await {
            Some(armed) => armed,
            None => return Ok(None),
        };
        let offer = endpoint.create_offer().await?;
        Ok(Some(offer))
    }

    /// Responder leg: apply the validated remote offer, flush candidates,
    /// and produce the locally applied answer. None when a rebuild
    /// superseded the leg.
    pub async fn answer_offer(
        &self,
        generation: u64,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        let (mut gate, endpoint) = match self.open_gate(generation).await {
            Some(armed) => armed,
            None => return Ok(None),
        };
        self.apply_and_flush(&mut gate, &endpoint, offer).await?;
        let answer = endpoint.create_answer().await?;
        Ok(Some(answer))
    }

    /// Tear the session down. Cancels pending timers and the sampler,
    /// transitions to Closed, and releases the endpoint. Safe to call more
    /// than once.
    pub async fn close(&self) {
        let previous = self.set_state(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }
        self.clear_retry_timer();
        self.stop_sampler();
        let mut gate = self.gate.lock().await;
        gate.pending.clear();
        drop(gate);
        if let Err(e) = self.endpoint().close().await {
            debug!(peer_id = %self.peer_id, error = %e, "endpoint close reported an error");
        }
    }
}

/// Strip optional codec parameters and bandwidth hints from an outbound
/// description. Best effort: if the rewrite does not shrink the payload the
/// original is sent unchanged.
pub fn minimize_sdp(sdp: &str) -> String {
    let reduced: String = sdp
        .split_inclusive('\n')
        .filter(|line| {
            let line = line.trim_start();
            !(line.starts_with("b=") || line.starts_with("a=fmtp:"))
        })
        .collect();
    if reduced.len() < sdp.len() {
        reduced
    } else {
        sdp.to_string()
    }
}

/// Minimized copy of a description for transmission. The locally applied
/// description is never altered.
pub fn minimize_description(description: &SessionDescription) -> SessionDescription {
    SessionDescription {
        kind: description.kind,
        sdp: minimize_sdp(&description.sdp),
    }
}
