//! Connection manager
//!
//! The [`ConnectionManager`] owns the session map and runs the event loop
//! that everything else feeds: inbound signaling messages, endpoint events,
//! retry timers, and public commands. All map writes and every session
//! state transition happen on that one task; spawned negotiation legs only
//! touch their session's candidate gate and record failures to the fault
//! log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::ConnectionConfig;
use crate::error::FailureKind;
use crate::events::{FaultLog, FaultRecord, SessionEvent};
use crate::health::{ServerHealthMonitor, StunProber};
use crate::peer::endpoint::{
    EndpointEvent, EndpointEventSender, EndpointFactory, EndpointReport, MediaSource,
    RemoteTrackInfo, TransportSignal,
};
use crate::peer::quality::{QualityGrade, QualityMonitor};
use crate::peer::rtc::RtcEndpointFactory;
use crate::peer::session::{
    minimize_description, ConnectionState, PeerSession, SessionRole,
};
use crate::security::{LocalTokenVerifier, SecurityValidator, TokenVerifier};
use crate::signaling::{SessionDescription, SignalMessage, SignalingTransport, WsSignaling};
use crate::{Error, Result};

const COMMAND_CAPACITY: usize = 64;
const ENDPOINT_EVENT_CAPACITY: usize = 256;
const SESSION_EVENT_CAPACITY: usize = 256;
/// Lifetime of a self-issued development token.
const SELF_ISSUED_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Aggregate view returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Channel currently joined, if any
    pub channel_id: Option<String>,
    /// Derived aggregate state across sessions
    pub state: ConnectionState,
    pub session_count: usize,
    /// Most recent quality grade seen across sessions
    pub quality: QualityGrade,
    pub muted: bool,
}

/// One roster row per live session.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub peer_id: String,
    pub role: SessionRole,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub quality: Option<QualityGrade>,
    pub tracks: Vec<RemoteTrackInfo>,
}

/// State readable outside the loop. The loop is the only writer of
/// `channel` and `sessions`; `muted` is owned by the mute API.
struct Shared {
    channel: RwLock<Option<String>>,
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    muted: AtomicBool,
}

enum Command {
    Join {
        channel_id: String,
        done: oneshot::Sender<()>,
    },
    Leave {
        done: oneshot::Sender<()>,
    },
    ForceReconnect {
        peer_id: String,
        done: oneshot::Sender<Result<()>>,
    },
    RetryDue {
        peer_id: String,
        attempt: u32,
        /// Endpoint generation when the timer was armed; a mismatch means
        /// another path already rebuilt the endpoint
        generation: u64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

pub struct ConnectionManager {
    local_peer_id: String,
    commands: mpsc::Sender<Command>,
    signaling: Arc<dyn SignalingTransport>,
    shared: Arc<Shared>,
    capture: Arc<dyn MediaSource>,
    faults: FaultLog,
    events: mpsc::Sender<SessionEvent>,
    monitor: Option<Arc<ServerHealthMonitor>>,
    local_track: Option<Arc<TrackLocalStaticSample>>,
}

impl ConnectionManager {
    /// Connect the full stack: WebSocket signaling, WebRTC endpoints, server
    /// health monitoring, and local token verification, all from `config`.
    pub async fn connect(
        config: ConnectionConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;

        let (signaling, inbound) = WsSignaling::connect(&config.signaling_url).await?;

        let prober = StunProber::new(Duration::from_millis(config.options.probe_timeout_ms));
        let monitor = Arc::new(ServerHealthMonitor::new(&config, Arc::new(prober)));
        monitor.start();

        let factory = Arc::new(RtcEndpointFactory::new(&config).with_monitor(monitor.clone()));
        let capture = factory.capture();
        let local_track = factory.local_track();
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(LocalTokenVerifier::new(config.token_secret.clone()));

        Self::with_transport(
            config,
            signaling,
            inbound,
            factory,
            capture,
            verifier,
            Some(monitor),
            Some(local_track),
        )
    }

    /// Assemble a manager from explicit collaborators. `connect` wires the
    /// production stack through here; tests substitute in-memory transports
    /// and scripted endpoints.
    #[allow(clippy::too_many_arguments)]
    pub fn with_transport(
        config: ConnectionConfig,
        signaling: Arc<dyn SignalingTransport>,
        inbound: mpsc::Receiver<SignalMessage>,
        factory: Arc<dyn EndpointFactory>,
        capture: Arc<dyn MediaSource>,
        verifier: Arc<dyn TokenVerifier>,
        monitor: Option<Arc<ServerHealthMonitor>>,
        local_track: Option<Arc<TrackLocalStaticSample>>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;

        let local_peer_id = config
            .local_peer_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let faults = FaultLog::new(events_tx.clone());

        let session_token = match &config.session_token {
            Some(token) => token.clone(),
            None => LocalTokenVerifier::new(config.token_secret.clone())
                .generate(
                    &local_peer_id,
                    &config.local_origin,
                    SELF_ISSUED_TOKEN_TTL_SECS,
                )
                .map_err(|e| {
                    Error::InvalidConfig(format!("cannot self-issue session token: {}", e))
                })?,
        };

        let validator = SecurityValidator::new(&config, verifier, faults.clone());

        let shared = Arc::new(Shared {
            channel: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            muted: AtomicBool::new(false),
        });

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (endpoint_tx, endpoint_rx) = mpsc::channel(ENDPOINT_EVENT_CAPACITY);

        let core = ManagerCore {
            local_peer_id: local_peer_id.clone(),
            local_origin: config.local_origin.clone(),
            session_token,
            trim_descriptions: config.options.trim_descriptions,
            quality_interval: Duration::from_millis(config.options.quality_interval_ms),
            signaling: signaling.clone(),
            factory,
            validator,
            shared: shared.clone(),
            faults: faults.clone(),
            events: events_tx.clone(),
            endpoint_tx,
            commands_tx: commands_tx.clone(),
        };
        tokio::spawn(core.run(commands_rx, endpoint_rx, inbound));

        info!(peer_id = %local_peer_id, "connection manager started");

        let manager = Arc::new(Self {
            local_peer_id,
            commands: commands_tx,
            signaling,
            shared,
            capture,
            faults,
            events: events_tx,
            monitor,
            local_track,
        });
        Ok((manager, events_rx))
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Join a voice channel. The only synchronous failure is an unavailable
    /// signaling transport; everything after the announcement surfaces
    /// through the event stream.
    pub async fn join_channel(&self, channel_id: &str) -> Result<()> {
        if !self.signaling.is_connected() {
            return Err(Error::SignalingUnavailable(
                "signaling transport is not connected".to_string(),
            ));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.send_command(Command::Join {
            channel_id: channel_id.to_string(),
            done: done_tx,
        })
        .await?;
        done_rx
            .await
            .map_err(|_| Error::InternalError("connection manager stopped".to_string()))
    }

    /// Leave the current channel, closing every session. No-op when not
    /// joined.
    pub async fn leave_channel(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_command(Command::Leave { done: done_tx }).await?;
        done_rx
            .await
            .map_err(|_| Error::InternalError("connection manager stopped".to_string()))
    }

    /// Restart a Failed (or stuck) session: resets its attempt counter,
    /// rebuilds the transport, and re-runs negotiation.
    pub async fn force_reconnect(&self, peer_id: &str) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_command(Command::ForceReconnect {
            peer_id: peer_id.to_string(),
            done: done_tx,
        })
        .await?;
        done_rx
            .await
            .map_err(|_| Error::InternalError("connection manager stopped".to_string()))?
    }

    pub fn mute(&self) {
        self.set_muted(true);
    }

    pub fn unmute(&self) {
        self.set_muted(false);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    /// Toggle the local capture source. Negotiation and session state are
    /// untouched.
    fn set_muted(&self, muted: bool) {
        let was = self.shared.muted.swap(muted, Ordering::SeqCst);
        self.capture.set_enabled(!muted);
        if was != muted {
            debug!(muted, "mute changed");
            if self
                .events
                .try_send(SessionEvent::MuteChanged { muted })
                .is_err()
            {
                debug!("event channel full, dropping mute event");
            }
        }
    }

    /// Aggregate connection status. Pure read.
    pub fn status(&self) -> ConnectionStatus {
        let channel_id = self.shared.channel.read().clone();
        let sessions = self.shared.sessions.read();

        let mut any_connected = false;
        let mut any_connecting = false;
        let mut any_failed = false;
        let mut latest: Option<(DateTime<Utc>, QualityGrade)> = None;
        for session in sessions.values() {
            match session.state() {
                ConnectionState::Connected => any_connected = true,
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    any_connecting = true
                }
                ConnectionState::Failed => any_failed = true,
                _ => {}
            }
            if let Some((sample, grade)) = session.last_quality() {
                if latest.map(|(at, _)| sample.at > at).unwrap_or(true) {
                    latest = Some((sample.at, grade));
                }
            }
        }

        let state = if channel_id.is_none() {
            ConnectionState::Disconnected
        } else if any_connected {
            ConnectionState::Connected
        } else if any_connecting || sessions.is_empty() {
            ConnectionState::Connecting
        } else if any_failed {
            ConnectionState::Failed
        } else {
            ConnectionState::Disconnected
        };

        ConnectionStatus {
            channel_id,
            state,
            session_count: sessions.len(),
            quality: latest.map(|(_, grade)| grade).unwrap_or(QualityGrade::Unknown),
            muted: self.shared.muted.load(Ordering::SeqCst),
        }
    }

    /// Per-peer summaries, sorted by peer id.
    pub fn roster(&self) -> Vec<PeerSummary> {
        let mut rows: Vec<PeerSummary> = self
            .shared
            .sessions
            .read()
            .values()
            .map(|session| PeerSummary {
                peer_id: session.peer_id().to_string(),
                role: session.role(),
                state: session.state(),
                reconnect_attempts: session.reconnect_attempts(),
                quality: session.last_quality().map(|(_, grade)| grade),
                tracks: session.remote_tracks(),
            })
            .collect();
        rows.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        rows
    }

    /// Snapshot of the bounded fault log, oldest first.
    pub fn recent_errors(&self) -> Vec<FaultRecord> {
        self.faults.recent()
    }

    pub fn health_monitor(&self) -> Option<Arc<ServerHealthMonitor>> {
        self.monitor.clone()
    }

    /// Outbound audio track for the capture pump, when this manager was
    /// built over real WebRTC endpoints.
    pub fn local_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_track.clone()
    }

    /// Leave, close every session, and stop the loop and health monitor.
    pub async fn shutdown(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .send_command(Command::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        info!(peer_id = %self.local_peer_id, "connection manager stopped");
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::InternalError("connection manager stopped".to_string()))
    }
}

/// Loop-owned half of the manager.
struct ManagerCore {
    local_peer_id: String,
    local_origin: String,
    session_token: String,
    trim_descriptions: bool,
    quality_interval: Duration,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn EndpointFactory>,
    validator: SecurityValidator,
    shared: Arc<Shared>,
    faults: FaultLog,
    events: mpsc::Sender<SessionEvent>,
    endpoint_tx: mpsc::Sender<EndpointReport>,
    commands_tx: mpsc::Sender<Command>,
}

impl ManagerCore {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut endpoints: mpsc::Receiver<EndpointReport>,
        mut inbound: mpsc::Receiver<SignalMessage>,
    ) {
        let mut signaling_open = true;
        loop {
            tokio::select! {
                maybe = commands.recv() => match maybe {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    // every handle dropped
                    None => break,
                },
                Some(report) = endpoints.recv() => {
                    self.handle_endpoint_report(report).await;
                }
                maybe = inbound.recv(), if signaling_open => match maybe {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        signaling_open = false;
                        warn!("signaling channel closed");
                        self.faults.record(
                            FailureKind::TransportUnavailable,
                            None,
                            "signaling channel closed",
                        );
                    }
                },
            }
        }
        self.teardown_all().await;
    }

    /// Returns true when the loop should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { channel_id, done } => {
                self.handle_join(channel_id).await;
                let _ = done.send(());
                false
            }
            Command::Leave { done } => {
                self.handle_leave().await;
                let _ = done.send(());
                false
            }
            Command::ForceReconnect { peer_id, done } => {
                let result = self.handle_force_reconnect(&peer_id).await;
                let _ = done.send(result);
                false
            }
            Command::RetryDue {
                peer_id,
                attempt,
                generation,
            } => {
                self.handle_retry_due(&peer_id, attempt, generation).await;
                false
            }
            Command::Shutdown { done } => {
                self.handle_leave().await;
                let _ = done.send(());
                true
            }
        }
    }

    async fn handle_join(&mut self, channel_id: String) {
        let current = self.shared.channel.read().clone();
        if current.as_deref() == Some(channel_id.as_str()) {
            debug!(channel_id = %channel_id, "already joined");
            return;
        }
        // switching channels tears the old one down first
        if let Some(previous) = current {
            self.announce_leave(&previous).await;
            self.teardown_all().await;
            self.emit(SessionEvent::ChannelLeft {
                channel_id: previous,
            });
        }

        let message = SignalMessage::JoinChannel {
            channel_id: channel_id.clone(),
            user_id: self.local_peer_id.clone(),
        };
        if let Err(e) = self.signaling.send(message).await {
            self.faults.record(
                FailureKind::TransportUnavailable,
                None,
                format!("join announcement failed: {}", e),
            );
            return;
        }

        *self.shared.channel.write() = Some(channel_id.clone());
        info!(channel_id = %channel_id, "joined channel");
        self.emit(SessionEvent::ChannelJoined { channel_id });
    }

    async fn handle_leave(&mut self) {
        let Some(channel_id) = self.shared.channel.write().take() else {
            return;
        };
        self.announce_leave(&channel_id).await;
        self.teardown_all().await;
        info!(channel_id = %channel_id, "left channel");
        self.emit(SessionEvent::ChannelLeft { channel_id });
    }

    async fn announce_leave(&self, channel_id: &str) {
        if !self.signaling.is_connected() {
            return;
        }
        let message = SignalMessage::LeaveChannel {
            channel_id: channel_id.to_string(),
            user_id: self.local_peer_id.clone(),
        };
        if let Err(e) = self.signaling.send(message).await {
            self.faults.record(
                FailureKind::TransportUnavailable,
                None,
                format!("leave announcement failed: {}", e),
            );
        }
    }

    async fn teardown_all(&mut self) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut map = self.shared.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close().await;
            self.emit(SessionEvent::PeerStateChanged {
                peer_id: session.peer_id().to_string(),
                state: ConnectionState::Closed,
            });
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::PeerJoined {
                peer_id,
                channel_id,
            } => {
                self.handle_peer_joined(&peer_id, &channel_id).await;
            }
            SignalMessage::PeerLeft { peer_id } => {
                self.handle_peer_left(&peer_id).await;
            }
            SignalMessage::Offer {
                target_peer_id,
                from_peer_id,
                offer,
                origin,
                token,
            } => {
                if target_peer_id != self.local_peer_id {
                    debug!(target = %target_peer_id, "offer misrouted by relay");
                    return;
                }
                self.handle_offer(from_peer_id, offer, origin, token).await;
            }
            SignalMessage::Answer {
                target_peer_id,
                from_peer_id,
                answer,
            } => {
                if target_peer_id != self.local_peer_id {
                    debug!(target = %target_peer_id, "answer misrouted by relay");
                    return;
                }
                self.handle_answer(&from_peer_id, answer).await;
            }
            SignalMessage::IceCandidate {
                target_peer_id,
                from_peer_id,
                candidate,
            } => {
                if target_peer_id != self.local_peer_id {
                    debug!(target = %target_peer_id, "candidate misrouted by relay");
                    return;
                }
                self.handle_candidate(&from_peer_id, candidate).await;
            }
            SignalMessage::JoinChannel { .. } | SignalMessage::LeaveChannel { .. } => {
                debug!(kind = message.kind_name(), "ignoring client-bound message");
            }
        }
    }

    async fn handle_peer_joined(&mut self, peer_id: &str, channel_id: &str) {
        let joined = self.shared.channel.read().clone();
        if joined.as_deref() != Some(channel_id) {
            debug!(peer_id, channel_id, "peer-joined for a channel we are not in");
            return;
        }
        if peer_id == self.local_peer_id {
            return;
        }
        if self.shared.sessions.read().contains_key(peer_id) {
            debug!(peer_id, "duplicate peer-joined, session already exists");
            return;
        }

        let role = SessionRole::assign(&self.local_peer_id, peer_id);
        info!(peer_id, role = %role, "peer joined channel");
        let Some(session) = self.create_session(peer_id, role).await else {
            return;
        };
        if role == SessionRole::Initiator {
            self.spawn_offer_leg(&session);
        }
    }

    async fn handle_peer_left(&mut self, peer_id: &str) {
        let removed = self.shared.sessions.write().remove(peer_id);
        let Some(session) = removed else {
            debug!(peer_id, "peer-left for unknown peer");
            return;
        };
        info!(peer_id, "peer left channel");
        session.close().await;
        self.emit(SessionEvent::PeerStateChanged {
            peer_id: peer_id.to_string(),
            state: ConnectionState::Closed,
        });
    }

    async fn handle_offer(
        &mut self,
        from_peer_id: String,
        offer: SessionDescription,
        origin: String,
        token: String,
    ) {
        // every inbound offer is authorized, known peer or not
        if !self
            .validator
            .authorize_offer(&from_peer_id, &origin, &token)
            .await
        {
            return;
        }

        let existing = self.shared.sessions.read().get(&from_peer_id).cloned();
        match existing {
            None => {
                if self.shared.channel.read().is_none() {
                    debug!(peer_id = %from_peer_id, "offer while not in a channel");
                    return;
                }
                info!(peer_id = %from_peer_id, "validated offer from new peer");
                let Some(session) = self
                    .create_session(&from_peer_id, SessionRole::Responder)
                    .await
                else {
                    return;
                };
                self.spawn_answer_leg(&session, offer);
            }
            Some(session) => {
                if session.role() == SessionRole::Initiator {
                    self.faults.record(
                        FailureKind::NegotiationFailure,
                        Some(&from_peer_id),
                        "offer received on the initiating side of the pair",
                    );
                    return;
                }
                match session.state() {
                    ConnectionState::Connecting | ConnectionState::Connected => {
                        // renegotiation on the live endpoint
                        self.spawn_answer_leg(&session, offer);
                    }
                    ConnectionState::Reconnecting
                    | ConnectionState::Failed
                    | ConnectionState::Disconnected => {
                        // the peer restarted negotiation; make sure we answer
                        // on an endpoint with no stale remote state
                        session.clear_retry_timer();
                        if session.has_remote_description().await
                            && !self.rebuild_endpoint(&session).await
                        {
                            return;
                        }
                        let previous = session.set_state(ConnectionState::Connecting);
                        if previous != ConnectionState::Connecting {
                            self.emit(SessionEvent::PeerStateChanged {
                                peer_id: from_peer_id.clone(),
                                state: ConnectionState::Connecting,
                            });
                        }
                        self.spawn_answer_leg(&session, offer);
                    }
                    ConnectionState::Closed => {
                        debug!(peer_id = %from_peer_id, "offer for closed session");
                    }
                }
            }
        }
    }

    async fn handle_answer(&mut self, peer_id: &str, answer: SessionDescription) {
        let session = self.shared.sessions.read().get(peer_id).cloned();
        let Some(session) = session else {
            debug!(peer_id, "answer for unknown peer, likely torn down");
            return;
        };
        if session.role() != SessionRole::Initiator {
            self.faults.record(
                FailureKind::NegotiationFailure,
                Some(peer_id),
                "answer received on the responding side of the pair",
            );
            return;
        }
        self.spawn_answer_apply(&session, answer);
    }

    async fn handle_candidate(&mut self, peer_id: &str, candidate: crate::signaling::CandidateInit) {
        let session = self.shared.sessions.read().get(peer_id).cloned();
        let Some(session) = session else {
            debug!(peer_id, "candidate for unknown peer");
            return;
        };
        // applied inline so receipt order is preserved across peers
        if let Err(e) = session.accept_candidate(candidate).await {
            self.faults.record(
                FailureKind::NegotiationFailure,
                Some(peer_id),
                format!("candidate rejected: {}", e),
            );
        }
    }

    async fn handle_endpoint_report(&mut self, report: EndpointReport) {
        let session = self.shared.sessions.read().get(&report.peer_id).cloned();
        let Some(session) = session else {
            debug!(peer_id = %report.peer_id, "endpoint event for removed session");
            return;
        };
        if report.generation != session.current_generation() {
            debug!(
                peer_id = %report.peer_id,
                generation = report.generation,
                "endpoint event from a replaced endpoint"
            );
            return;
        }

        match report.event {
            EndpointEvent::Transport(signal) => {
                self.handle_transport_signal(&session, signal).await;
            }
            EndpointEvent::Candidate(candidate) => {
                // candidate exchange is continuous and independent of the
                // offer/answer leg
                let message = SignalMessage::IceCandidate {
                    target_peer_id: report.peer_id.clone(),
                    from_peer_id: self.local_peer_id.clone(),
                    candidate,
                };
                if let Err(e) = self.signaling.send(message).await {
                    self.faults.record(
                        FailureKind::TransportUnavailable,
                        Some(&report.peer_id),
                        format!("candidate relay failed: {}", e),
                    );
                }
            }
            EndpointEvent::RemoteTrack(track) => {
                session.add_remote_track(track.clone());
                self.emit(SessionEvent::RemoteTrack {
                    peer_id: report.peer_id,
                    track,
                });
            }
        }
    }

    async fn handle_transport_signal(&mut self, session: &Arc<PeerSession>, signal: TransportSignal) {
        match signal {
            TransportSignal::Connected => {
                let previous = session.set_state(ConnectionState::Connected);
                if previous == ConnectionState::Connected {
                    return;
                }
                session.reset_attempts();
                session.clear_retry_timer();
                self.start_sampler(session);
                info!(peer_id = session.peer_id(), "session connected");
                self.emit(SessionEvent::PeerStateChanged {
                    peer_id: session.peer_id().to_string(),
                    state: ConnectionState::Connected,
                });
            }
            TransportSignal::Disconnected => {
                // transient loss only matters from Connected
                if session.state() != ConnectionState::Connected {
                    debug!(
                        peer_id = session.peer_id(),
                        "transport disconnect outside Connected, ignoring"
                    );
                    return;
                }
                self.faults.record(
                    FailureKind::TransportFailure,
                    Some(session.peer_id()),
                    "transport disconnected",
                );
                self.schedule_retry(session).await;
            }
            TransportSignal::Failed => {
                if !session.state().is_recoverable() {
                    debug!(
                        peer_id = session.peer_id(),
                        state = %session.state(),
                        "transport failure in non-recoverable state"
                    );
                    return;
                }
                self.faults.record(
                    FailureKind::TransportFailure,
                    Some(session.peer_id()),
                    "transport failed",
                );
                self.schedule_retry(session).await;
            }
        }
    }

    /// Count a loss against the schedule and either arm the next retry
    /// timer or give up. The counter moves before the timer is armed.
    async fn schedule_retry(&mut self, session: &Arc<PeerSession>) {
        session.stop_sampler();

        if session.has_pending_retry() {
            session.set_state(ConnectionState::Reconnecting);
            debug!(peer_id = session.peer_id(), "retry already scheduled");
            return;
        }

        let attempt = session.bump_attempts();
        if session.policy().is_exhausted(attempt) {
            session.clear_retry_timer();
            let previous = session.set_state(ConnectionState::Failed);
            if previous != ConnectionState::Failed {
                self.faults.record(
                    FailureKind::ExhaustedRetries,
                    Some(session.peer_id()),
                    format!("gave up after {} reconnect attempts", attempt - 1),
                );
                self.emit(SessionEvent::PeerStateChanged {
                    peer_id: session.peer_id().to_string(),
                    state: ConnectionState::Failed,
                });
            }
            if let Err(e) = session.endpoint().close().await {
                debug!(peer_id = session.peer_id(), error = %e, "endpoint close after giving up");
            }
            return;
        }

        let previous = session.set_state(ConnectionState::Reconnecting);
        if previous != ConnectionState::Reconnecting {
            self.emit(SessionEvent::PeerStateChanged {
                peer_id: session.peer_id().to_string(),
                state: ConnectionState::Reconnecting,
            });
        }

        let delay = session.policy().delay_for(attempt);
        info!(
            peer_id = session.peer_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        let commands = self.commands_tx.clone();
        let peer_id = session.peer_id().to_string();
        let generation = session.current_generation();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands
                .send(Command::RetryDue {
                    peer_id,
                    attempt,
                    generation,
                })
                .await;
        });
        session.store_retry_timer(handle);
    }

    async fn handle_retry_due(&mut self, peer_id: &str, attempt: u32, generation: u64) {
        let session = self.shared.sessions.read().get(peer_id).cloned();
        let Some(session) = session else {
            debug!(peer_id, "retry due for removed session");
            return;
        };
        if session.state() != ConnectionState::Reconnecting {
            debug!(peer_id, state = %session.state(), "retry superseded by state change");
            return;
        }
        if session.reconnect_attempts() != attempt
            || session.current_generation() != generation
        {
            debug!(peer_id, attempt, "stale retry timer");
            return;
        }

        session.clear_retry_timer();
        if !self.rebuild_endpoint(&session).await {
            // burn the next slot in the schedule
            self.schedule_retry(&session).await;
            return;
        }

        info!(peer_id, attempt, "reconnect attempt underway");
        if session.role() == SessionRole::Initiator {
            self.spawn_offer_leg(&session);
        }
        // a Responder waits for the initiator to re-offer on the fresh
        // endpoint
    }

    async fn handle_force_reconnect(&mut self, peer_id: &str) -> Result<()> {
        let session = self.shared.sessions.read().get(peer_id).cloned();
        let Some(session) = session else {
            return Err(Error::SessionNotFound(peer_id.to_string()));
        };

        info!(peer_id, "forcing reconnection");
        session.clear_retry_timer();
        session.stop_sampler();
        session.reset_attempts();

        let previous = session.set_state(ConnectionState::Reconnecting);
        if previous != ConnectionState::Reconnecting {
            self.emit(SessionEvent::PeerStateChanged {
                peer_id: peer_id.to_string(),
                state: ConnectionState::Reconnecting,
            });
        }

        if !self.rebuild_endpoint(&session).await {
            self.schedule_retry(&session).await;
            return Ok(());
        }
        if session.role() == SessionRole::Initiator {
            self.spawn_offer_leg(&session);
        }
        Ok(())
    }

    async fn create_session(
        &mut self,
        peer_id: &str,
        role: SessionRole,
    ) -> Option<Arc<PeerSession>> {
        const FIRST_GENERATION: u64 = 1;
        let sender = EndpointEventSender::new(peer_id, FIRST_GENERATION, self.endpoint_tx.clone());
        let endpoint = match self.factory.create(peer_id, sender).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.faults.record(
                    FailureKind::NegotiationFailure,
                    Some(peer_id),
                    format!("endpoint setup failed: {}", e),
                );
                return None;
            }
        };

        let session = Arc::new(PeerSession::new(peer_id, role, endpoint, FIRST_GENERATION));
        session.set_state(ConnectionState::Connecting);
        self.shared
            .sessions
            .write()
            .insert(peer_id.to_string(), session.clone());
        self.emit(SessionEvent::PeerStateChanged {
            peer_id: peer_id.to_string(),
            state: ConnectionState::Connecting,
        });
        Some(session)
    }

    /// Swap in a freshly built endpoint for a retry round. Returns false
    /// and records a fault when the factory cannot deliver one.
    async fn rebuild_endpoint(&mut self, session: &Arc<PeerSession>) -> bool {
        let next_generation = session.current_generation() + 1;
        let sender =
            EndpointEventSender::new(session.peer_id(), next_generation, self.endpoint_tx.clone());
        match self.factory.create(session.peer_id(), sender).await {
            Ok(endpoint) => {
                let old = session.endpoint();
                let generation = session.replace_endpoint(endpoint).await;
                debug!(
                    peer_id = session.peer_id(),
                    generation, "endpoint rebuilt"
                );
                if let Err(e) = old.close().await {
                    debug!(peer_id = session.peer_id(), error = %e, "old endpoint close");
                }
                true
            }
            Err(e) => {
                self.faults.record(
                    FailureKind::NegotiationFailure,
                    Some(session.peer_id()),
                    format!("endpoint rebuild failed: {}", e),
                );
                false
            }
        }
    }

    /// Initiator leg: offer, minimize, relay. Runs off-loop; failures are
    /// recorded unless the session was torn down or replaced underneath it.
    fn spawn_offer_leg(&self, session: &Arc<PeerSession>) {
        let session = session.clone();
        let signaling = self.signaling.clone();
        let faults = self.faults.clone();
        let local_peer_id = self.local_peer_id.clone();
        let origin = self.local_origin.clone();
        let token = self.session_token.clone();
        let trim = self.trim_descriptions;
        let generation = session.current_generation();
        tokio::spawn(async move {
            let outcome: Result<()> = async {
                let offer = match session.start_offer(generation).await? {
                    Some(offer) => offer,
                    None => return Ok(()),
                };
                let payload = if trim {
                    minimize_description(&offer)
                } else {
                    offer
                };
                signaling
                    .send(SignalMessage::Offer {
                        target_peer_id: session.peer_id().to_string(),
                        from_peer_id: local_peer_id,
                        offer: payload,
                        origin,
                        token,
                    })
                    .await
            }
            .await;
            if let Err(e) = outcome {
                if session.state() != ConnectionState::Closed
                    && session.current_generation() == generation
                {
                    faults.record(
                        FailureKind::NegotiationFailure,
                        Some(session.peer_id()),
                        format!("offer leg failed: {}", e),
                    );
                }
            }
        });
    }

    /// Responder leg: apply the validated offer, flush candidates, answer.
    fn spawn_answer_leg(&self, session: &Arc<PeerSession>, offer: SessionDescription) {
        let session = session.clone();
        let signaling = self.signaling.clone();
        let faults = self.faults.clone();
        let local_peer_id = self.local_peer_id.clone();
        let trim = self.trim_descriptions;
        let generation = session.current_generation();
        tokio::spawn(async move {
            let outcome: Result<()> = async {
                let answer = match session.answer_offer(generation, offer).await? {
                    Some(answer) => answer,
                    None => return Ok(()),
                };
                let payload = if trim {
                    minimize_description(&answer)
                } else {
                    answer
                };
                signaling
                    .send(SignalMessage::Answer {
                        target_peer_id: session.peer_id().to_string(),
                        from_peer_id: local_peer_id,
                        answer: payload,
                    })
                    .await
            }
            .await;
            if let Err(e) = outcome {
                if session.state() != ConnectionState::Closed
                    && session.current_generation() == generation
                {
                    faults.record(
                        FailureKind::NegotiationFailure,
                        Some(session.peer_id()),
                        format!("answer leg failed: {}", e),
                    );
                }
            }
        });
    }

    /// Initiator leg completion: apply the matching answer and flush.
    fn spawn_answer_apply(&self, session: &Arc<PeerSession>, answer: SessionDescription) {
        let session = session.clone();
        let faults = self.faults.clone();
        let generation = session.current_generation();
        tokio::spawn(async move {
            if let Err(e) = session.apply_remote_description(generation, answer).await {
                if session.state() != ConnectionState::Closed
                    && session.current_generation() == generation
                {
                    faults.record(
                        FailureKind::NegotiationFailure,
                        Some(session.peer_id()),
                        format!("answer apply failed: {}", e),
                    );
                }
            }
        });
    }

    /// Quality sampling while Connected. The task dies with the session or
    /// on the next exit from Connected.
    fn start_sampler(&self, session: &Arc<PeerSession>) {
        let session_task = session.clone();
        let endpoint = session.endpoint();
        let events = self.events.clone();
        let interval = self.quality_interval;
        let handle = tokio::spawn(async move {
            let mut monitor = QualityMonitor::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match endpoint.stats().await {
                    Ok(stats) => {
                        if let Some((sample, grade)) = monitor.observe(stats) {
                            session_task.record_quality(sample, grade);
                            let _ = events.try_send(SessionEvent::Quality {
                                peer_id: session_task.peer_id().to_string(),
                                grade,
                                sample,
                            });
                        }
                    }
                    Err(e) => {
                        debug!(
                            peer_id = session_task.peer_id(),
                            error = %e,
                            "stats pull failed"
                        );
                    }
                }
            }
        });
        session.store_sampler(handle);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            debug!("event channel full or closed, dropping event");
        }
    }
}
