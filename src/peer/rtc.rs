//! WebRTC endpoint implementation
//!
//! Wraps one `RTCPeerConnection` per remote peer behind the
//! [`MediaEndpoint`] seam. The factory owns the shared local audio track and
//! consults the server health monitor, when one is attached, to order ICE
//! servers by measured latency before falling back to the configured
//! defaults.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::ConnectionConfig;
use crate::health::{ServerCategory, ServerHealthMonitor};
use crate::peer::endpoint::{
    CaptureHandle, EndpointEvent, EndpointEventSender, EndpointFactory, MediaEndpoint,
    RemoteTrackInfo, TransportSignal, TransportStats,
};
use crate::signaling::{CandidateInit, DescriptionKind, SessionDescription};
use crate::{Error, Result};

/// One WebRTC peer connection bound to a single session generation.
pub struct RtcEndpoint {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl RtcEndpoint {
    fn new(peer_id: &str, peer_connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            peer_connection,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MediaEndpoint for RtcEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::SdpError("No local description after applying offer".to_string())
            })?;

        debug!(peer_id = %self.peer_id, "created offer");

        Ok(SessionDescription::offer(local_desc.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp)
                .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?,
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp)
                .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?,
        };

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::SdpError("No local description after applying answer".to_string())
            })?;

        debug!(peer_id = %self.peer_id, "created answer");

        Ok(SessionDescription::answer(local_desc.sdp))
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<()> {
        // end-of-candidates marker, nothing to apply
        if candidate.candidate.is_empty() {
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.peer_connection.get_stats().await;

        let mut stats = TransportStats::default();
        for entry in report.reports.values() {
            match entry {
                StatsReportType::Transport(transport) => {
                    stats.bytes_sent = stats.bytes_sent.saturating_add(transport.bytes_sent as u64);
                    stats.bytes_received = stats
                        .bytes_received
                        .saturating_add(transport.bytes_received as u64);
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    stats.packets_sent = pair.packets_sent as u64;
                    stats.packets_received = pair.packets_received as u64;
                    if pair.current_round_trip_time > 0.0 {
                        stats.rtt = Some(Duration::from_secs_f64(pair.current_round_trip_time));
                    }
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(peer_id = %self.peer_id, "closing peer connection");

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))?;

        Ok(())
    }
}

/// Builds [`RtcEndpoint`]s and owns media state shared across them: the
/// outbound audio track every connection sends from, and the capture flag
/// that mute toggles.
pub struct RtcEndpointFactory {
    stun_servers: Vec<String>,
    turn_servers: Vec<crate::config::TurnServerConfig>,
    monitor: Option<Arc<ServerHealthMonitor>>,
    audio_track: Arc<TrackLocalStaticSample>,
    capture: Arc<CaptureHandle>,
}

impl RtcEndpointFactory {
    pub fn new(config: &ConnectionConfig) -> Self {
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            format!("voicemesh-{}", uuid::Uuid::new_v4()),
        ));

        Self {
            stun_servers: config.stun_servers.clone(),
            turn_servers: config.turn_servers.clone(),
            monitor: None,
            audio_track,
            capture: Arc::new(CaptureHandle::new()),
        }
    }

    /// Attach a health monitor so new connections prefer the best measured
    /// servers over the configured order.
    pub fn with_monitor(mut self, monitor: Arc<ServerHealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Shared outbound audio track. The capture pump writes encoded samples
    /// here; every peer connection sends from it.
    pub fn local_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio_track.clone()
    }

    pub fn capture(&self) -> Arc<CaptureHandle> {
        self.capture.clone()
    }

    /// ICE server list for a new connection: health-preferred servers first
    /// when the monitor has probe results, then the configured defaults.
    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = Vec::new();

        if let Some(monitor) = &self.monitor {
            if let Some(record) = monitor.best_server(ServerCategory::Relay) {
                servers.push(RTCIceServer {
                    urls: vec![record.url.clone()],
                    username: record.username.clone().unwrap_or_default(),
                    credential: record.credential.clone().unwrap_or_default(),
                    ..Default::default()
                });
            }
            if let Some(record) = monitor.best_server(ServerCategory::Reflexive) {
                servers.push(RTCIceServer {
                    urls: vec![record.url.clone()],
                    ..Default::default()
                });
            }
        }

        for url in &self.stun_servers {
            if servers.iter().any(|s| s.urls.contains(url)) {
                continue;
            }
            servers.push(RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            if servers.iter().any(|s| s.urls.contains(&turn.url)) {
                continue;
            }
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        servers
    }
}

#[async_trait]
impl EndpointFactory for RtcEndpointFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: EndpointEventSender,
    ) -> Result<Arc<dyn MediaEndpoint>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| {
                Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        info!(
            peer_id = %peer_id,
            generation = events.generation(),
            "created peer connection"
        );

        peer_connection
            .add_track(self.audio_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::PeerConnectionError(format!("Failed to add audio track: {}", e))
            })?;

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    let signal = match state {
                        RTCPeerConnectionState::Connected => TransportSignal::Connected,
                        RTCPeerConnectionState::Disconnected => TransportSignal::Disconnected,
                        RTCPeerConnectionState::Failed => TransportSignal::Failed,
                        // Closed follows our own teardown, nothing to report
                        _ => return,
                    };
                    debug!(
                        peer_id = events.peer_id(),
                        state = %state,
                        "transport state change"
                    );
                    events.emit(EndpointEvent::Transport(signal));
                })
            },
        ));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => events.emit(EndpointEvent::Candidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(e) => {
                            warn!(
                                peer_id = events.peer_id(),
                                error = %e,
                                "failed to serialize local candidate"
                            );
                        }
                    },
                    // gathering finished, relay the end-of-candidates marker
                    None => events.emit(EndpointEvent::Candidate(CandidateInit {
                        candidate: String::new(),
                        sdp_mid: None,
                        sdp_mline_index: None,
                    })),
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let info = RemoteTrackInfo {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind: track.kind().to_string(),
                };
                info!(
                    peer_id = events.peer_id(),
                    track_id = %info.track_id,
                    kind = %info.kind,
                    "remote track arrived"
                );
                events.emit(EndpointEvent::RemoteTrack(info));
            })
        }));

        Ok(Arc::new(RtcEndpoint::new(peer_id, peer_connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;
    use crate::peer::endpoint::MediaSource;

    fn factory() -> RtcEndpointFactory {
        let config = ConnectionConfig {
            stun_servers: vec!["stun:stun.example.com:3478".to_string()],
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "pass".to_string(),
            }],
            ..Default::default()
        };
        RtcEndpointFactory::new(&config)
    }

    #[test]
    fn test_ice_servers_from_static_config() {
        let servers = factory().ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com:3478"]);
        assert_eq!(servers[1].username, "user");
    }

    #[test]
    fn test_capture_handle_is_shared() {
        let factory = factory();
        let a = factory.capture();
        let b = factory.capture();
        a.set_enabled(false);
        assert!(!b.is_enabled());
    }

    #[tokio::test]
    async fn test_create_endpoint_and_offer() {
        let factory = factory();
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let events = EndpointEventSender::new("peer-b", 1, tx);

        let endpoint = factory.create("peer-b", events).await.expect("endpoint");
        let offer = endpoint.create_offer().await.expect("offer");
        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert!(offer.sdp.contains("v=0"));

        endpoint.close().await.expect("close");
        // second close is a no-op
        endpoint.close().await.expect("close again");
    }

    #[tokio::test]
    async fn test_empty_candidate_marker_is_ignored() {
        let factory = factory();
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let events = EndpointEventSender::new("peer-b", 1, tx);

        let endpoint = factory.create("peer-b", events).await.expect("endpoint");
        endpoint
            .add_remote_candidate(CandidateInit {
                candidate: String::new(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
            .await
            .expect("marker accepted");
        endpoint.close().await.expect("close");
    }
}
