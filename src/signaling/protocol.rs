//! Signaling wire protocol types
//!
//! Messages are JSON objects discriminated by a kebab-case `"type"` tag with
//! camelCase fields, matching what the relay forwards verbatim between
//! participants. The relay addresses `offer`/`answer`/`ice-candidate` by
//! `targetPeerId` and never inspects payloads.

use serde::{Deserialize, Serialize};

/// Opaque negotiation payload exchanged between two peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    /// Which negotiation leg produced this description
    #[serde(rename = "type")]
    pub kind: DescriptionKind,

    /// Raw SDP text
    pub sdp: String,
}

/// Negotiation leg discriminator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl std::fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptionKind::Offer => write!(f, "offer"),
            DescriptionKind::Answer => write!(f, "answer"),
        }
    }
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its transmissible init form.
///
/// An empty `candidate` string is the end-of-candidates marker and is
/// forwarded like any other candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateInit {
    /// Candidate description line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media description index
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Signaling message kinds carried by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Announce membership in a voice channel
    #[serde(rename_all = "camelCase")]
    JoinChannel {
        /// Channel being joined
        channel_id: String,
        /// Joining participant
        user_id: String,
    },

    /// Announce departure from a voice channel
    #[serde(rename_all = "camelCase")]
    LeaveChannel {
        /// Channel being left
        channel_id: String,
        /// Departing participant
        user_id: String,
    },

    /// Relay notification that another participant shares the channel
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        /// The other participant
        peer_id: String,
        /// Channel they joined
        channel_id: String,
    },

    /// Relay notification that a participant left
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        /// The departed participant
        peer_id: String,
    },

    /// Negotiation offer addressed to one peer
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Recipient peer ID
        target_peer_id: String,
        /// Sender peer ID
        from_peer_id: String,
        /// Offer description
        offer: SessionDescription,
        /// Origin the sender claims; checked against the allow-list
        origin: String,
        /// Bearer token proving the sender's identity
        token: String,
    },

    /// Negotiation answer addressed to one peer
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Recipient peer ID
        target_peer_id: String,
        /// Sender peer ID
        from_peer_id: String,
        /// Answer description
        answer: SessionDescription,
    },

    /// ICE candidate addressed to one peer
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Recipient peer ID
        target_peer_id: String,
        /// Sender peer ID
        from_peer_id: String,
        /// Candidate payload
        candidate: CandidateInit,
    },
}

impl SignalMessage {
    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize signaling message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }

    /// Get the wire tag for this message
    pub fn kind_name(&self) -> &'static str {
        match self {
            SignalMessage::JoinChannel { .. } => "join-channel",
            SignalMessage::LeaveChannel { .. } => "leave-channel",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Recipient peer for peer-addressed messages
    pub fn target_peer_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { target_peer_id, .. }
            | SignalMessage::Answer { target_peer_id, .. }
            | SignalMessage::IceCandidate { target_peer_id, .. } => Some(target_peer_id),
            _ => None,
        }
    }

    /// Sender peer for peer-addressed messages
    pub fn from_peer_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { from_peer_id, .. }
            | SignalMessage::Answer { from_peer_id, .. }
            | SignalMessage::IceCandidate { from_peer_id, .. } => Some(from_peer_id),
            _ => None,
        }
    }
}
