//! Error types for voice session management

/// Result type alias using voicemesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in voice session operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling transport is not connected; join/leave rejected up front
    #[error("Signaling transport unavailable: {0}")]
    SignalingUnavailable(String),

    /// Session not found for the given peer
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Server health probe error
    #[error("Probe error: {0}")]
    ProbeError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::ProbeError(_)
                | Error::OperationTimeout(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a negotiation error
    pub fn is_negotiation_error(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_) | Error::IceCandidateError(_) | Error::SdpError(_)
        )
    }
}

/// Coarse failure classification used by the fault log and error events.
///
/// These mirror how failures propagate: validation and negotiation failures
/// are recorded and emitted but never returned across component boundaries;
/// transport failures drive the session state machine; only
/// `TransportUnavailable` surfaces synchronously to the caller of
/// `join_channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad origin or token; the session was never created
    ValidationFailure,
    /// A description was rejected during offer/answer exchange
    NegotiationFailure,
    /// The media transport reported disconnected/failed
    TransportFailure,
    /// The backoff schedule was exhausted; session is Failed
    ExhaustedRetries,
    /// The signaling channel was not connected when an operation needed it
    TransportUnavailable,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::ValidationFailure => "validation-failure",
            FailureKind::NegotiationFailure => "negotiation-failure",
            FailureKind::TransportFailure => "transport-failure",
            FailureKind::ExhaustedRetries => "exhausted-retries",
            FailureKind::TransportUnavailable => "transport-unavailable",
        };
        write!(f, "{}", name)
    }
}
