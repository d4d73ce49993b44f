//! Per-peer session machinery
//!
//! Everything scoped to a single remote peer lives here: the session state
//! machine and candidate gate, the retry schedule, the endpoint abstraction
//! with its WebRTC implementation, and quality sampling.

pub mod backoff;
pub mod endpoint;
pub mod quality;
pub mod rtc;
pub mod session;

pub use backoff::{RetryPolicy, RETRY_SCHEDULE_MS};
pub use endpoint::{
    CaptureHandle, EndpointEvent, EndpointEventSender, EndpointFactory, EndpointReport,
    MediaEndpoint, MediaSource, RemoteTrackInfo, TransportSignal, TransportStats,
};
pub use quality::{QualityGrade, QualityMonitor, QualitySample};
pub use session::{minimize_sdp, ConnectionState, PeerSession, SessionRole};
