//! Events emitted by the connection layer and the bounded fault log.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::FailureKind;
use crate::peer::endpoint::RemoteTrackInfo;
use crate::peer::quality::{QualityGrade, QualitySample};
use crate::peer::session::ConnectionState;

/// How many fault records are retained before the oldest is dropped.
const FAULT_LOG_CAPACITY: usize = 64;

/// Events emitted by the voice connection layer for its caller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ChannelJoined {
        channel_id: String,
    },
    ChannelLeft {
        channel_id: String,
    },
    PeerStateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    /// A remote media track became available for a peer.
    RemoteTrack {
        peer_id: String,
        track: RemoteTrackInfo,
    },
    Quality {
        peer_id: String,
        grade: QualityGrade,
        sample: QualitySample,
    },
    MuteChanged {
        muted: bool,
    },
    Error(FaultRecord),
}

/// One recorded failure.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub kind: FailureKind,
    /// Peer the failure relates to, when there is one.
    pub peer_id: Option<String>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Append-only, bounded failure log shared across components.
///
/// Recording a fault also emits it as [`SessionEvent::Error`]. Failures land
/// here instead of crossing component boundaries as `Err` (see the crate
/// docs on error propagation); dropped event sends are fine, the log itself
/// is the durable record.
#[derive(Clone)]
pub struct FaultLog {
    inner: Arc<FaultLogInner>,
}

struct FaultLogInner {
    records: RwLock<VecDeque<FaultRecord>>,
    events: mpsc::Sender<SessionEvent>,
}

impl FaultLog {
    pub(crate) fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            inner: Arc::new(FaultLogInner {
                records: RwLock::new(VecDeque::with_capacity(FAULT_LOG_CAPACITY)),
                events,
            }),
        }
    }

    /// Record a failure, bounded to the log capacity, and emit it as an event.
    pub fn record(&self, kind: FailureKind, peer_id: Option<&str>, detail: impl Into<String>) {
        let record = FaultRecord {
            kind,
            peer_id: peer_id.map(|p| p.to_string()),
            detail: detail.into(),
            at: Utc::now(),
        };

        warn!(
            kind = %record.kind,
            peer_id = ?record.peer_id,
            "{}",
            record.detail
        );

        {
            let mut records = self.inner.records.write();
            if records.len() == FAULT_LOG_CAPACITY {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        let _ = self.inner.events.try_send(SessionEvent::Error(record));
    }

    /// Snapshot of the retained records, oldest first.
    pub fn recent(&self) -> Vec<FaultRecord> {
        self.inner.records.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_emits_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let log = FaultLog::new(tx);

        log.record(FailureKind::ValidationFailure, Some("peer-b"), "bad token");

        assert_eq!(log.len(), 1);
        match rx.recv().await {
            Some(SessionEvent::Error(record)) => {
                assert_eq!(record.kind, FailureKind::ValidationFailure);
                assert_eq!(record.peer_id.as_deref(), Some("peer-b"));
                assert_eq!(record.detail, "bad token");
            }
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let (tx, _rx) = mpsc::channel(8);
        let log = FaultLog::new(tx);

        for i in 0..(FAULT_LOG_CAPACITY + 10) {
            log.record(FailureKind::TransportFailure, None, format!("fault {}", i));
        }

        let records = log.recent();
        assert_eq!(records.len(), FAULT_LOG_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(records[0].detail, "fault 10");
    }

    #[tokio::test]
    async fn test_record_with_closed_receiver_does_not_panic() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let log = FaultLog::new(tx);

        log.record(FailureKind::NegotiationFailure, Some("peer-c"), "answer rejected");
        assert_eq!(log.len(), 1);
    }
}
