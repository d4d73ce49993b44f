//! Connection quality sampling and classification
//!
//! A [`QualityMonitor`] is attached to a session while it is Connected. Each
//! tick pulls aggregate transport statistics from the endpoint, derives the
//! deltas since the previous tick, and classifies the result into a coarse
//! grade. Thresholds are policy constants, not protocol.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peer::endpoint::TransportStats;

/// Round-trip latency below this grades Excellent.
pub const RTT_EXCELLENT_MS: u64 = 100;
/// Round-trip latency below this grades Good.
pub const RTT_GOOD_MS: u64 = 250;
/// Round-trip latency below this grades Fair; anything slower is Poor.
pub const RTT_FAIR_MS: u64 = 400;

/// Coarse connection quality scale, worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityGrade {
    /// No baseline yet, nothing to classify
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl std::fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            QualityGrade::Unknown => "unknown",
            QualityGrade::Poor => "poor",
            QualityGrade::Fair => "fair",
            QualityGrade::Good => "good",
            QualityGrade::Excellent => "excellent",
        };
        write!(f, "{}", label)
    }
}

/// One interval's worth of transport deltas. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Round-trip estimate at sampling time, when the transport reports one
    pub rtt: Option<Duration>,
    pub at: DateTime<Utc>,
}

/// Classify a sample. A stalled interval (no packets either way) is Poor
/// regardless of latency; a missing latency estimate on a flowing interval
/// is Good rather than penalized.
pub fn grade_sample(sample: &QualitySample) -> QualityGrade {
    if sample.packets_sent == 0 && sample.packets_received == 0 {
        return QualityGrade::Poor;
    }
    match sample.rtt {
        None => QualityGrade::Good,
        Some(rtt) => {
            let ms = rtt.as_millis() as u64;
            if ms <= RTT_EXCELLENT_MS {
                QualityGrade::Excellent
            } else if ms <= RTT_GOOD_MS {
                QualityGrade::Good
            } else if ms <= RTT_FAIR_MS {
                QualityGrade::Fair
            } else {
                QualityGrade::Poor
            }
        }
    }
}

/// Per-session delta tracker. Holds only the previous tick's totals; no
/// cross-session state and no history.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    baseline: Option<TransportStats>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one tick of cumulative totals. The first observation only
    /// establishes the baseline and yields nothing; later observations
    /// yield the graded delta since the previous tick.
    pub fn observe(&mut self, stats: TransportStats) -> Option<(QualitySample, QualityGrade)> {
        let previous = match self.baseline.replace(stats) {
            Some(previous) => previous,
            None => return None,
        };

        let sample = QualitySample {
            bytes_sent: stats.bytes_sent.saturating_sub(previous.bytes_sent),
            bytes_received: stats.bytes_received.saturating_sub(previous.bytes_received),
            packets_sent: stats.packets_sent.saturating_sub(previous.packets_sent),
            packets_received: stats.packets_received.saturating_sub(previous.packets_received),
            rtt: stats.rtt,
            at: Utc::now(),
        };
        let grade = grade_sample(&sample);
        Some((sample, grade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(packets: u64, rtt_ms: Option<u64>) -> TransportStats {
        TransportStats {
            bytes_sent: packets * 120,
            bytes_received: packets * 120,
            packets_sent: packets,
            packets_received: packets,
            rtt: rtt_ms.map(Duration::from_millis),
        }
    }

    #[test]
    fn test_first_observation_only_sets_baseline() {
        let mut monitor = QualityMonitor::new();
        assert!(monitor.observe(totals(50, Some(80))).is_none());
        assert!(monitor.observe(totals(100, Some(80))).is_some());
    }

    #[test]
    fn test_observe_reports_deltas_not_totals() {
        let mut monitor = QualityMonitor::new();
        monitor.observe(totals(50, Some(80)));
        let (sample, _) = monitor.observe(totals(80, Some(80))).unwrap();
        assert_eq!(sample.packets_sent, 30);
        assert_eq!(sample.packets_received, 30);
        assert_eq!(sample.bytes_sent, 30 * 120);
    }

    #[test]
    fn test_grade_thresholds() {
        let mut monitor = QualityMonitor::new();
        monitor.observe(totals(0, None));

        let (_, grade) = monitor.observe(totals(10, Some(100))).unwrap();
        assert_eq!(grade, QualityGrade::Excellent);

        let (_, grade) = monitor.observe(totals(20, Some(101))).unwrap();
        assert_eq!(grade, QualityGrade::Good);

        let (_, grade) = monitor.observe(totals(30, Some(250))).unwrap();
        assert_eq!(grade, QualityGrade::Good);

        let (_, grade) = monitor.observe(totals(40, Some(400))).unwrap();
        assert_eq!(grade, QualityGrade::Fair);

        let (_, grade) = monitor.observe(totals(50, Some(401))).unwrap();
        assert_eq!(grade, QualityGrade::Poor);
    }

    #[test]
    fn test_stalled_interval_is_poor_even_with_low_rtt() {
        let mut monitor = QualityMonitor::new();
        monitor.observe(totals(50, Some(20)));
        let (sample, grade) = monitor.observe(totals(50, Some(20))).unwrap();
        assert_eq!(sample.packets_sent, 0);
        assert_eq!(grade, QualityGrade::Poor);
    }

    #[test]
    fn test_missing_rtt_grades_good_when_flowing() {
        let mut monitor = QualityMonitor::new();
        monitor.observe(totals(10, None));
        let (_, grade) = monitor.observe(totals(20, None)).unwrap();
        assert_eq!(grade, QualityGrade::Good);
    }

    #[test]
    fn test_grade_ordering_and_display() {
        assert!(QualityGrade::Excellent > QualityGrade::Good);
        assert!(QualityGrade::Good > QualityGrade::Fair);
        assert!(QualityGrade::Fair > QualityGrade::Poor);
        assert!(QualityGrade::Poor > QualityGrade::Unknown);
        assert_eq!(QualityGrade::Excellent.to_string(), "excellent");
        assert_eq!(QualityGrade::Unknown.to_string(), "unknown");
    }
}
