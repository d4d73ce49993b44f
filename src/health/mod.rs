//! ICE server health monitoring
//!
//! The monitor probes every configured STUN and TURN server on a fixed
//! interval, keeps a smoothed latency estimate per server, and answers
//! "which server should a new connection try first". It never raises to
//! callers: a failed probe only downgrades that server's record, and
//! selection returns `None` when nothing has been probed yet so callers
//! fall back to the configured order.

pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;

pub use probe::{server_address, ServerProber, StunProber};

/// Weight of the newest probe in the rolling latency estimate.
const LATENCY_SMOOTHING: f64 = 0.3;

/// What a server is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCategory {
    /// TURN: relays media when direct paths fail
    Relay,
    /// STUN: discovers the reflexive address
    Reflexive,
}

impl std::fmt::Display for ServerCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerCategory::Relay => write!(f, "relay"),
            ServerCategory::Reflexive => write!(f, "reflexive"),
        }
    }
}

/// Latest probe verdict for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeHealth {
    /// Not probed yet
    Unknown,
    Healthy,
    /// Reachable but slower than the configured threshold
    Degraded,
    Unreachable,
}

impl std::fmt::Display for ProbeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProbeHealth::Unknown => "unknown",
            ProbeHealth::Healthy => "healthy",
            ProbeHealth::Degraded => "degraded",
            ProbeHealth::Unreachable => "unreachable",
        };
        write!(f, "{}", label)
    }
}

/// Per-server monitoring record. Mutated only by the probe cycle.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub url: String,
    pub category: ServerCategory,
    pub username: Option<String>,
    pub credential: Option<String>,
    /// Rolling latency estimate, absent until the first successful probe
    pub latency: Option<Duration>,
    pub status: ProbeHealth,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ServerRecord {
    fn reflexive(url: &str) -> Self {
        Self {
            url: url.to_string(),
            category: ServerCategory::Reflexive,
            username: None,
            credential: None,
            latency: None,
            status: ProbeHealth::Unknown,
            last_checked: None,
        }
    }

    fn relay(url: &str, username: &str, credential: &str) -> Self {
        Self {
            url: url.to_string(),
            category: ServerCategory::Relay,
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
            latency: None,
            status: ProbeHealth::Unknown,
            last_checked: None,
        }
    }
}

/// Fleet-level verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallHealth {
    /// Nothing probed yet
    Unknown,
    Healthy,
    /// Some servers slow or unreachable
    Degraded,
    /// No server reachable at all
    Critical,
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OverallHealth::Unknown => "unknown",
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Critical => "critical",
        };
        write!(f, "{}", label)
    }
}

/// Snapshot answer of [`ServerHealthMonitor::health_report`].
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub overall: OverallHealth,
    pub recommendations: Vec<String>,
}

pub struct ServerHealthMonitor {
    servers: RwLock<Vec<ServerRecord>>,
    prober: Arc<dyn ServerProber>,
    interval: Duration,
    /// Successful probes slower than this grade the server Degraded
    degraded_after: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHealthMonitor {
    pub fn new(config: &ConnectionConfig, prober: Arc<dyn ServerProber>) -> Self {
        let mut servers: Vec<ServerRecord> = config
            .stun_servers
            .iter()
            .map(|url| ServerRecord::reflexive(url))
            .collect();
        servers.extend(
            config
                .turn_servers
                .iter()
                .map(|turn| ServerRecord::relay(&turn.url, &turn.username, &turn.credential)),
        );

        Self {
            servers: RwLock::new(servers),
            prober,
            interval: Duration::from_secs(config.options.probe_interval_secs),
            degraded_after: Duration::from_millis(config.options.degraded_latency_ms),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic probe loop. Calling again while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("health monitor already running");
            return;
        }

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            loop {
                ticker.tick().await;
                monitor.probe_cycle().await;
            }
        });
        *slot = Some(handle);

        info!(
            interval_secs = self.interval.as_secs(),
            servers = self.servers.read().len(),
            "server health monitoring started"
        );
    }

    /// Stop the probe loop. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("server health monitoring stopped");
        }
    }

    /// Probe every server once and fold the results into the records.
    /// Failures downgrade the server; nothing propagates out.
    pub async fn probe_cycle(&self) {
        let targets: Vec<(usize, String)> = self
            .servers
            .read()
            .iter()
            .enumerate()
            .map(|(i, record)| (i, record.url.clone()))
            .collect();

        for (index, url) in targets {
            let outcome = self.prober.probe(&url).await;
            let mut servers = self.servers.write();
            let Some(record) = servers.get_mut(index) else {
                continue;
            };
            record.last_checked = Some(Utc::now());
            match outcome {
                Ok(rtt) => {
                    let smoothed = match record.latency {
                        Some(previous) => Duration::from_secs_f64(
                            previous.as_secs_f64() * (1.0 - LATENCY_SMOOTHING)
                                + rtt.as_secs_f64() * LATENCY_SMOOTHING,
                        ),
                        None => rtt,
                    };
                    record.latency = Some(smoothed);
                    record.status = if rtt <= self.degraded_after {
                        ProbeHealth::Healthy
                    } else {
                        ProbeHealth::Degraded
                    };
                    debug!(
                        url = %url,
                        rtt_ms = rtt.as_millis() as u64,
                        status = %record.status,
                        "server probe"
                    );
                }
                Err(e) => {
                    record.status = ProbeHealth::Unreachable;
                    warn!(url = %url, error = %e, "server probe failed");
                }
            }
        }
    }

    /// Best server in a category: the lowest-latency Healthy one, the
    /// lowest-latency Degraded one when nothing is Healthy, `None` when the
    /// category has no probed reachable server yet.
    pub fn best_server(&self, category: ServerCategory) -> Option<ServerRecord> {
        let servers = self.servers.read();
        let pick = |status: ProbeHealth| {
            servers
                .iter()
                .filter(|r| r.category == category && r.status == status)
                .min_by_key(|r| r.latency.unwrap_or(Duration::MAX))
                .cloned()
        };
        pick(ProbeHealth::Healthy).or_else(|| pick(ProbeHealth::Degraded))
    }

    /// Fleet verdict with human-readable advisories.
    pub fn health_report(&self) -> HealthReport {
        let servers = self.servers.read();

        let probed = servers.iter().any(|r| r.status != ProbeHealth::Unknown);
        if !probed {
            return HealthReport {
                overall: OverallHealth::Unknown,
                recommendations: Vec::new(),
            };
        }

        let reachable = servers
            .iter()
            .any(|r| matches!(r.status, ProbeHealth::Healthy | ProbeHealth::Degraded));

        let mut recommendations = Vec::new();
        for record in servers.iter() {
            match record.status {
                ProbeHealth::Unreachable => {
                    recommendations.push(format!(
                        "{} server {} is unreachable, check the address or firewall",
                        record.category, record.url
                    ));
                }
                ProbeHealth::Degraded => {
                    let latency_ms = record
                        .latency
                        .map(|l| l.as_millis() as u64)
                        .unwrap_or_default();
                    recommendations.push(format!(
                        "{} server {} is slow ({}ms), consider a closer server",
                        record.category, record.url, latency_ms
                    ));
                }
                _ => {}
            }
        }

        let has_relay = servers.iter().any(|r| r.category == ServerCategory::Relay);
        if has_relay && self.best_server(ServerCategory::Relay).is_none() {
            recommendations
                .push("no relay server reachable, relayed fallback is unavailable".to_string());
        }

        let overall = if !reachable {
            OverallHealth::Critical
        } else if recommendations.is_empty() {
            OverallHealth::Healthy
        } else {
            OverallHealth::Degraded
        };

        HealthReport {
            overall,
            recommendations,
        }
    }

    /// Copy of every record, for status surfaces and tests.
    pub fn snapshot(&self) -> Vec<ServerRecord> {
        self.servers.read().clone()
    }
}
