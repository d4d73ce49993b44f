//! Server reachability probing
//!
//! A probe is one STUN binding round-trip. Relay servers answer binding
//! requests on the same port as allocations, so the same probe covers both
//! categories without needing credentials.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;
use webrtc::stun::agent::TransactionId;
use webrtc::stun::message::{Getter, Message, BINDING_REQUEST};
use webrtc::stun::xoraddr::XorMappedAddress;

use crate::{Error, Result};

/// Measures reachability and latency of one server.
#[async_trait]
pub trait ServerProber: Send + Sync {
    /// Probe `url` once, returning the measured round-trip time.
    async fn probe(&self, url: &str) -> Result<Duration>;
}

/// Extract `host:port` from an ICE server URL. Accepts the `stun:`,
/// `stuns:`, `turn:` and `turns:` schemes, drops any `?transport=` query,
/// and defaults the port to 3478.
pub fn server_address(url: &str) -> Result<String> {
    let mut rest = url;
    for scheme in ["stuns:", "stun:", "turns:", "turn:"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        return Err(Error::ProbeError(format!("invalid server url: {}", url)));
    }
    if rest.contains(':') {
        Ok(rest.to_string())
    } else {
        Ok(format!("{}:3478", rest))
    }
}

/// STUN binding-request prober over a throwaway UDP socket.
pub struct StunProber {
    timeout: Duration,
}

impl StunProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ServerProber for StunProber {
    async fn probe(&self, url: &str) -> Result<Duration> {
        let address = server_address(url)?;
        let target = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(Error::IoError)?
            .next()
            .ok_or_else(|| Error::ProbeError(format!("no address for {}", address)))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(Error::IoError)?;
        socket.connect(target).await.map_err(Error::IoError)?;

        let mut request = Message::new();
        request
            .build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
            .map_err(|e| Error::ProbeError(format!("binding request build failed: {}", e)))?;

        // one round-trip straight on the socket; the message codec does the
        // rest
        let started = Instant::now();
        socket.send(&request.raw).await.map_err(Error::IoError)?;

        let mut buf = vec![0u8; 1500];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::ProbeError(format!("probe of {} timed out", url)))?
            .map_err(Error::IoError)?;
        let rtt = started.elapsed();

        let mut response = Message::new();
        response.raw = buf[..len].to_vec();
        response
            .decode()
            .map_err(|e| Error::ProbeError(format!("binding response malformed: {}", e)))?;
        if response.transaction_id != request.transaction_id {
            return Err(Error::ProbeError(format!(
                "binding response from {} answers a different transaction",
                url
            )));
        }

        let mut reflexive = XorMappedAddress::default();
        reflexive
            .get_from(&response)
            .map_err(|e| Error::ProbeError(format!("binding response missing mapped address: {}", e)))?;

        debug!(url = %url, rtt_ms = rtt.as_millis() as u64, mapped = %reflexive, "probe ok");

        Ok(rtt)
    }
}
