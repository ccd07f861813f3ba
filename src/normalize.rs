//! Uniform event construction: canonical timestamp, classification, and the
//! stable event id the upstream uses for idempotent retries.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::event::Event;
use crate::policy::PolicyStore;

/// A decoded DNS observation from either source, before classification.
#[derive(Debug, Clone)]
pub struct Observation {
    pub ts: DateTime<Utc>,
    pub client_ip: String,
    pub qname: String,
    pub qtype: u16,
    pub rcode: u16,
    pub latency_ms: u64,
}

/// Turns raw observations into canonical events.
pub struct Normalizer {
    node_name: String,
    policy: Arc<PolicyStore>,
}

impl Normalizer {
    pub fn new(node_name: String, policy: Arc<PolicyStore>) -> Self {
        Self { node_name, policy }
    }

    /// Builds the canonical event for one observation.
    ///
    /// The normalized qname (lowercase, one trailing dot stripped) is used
    /// for classification and hashing only; the emitted event carries the
    /// qname as observed. The policy store throttles its own reloads.
    pub fn event(&self, obs: Observation) -> Event {
        let norm_qname = normalize_qname(&obs.qname);
        let blocked = self.policy.is_blocked(&norm_qname);
        let ts = obs.ts.to_rfc3339_opts(SecondsFormat::Nanos, true);

        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}",
            self.node_name, ts, obs.client_ip, norm_qname, obs.qtype, obs.rcode,
        ));
        let event_id = hex::encode(hasher.finalize());

        Event {
            event_seq: 0,
            ts,
            client_ip: obs.client_ip,
            qname: obs.qname,
            qtype: obs.qtype,
            rcode: obs.rcode,
            blocked,
            latency_ms: obs.latency_ms,
            event_id,
            block_reason: if blocked {
                "rpz".to_string()
            } else {
                String::new()
            },
        }
    }
}

/// Lowercases and strips one trailing dot.
fn normalize_qname(qname: &str) -> String {
    let trimmed = qname.strip_suffix('.').unwrap_or(qname);
    trimmed.to_ascii_lowercase()
}

/// Millisecond latency between a query/response clock pair; zero unless the
/// delta is strictly positive.
pub(crate) fn positive_latency_ms(query: DateTime<Utc>, response: DateTime<Utc>) -> u64 {
    let delta = response.signed_duration_since(query);
    if delta > chrono::Duration::zero() {
        delta.num_milliseconds().max(0) as u64
    } else {
        0
    }
}

/// Renders a raw protobuf address (4 bytes IPv4, 16 bytes IPv6) as text.
pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes)
            .ok()
            .map(|octets| std::net::Ipv4Addr::from(octets).to_string()),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|octets| std::net::Ipv6Addr::from(octets).to_string()),
        _ => None,
    }
}
