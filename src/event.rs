use serde::{Deserialize, Serialize};

/// Canonical telemetry record for one DNS observation.
///
/// `event_seq` is assigned by the durable buffer at write time and stays zero
/// until then. `qname` is the name exactly as observed on the wire (trailing
/// dot allowed); the normalized form is used only for classification and for
/// the `event_id` hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub event_seq: u64,
    pub ts: String,
    pub client_ip: String,
    pub qname: String,
    pub qtype: u16,
    pub rcode: u16,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub block_reason: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}
