//! PowerDNS protobuf TCP source.
//!
//! The recursor connects to us and sends 2-byte big-endian length-prefixed
//! protobuf payloads. Each frame is either a single message or a batch
//! envelope; the envelope is tried only after the single-message decode
//! fails. Sessions normalize inline and emit with a non-blocking send:
//! a wedged upstream must never stall this path, so overflow drops newest.

pub mod proto;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use prost::Message as _;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::Event;
use crate::normalize::{ip_from_bytes, positive_latency_ms, Normalizer, Observation};
use crate::pipeline::stats::Stats;

/// Per-read deadline; a silent peer is disconnected.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared context for protobuf sessions.
pub struct Receiver {
    pub normalizer: Arc<Normalizer>,
    pub events: mpsc::Sender<Event>,
    pub stats: Arc<Stats>,
    pub debug: bool,
}

/// Accept loop: one session per recursor connection. Accept errors are
/// logged and the loop continues; shutdown exits cleanly.
pub async fn run(listener: TcpListener, receiver: Arc<Receiver>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if receiver.debug {
                            debug!(%peer, "protobuf sender connected");
                        }
                        let receiver = Arc::clone(&receiver);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session(stream, receiver, cancel).await {
                                debug!(error = %e, "protobuf session ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "protobuf accept failed"),
                }
            }
        }
    }
}

/// Reads length-prefixed frames off one connection until EOF, error,
/// timeout, or shutdown.
async fn session(
    mut stream: TcpStream,
    receiver: Arc<Receiver>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            payload = read_payload(&mut stream) => {
                let payload = payload?;
                receiver.process_payload(&payload);
            }
        }
    }
}

/// Reads one 2-byte big-endian length-prefixed payload.
async fn read_payload(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    timeout(READ_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .context("frame read timed out")?
        .context("frame read failed")?;

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        timeout(READ_TIMEOUT, stream.read_exact(&mut payload))
            .await
            .context("frame read timed out")?
            .context("frame read failed")?;
    }
    Ok(payload)
}

impl Receiver {
    /// Decodes one frame: single message first, then the batch envelope.
    pub fn process_payload(&self, data: &[u8]) {
        self.stats.record_pb_frame();

        match proto::PbDnsMessage::decode(data) {
            Ok(msg) => {
                self.process_message(&msg);
                return;
            }
            Err(_) => self.stats.record_pb_decode_error(),
        }

        match proto::PbDnsMessageList::decode(data) {
            Ok(list) => {
                for msg in &list.msg {
                    self.process_message(msg);
                }
            }
            Err(_) => self.stats.record_pb_list_decode_error(),
        }
    }

    /// Normalizes one message and emits it without blocking.
    ///
    /// Queries and responses are both ingested (queries carry no rcode or
    /// latency); everything else drops. Requires a sender address and a
    /// non-empty qname.
    fn process_message(&self, msg: &proto::PbDnsMessage) {
        let Ok(msg_type) = proto::PbMessageType::try_from(msg.r#type) else {
            return;
        };
        if msg_type != proto::PbMessageType::DnsQuery
            && msg_type != proto::PbMessageType::DnsResponse
        {
            return;
        }

        let Some(client_ip) = msg.from.as_deref().and_then(ip_from_bytes) else {
            return;
        };

        let qname = msg
            .question
            .as_ref()
            .and_then(|q| q.q_name.clone())
            .unwrap_or_default();
        if qname.is_empty() {
            return;
        }
        let qtype = msg
            .question
            .as_ref()
            .and_then(|q| q.q_type)
            .unwrap_or_default() as u16;

        let msg_time = timestamp_usec(msg.time_sec, msg.time_usec);

        let mut rcode = 0u16;
        let mut latency_ms = 0u64;
        if msg_type == proto::PbMessageType::DnsResponse {
            if let Some(resp) = &msg.response {
                rcode = resp.rcode.unwrap_or(0) as u16;
                let query_time = timestamp_usec(resp.query_time_sec, resp.query_time_usec);
                if let (Some(q), Some(r)) = (query_time, msg_time) {
                    latency_ms = positive_latency_ms(q, r);
                }
            }
        }

        let ts = msg_time.unwrap_or_else(Utc::now);

        if self.debug && self.stats.take_debug_sample() {
            debug!(
                r#type = ?msg_type,
                client_ip = %client_ip,
                qname = %qname,
                qtype,
                rcode,
                "protobuf sample",
            );
        }

        let event = self.normalizer.event(Observation {
            ts,
            client_ip,
            qname,
            qtype,
            rcode,
            latency_ms,
        });

        if self.events.try_send(event).is_err() {
            self.stats.record_pb_dropped();
        }
    }
}

/// Interprets a (sec, usec) pair; second value 0 means unset.
fn timestamp_usec(sec: Option<u32>, usec: Option<u32>) -> Option<DateTime<Utc>> {
    let sec = sec.filter(|s| *s != 0)?;
    Utc.timestamp_opt(i64::from(sec), usec.unwrap_or(0) * 1_000)
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;
    use std::fs;
    use tempfile::TempDir;

    fn receiver(capacity: usize) -> (TempDir, Receiver, mpsc::Receiver<Event>) {
        let tmp = TempDir::new().unwrap();
        let block = tmp.path().join("blocklist.rpz");
        let allow = tmp.path().join("whitelist.rpz");
        fs::write(&block, "").unwrap();
        fs::write(&allow, "").unwrap();

        let normalizer = Arc::new(Normalizer::new(
            "nodeA".to_string(),
            Arc::new(crate::policy::PolicyStore::new(block, allow)),
        ));
        let (tx, rx) = mpsc::channel(capacity);
        let receiver = Receiver {
            normalizer,
            events: tx,
            stats: Arc::new(Stats::new()),
            debug: false,
        };
        (tmp, receiver, rx)
    }

    fn response_message(t: u32, latency_usec: u32, rcode: u32) -> proto::PbDnsMessage {
        proto::PbDnsMessage {
            r#type: proto::PbMessageType::DnsResponse as i32,
            from: Some(vec![10, 0, 0, 5]),
            to: Some(vec![10, 0, 0, 1]),
            time_sec: Some(t),
            time_usec: Some(latency_usec),
            question: Some(proto::PbDnsQuestion {
                q_name: Some("example.com.".to_string()),
                q_type: Some(1),
                q_class: Some(1),
            }),
            response: Some(proto::PbDnsResponse {
                rcode: Some(rcode),
                applied_policy: None,
                query_time_sec: Some(t),
                query_time_usec: Some(0),
            }),
            from_port: Some(54321),
            to_port: Some(53),
        }
    }

    fn query_message(t: u32) -> proto::PbDnsMessage {
        proto::PbDnsMessage {
            r#type: proto::PbMessageType::DnsQuery as i32,
            from: Some(vec![10, 0, 0, 5]),
            to: None,
            time_sec: Some(t),
            time_usec: Some(0),
            question: Some(proto::PbDnsQuestion {
                q_name: Some("example.com.".to_string()),
                q_type: Some(28),
                q_class: Some(1),
            }),
            response: None,
            from_port: None,
            to_port: None,
        }
    }

    #[test]
    fn test_single_response_frame() {
        let (_tmp, receiver, mut rx) = receiver(16);
        let t = 1_714_564_800u32;

        receiver.process_payload(&response_message(t, 12_000, 0).encode_to_vec());

        let ev = rx.try_recv().expect("one event");
        assert_eq!(ev.client_ip, "10.0.0.5");
        assert_eq!(ev.qname, "example.com.");
        assert_eq!(ev.qtype, 1);
        assert_eq!(ev.rcode, 0);
        assert_eq!(ev.latency_ms, 12);
        assert!(rx.try_recv().is_err());

        let snap = receiver.stats.snapshot();
        assert_eq!(snap.pb_frames, 1);
        assert_eq!(snap.pb_decode_errors, 0);
    }

    #[test]
    fn test_query_frame_has_no_rcode_or_latency() {
        let (_tmp, receiver, mut rx) = receiver(16);
        let t = 1_714_564_800u32;

        receiver.process_payload(&query_message(t).encode_to_vec());

        let ev = rx.try_recv().expect("one event");
        assert_eq!(ev.qtype, 28);
        assert_eq!(ev.rcode, 0);
        assert_eq!(ev.latency_ms, 0);
        assert_eq!(ev.ts, "2024-05-01T12:00:00.000000000Z");
    }

    #[test]
    fn test_list_envelope_decoded_after_single_fails() {
        let (_tmp, receiver, mut rx) = receiver(16);
        let t = 1_714_564_800u32;

        let list = proto::PbDnsMessageList {
            msg: vec![query_message(t), query_message(t + 1), query_message(t + 2)],
        };
        receiver.process_payload(&list.encode_to_vec());

        // All three enqueued exactly once.
        for _ in 0..3 {
            rx.try_recv().expect("event from envelope");
        }
        assert!(rx.try_recv().is_err());

        // The single-message attempt failed first, then the list succeeded.
        let snap = receiver.stats.snapshot();
        assert_eq!(snap.pb_frames, 1);
        assert_eq!(snap.pb_decode_errors, 1);
        assert_eq!(snap.pb_list_decode_errors, 0);
    }

    #[test]
    fn test_garbage_frame_counts_both_decode_errors() {
        let (_tmp, receiver, mut rx) = receiver(16);

        receiver.process_payload(b"\xff\xfe\xfd garbage");

        assert!(rx.try_recv().is_err());
        let snap = receiver.stats.snapshot();
        assert_eq!(snap.pb_decode_errors, 1);
        assert_eq!(snap.pb_list_decode_errors, 1);
    }

    #[test]
    fn test_dropped_message_shapes() {
        let (_tmp, receiver, mut rx) = receiver(16);
        let t = 1_714_564_800u32;

        // Outgoing query type is not ingested.
        let mut msg = query_message(t);
        msg.r#type = proto::PbMessageType::DnsOutgoingQuery as i32;
        receiver.process_payload(&msg.encode_to_vec());

        // Missing sender address.
        let mut msg = query_message(t);
        msg.from = None;
        receiver.process_payload(&msg.encode_to_vec());

        // Empty qname.
        let mut msg = query_message(t);
        msg.question.as_mut().unwrap().q_name = Some(String::new());
        receiver.process_payload(&msg.encode_to_vec());

        // No question at all.
        let mut msg = query_message(t);
        msg.question = None;
        receiver.process_payload(&msg.encode_to_vec());

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_overflow_drops_newest() {
        let (_tmp, receiver, mut rx) = receiver(1);
        let t = 1_714_564_800u32;

        receiver.process_payload(&query_message(t).encode_to_vec());
        receiver.process_payload(&query_message(t + 1).encode_to_vec());

        assert_eq!(receiver.stats.snapshot().pb_dropped, 1);

        // The first event survived; the overflow one is gone.
        let ev = rx.try_recv().expect("first event");
        assert_eq!(ev.ts, "2024-05-01T12:00:00.000000000Z");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_negative_latency_clamped_to_zero() {
        let (_tmp, receiver, mut rx) = receiver(16);
        let t = 1_714_564_800u32;

        let mut msg = response_message(t, 0, 0);
        // Query recorded after the response timestamp.
        msg.response.as_mut().unwrap().query_time_sec = Some(t + 5);
        receiver.process_payload(&msg.encode_to_vec());

        let ev = rx.try_recv().expect("event");
        assert_eq!(ev.latency_ms, 0);
    }
}
