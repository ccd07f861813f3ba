//! dnstap frame-stream source.
//!
//! The agent listens on a UNIX socket; the local recursor connects as a
//! frame-streams producer. Relay sessions forward raw data frames into a
//! bounded channel with a blocking send, so a slow consumer backpressures the
//! producer instead of dropping. Payload decoding happens on the consumer
//! side (`decode_frame`), keeping the DNS parse path single-owner.

pub mod frame;
pub mod proto;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use hickory_proto::op::Message as DnsWireMessage;
use prost::Message as _;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::normalize::{ip_from_bytes, positive_latency_ms, Observation};

/// Binds the listening socket, replacing a stale file from a previous run,
/// and widens its mode so a non-root recursor can connect.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding dnstap socket {}", path.display()))?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("setting mode on {}", path.display()))?;

    Ok(listener)
}

/// Accept loop: one relay session per producer connection.
pub async fn run(listener: UnixListener, frames: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        debug!("dnstap producer connected");
                        let frames = frames.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay_session(stream, frames, cancel).await {
                                debug!(error = %e, "dnstap session ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "dnstap accept failed"),
                }
            }
        }
    }
}

/// Handshakes one producer, then relays its data frames until STOP, error,
/// read timeout, or shutdown.
async fn relay_session(
    mut stream: UnixStream,
    frames: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<()> {
    frame::accept_handshake(&mut stream).await?;
    debug!("dnstap producer stream started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = frame::read_frame(&mut stream) => {
                match next? {
                    frame::Frame::Data(data) => {
                        if frames.send(data).await.is_err() {
                            // Consumer is gone; nothing left to relay to.
                            return Ok(());
                        }
                    }
                    frame::Frame::Control(c) if c.kind == frame::ControlKind::Stop => {
                        let _ = frame::write_control(
                            &mut stream,
                            frame::ControlKind::Finish,
                            None,
                        )
                        .await;
                        debug!("dnstap producer stream stopped");
                        return Ok(());
                    }
                    frame::Frame::Control(c) => {
                        debug!(kind = ?c.kind, "ignoring mid-stream control frame");
                    }
                }
            }
        }
    }
}

/// Outcome of decoding one dnstap frame.
#[derive(Debug)]
pub enum Decoded {
    /// A client-response, ready for normalization.
    Observation(Observation),
    /// A well-formed frame this agent does not ingest.
    Skipped(&'static str),
}

/// Decodes one dnstap frame into an observation.
///
/// Only client-response messages are ingested. Frames without a query
/// address, without a response payload, or without a question are skipped;
/// protobuf or DNS wire decode failures surface as errors so the caller can
/// count them.
pub fn decode_frame(data: &[u8]) -> Result<Decoded> {
    let tap = proto::Dnstap::decode(data).context("dnstap protobuf decode")?;

    let Some(msg) = tap.message else {
        return Ok(Decoded::Skipped("no-message"));
    };

    let Ok(msg_type) = proto::MessageType::try_from(msg.r#type) else {
        return Ok(Decoded::Skipped("unknown-type"));
    };
    if msg_type != proto::MessageType::ClientResponse {
        return Ok(Decoded::Skipped(msg_type.as_label()));
    }

    let Some(client_ip) = msg.query_address.as_deref().and_then(ip_from_bytes) else {
        return Ok(Decoded::Skipped("missing-query-address"));
    };

    let wire = msg.response_message.as_deref().unwrap_or_default();
    if wire.is_empty() {
        return Ok(Decoded::Skipped("empty-response-message"));
    }

    let dns = DnsWireMessage::from_vec(wire).context("dns wire decode")?;
    let Some(question) = dns.queries().first() else {
        return Ok(Decoded::Skipped("no-question"));
    };

    let qname = question.name().to_string();
    let qtype = u16::from(question.query_type());
    let rcode = u16::from(dns.response_code().low());

    let query_time = timestamp(msg.query_time_sec, msg.query_time_nsec);
    let response_time = timestamp(msg.response_time_sec, msg.response_time_nsec);

    let latency_ms = match (query_time, response_time) {
        (Some(q), Some(r)) => positive_latency_ms(q, r),
        _ => 0,
    };

    let ts = response_time.or(query_time).unwrap_or_else(Utc::now);

    Ok(Decoded::Observation(Observation {
        ts,
        client_ip,
        qname,
        qtype,
        rcode,
        latency_ms,
    }))
}

/// Interprets a (sec, nsec) pair; second value 0 means unset.
fn timestamp(sec: Option<u64>, nsec: Option<u32>) -> Option<DateTime<Utc>> {
    let sec = sec.filter(|s| *s != 0)?;
    Utc.timestamp_opt(sec as i64, nsec.unwrap_or(0)).single()
}
