//! Frame-streams wire protocol, the transport dnstap producers speak.
//!
//! Data frames are 4-byte big-endian length-prefixed. A zero length escapes
//! a control frame: a second length, then the control payload (a 4-byte
//! control type followed by optional fields). The server side of the
//! bi-directional handshake is READY -> ACCEPT -> START, negotiating the
//! dnstap content type; STOP ends a stream.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Content type negotiated with dnstap producers.
pub const CONTENT_TYPE: &[u8] = b"protobuf:dnstap.Dnstap";

/// Per-read deadline; a silent peer is disconnected.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on any frame; dnstap payloads are far smaller.
const MAX_FRAME_LEN: usize = 1024 * 1024;

const FIELD_CONTENT_TYPE: u32 = 0x01;

/// Control frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlKind {
    Accept = 0x01,
    Start = 0x02,
    Stop = 0x03,
    Ready = 0x04,
    Finish = 0x05,
}

impl ControlKind {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0x01 => Some(ControlKind::Accept),
            0x02 => Some(ControlKind::Start),
            0x03 => Some(ControlKind::Stop),
            0x04 => Some(ControlKind::Ready),
            0x05 => Some(ControlKind::Finish),
            _ => None,
        }
    }
}

/// A decoded control frame.
#[derive(Debug)]
pub struct ControlFrame {
    pub kind: ControlKind,
    pub content_types: Vec<Vec<u8>>,
}

/// One frame off the wire.
#[derive(Debug)]
pub enum Frame {
    Data(Vec<u8>),
    Control(ControlFrame),
}

/// Reads the next frame, applying the per-read timeout to every fill.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Frame> {
    let len = read_u32(stream).await?;

    if len == 0 {
        let clen = read_u32(stream).await? as usize;
        if clen < 4 || clen > MAX_FRAME_LEN {
            bail!("control frame length {clen} out of range");
        }
        let mut buf = vec![0u8; clen];
        read_exact(stream, &mut buf).await?;
        return Ok(Frame::Control(parse_control(&buf)?));
    }

    let len = len as usize;
    if len > MAX_FRAME_LEN {
        bail!("data frame length {len} exceeds limit");
    }
    let mut buf = vec![0u8; len];
    read_exact(stream, &mut buf).await?;
    Ok(Frame::Data(buf))
}

/// Writes one control frame, optionally carrying a content-type field.
pub async fn write_control<S: AsyncWrite + Unpin>(
    stream: &mut S,
    kind: ControlKind,
    content_type: Option<&[u8]>,
) -> Result<()> {
    let mut payload = BytesMut::with_capacity(64);
    payload.put_u32(kind as u32);
    if let Some(ct) = content_type {
        payload.put_u32(FIELD_CONTENT_TYPE);
        payload.put_u32(ct.len() as u32);
        payload.put_slice(ct);
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u32(0); // control escape
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    stream
        .write_all(&buf)
        .await
        .context("control frame write failed")?;
    Ok(())
}

/// Writes one data frame.
pub async fn write_data<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(data.len() + 4);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    stream
        .write_all(&buf)
        .await
        .context("data frame write failed")?;
    Ok(())
}

/// Server side of the handshake.
///
/// A bi-directional producer sends READY with its content types and expects
/// ACCEPT before START; a uni-directional writer sends START immediately.
/// Both are accepted, with the content type validated when offered.
pub async fn accept_handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    loop {
        let control = match read_frame(stream).await? {
            Frame::Control(c) => c,
            Frame::Data(_) => bail!("data frame before handshake completed"),
        };

        match control.kind {
            ControlKind::Ready => {
                if !control
                    .content_types
                    .iter()
                    .any(|ct| ct.as_slice() == CONTENT_TYPE)
                {
                    bail!("peer offered no supported content type");
                }
                write_control(stream, ControlKind::Accept, Some(CONTENT_TYPE)).await?;
            }
            ControlKind::Start => {
                if !control.content_types.is_empty()
                    && !control
                        .content_types
                        .iter()
                        .any(|ct| ct.as_slice() == CONTENT_TYPE)
                {
                    bail!("START carries unsupported content type");
                }
                return Ok(());
            }
            other => bail!("unexpected {other:?} during handshake"),
        }
    }
}

/// Client side of the handshake; used by producers and by tests acting as
/// one: READY -> expect ACCEPT -> START.
pub async fn start_handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    write_control(stream, ControlKind::Ready, Some(CONTENT_TYPE)).await?;

    match read_frame(stream).await? {
        Frame::Control(c) if c.kind == ControlKind::Accept => {}
        Frame::Control(c) => bail!("expected ACCEPT, got {:?}", c.kind),
        Frame::Data(_) => bail!("expected ACCEPT control frame, got data"),
    }

    write_control(stream, ControlKind::Start, Some(CONTENT_TYPE)).await?;
    Ok(())
}

fn parse_control(buf: &[u8]) -> Result<ControlFrame> {
    let raw = u32::from_be_bytes(buf[..4].try_into().expect("length checked by caller"));
    let kind = ControlKind::from_u32(raw)
        .with_context(|| format!("unknown control frame type {raw:#x}"))?;

    let mut content_types = Vec::new();
    let mut rest = &buf[4..];
    while rest.len() >= 8 {
        let field = u32::from_be_bytes(rest[..4].try_into().expect("slice is 4 bytes"));
        let flen = u32::from_be_bytes(rest[4..8].try_into().expect("slice is 4 bytes")) as usize;
        rest = &rest[8..];
        if flen > rest.len() {
            bail!("control field overruns frame");
        }
        if field == FIELD_CONTENT_TYPE {
            content_types.push(rest[..flen].to_vec());
        }
        rest = &rest[flen..];
    }

    Ok(ControlFrame {
        kind,
        content_types,
    })
}

async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

async fn read_exact<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut [u8]) -> Result<()> {
    timeout(READ_TIMEOUT, stream.read_exact(buf))
        .await
        .context("frame read timed out")?
        .context("frame read failed")?;
    Ok(())
}
