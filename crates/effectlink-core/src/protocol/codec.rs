//! JSON codec and zero-byte framing for effectlink packets.
//!
//! Wire format:
//! ```text
//! <UTF-8 JSON object><0x00>
//! ```
//! JSON text never contains a raw `0x00` byte (control characters inside
//! strings are escaped), so the terminator is unambiguous.
//!
//! Enum fields travel as their explicit byte value.  Decoding goes through a
//! private wire struct with raw `u8` fields so that an unassigned byte is
//! reported as [`ProtocolError::UnknownVariant`] rather than a generic JSON
//! error.  Durations are integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::protocol::messages::{
    PacketType, Request, RequestConfig, RequestType, Response, ResponseConfig, ResultType,
    Target, ValidationError,
};

/// Byte that terminates every packet on the wire.
pub const FRAME_TERMINATOR: u8 = 0x00;

/// Largest frame [`FrameReader`] will buffer before giving up on the peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors that can occur while encoding, decoding or framing packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not well-formed JSON or has the wrong shape.
    #[error("malformed packet: {0}")]
    Json(#[from] serde_json::Error),

    /// An enum field carried a byte that is not assigned to any variant.
    #[error("unknown {field} value: 0x{value:02X}")]
    UnknownVariant { field: &'static str, value: u8 },

    /// The decoded fields violate a protocol invariant.
    #[error("invalid packet: {0}")]
    Invalid(#[from] ValidationError),

    /// The peer sent more than [`MAX_FRAME_LEN`] bytes without a terminator.
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    /// Reading from the underlying stream failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Wire representations ──────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct WireRequest {
    #[serde(default)]
    id: u32,
    #[serde(rename = "type")]
    request_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    viewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cost: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    player: Option<Target>,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: u32,
    #[serde(rename = "type")]
    packet_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(
        default,
        rename = "timeRemaining",
        skip_serializing_if = "Option::is_none"
    )]
    time_remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    effect: Option<String>,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Zero means "not set" for durations on the wire.
fn positive_millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|&ms| ms > 0).map(Duration::from_millis)
}

fn strip_terminator(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(&[FRAME_TERMINATOR]).unwrap_or(bytes)
}

fn terminate(mut json: Vec<u8>) -> Vec<u8> {
    json.push(FRAME_TERMINATOR);
    json
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Request`] as one terminated frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] if serialization fails, which only happens
/// for a `value` that cannot be represented as JSON.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    let config = request.to_config();
    let wire = WireRequest {
        id: config.id,
        request_type: config.request_type.as_byte(),
        effect: config.effect,
        viewer: config.viewer,
        cost: config.cost,
        targets: config.targets,
        duration: config.duration.map(millis),
        message: config.message,
        value: config.value,
        quantity: config.quantity,
        login: config.login,
        password: config.password,
        player: config.player,
    };
    Ok(terminate(serde_json::to_vec(&wire)?))
}

/// Encodes a [`Response`] as one terminated frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] if serialization fails.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    let config = response.to_config();
    let wire = WireResponse {
        id: config.id,
        packet_type: config.packet_type.as_byte(),
        status: config.result_type.map(ResultType::as_byte),
        message: config.message,
        time_remaining: config.time_remaining.map(millis),
        effect: config.effect,
    };
    Ok(terminate(serde_json::to_vec(&wire)?))
}

/// Decodes one request frame.  A trailing `0x00` is accepted but not required.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] for malformed JSON,
/// [`ProtocolError::UnknownVariant`] for an unassigned `type` byte, and
/// [`ProtocolError::Invalid`] when the fields fail request validation.
pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let wire: WireRequest = serde_json::from_slice(strip_terminator(bytes))?;
    let request_type =
        RequestType::try_from(wire.request_type).map_err(|()| ProtocolError::UnknownVariant {
            field: "request type",
            value: wire.request_type,
        })?;

    let config = RequestConfig {
        id: wire.id,
        request_type,
        effect: wire.effect,
        viewer: wire.viewer,
        cost: wire.cost,
        targets: wire.targets,
        duration: positive_millis(wire.duration),
        message: wire.message,
        value: wire.value,
        quantity: wire.quantity,
        login: wire.login,
        password: wire.password,
        player: wire.player,
    };
    Ok(Request::new(config)?)
}

/// Decodes one response frame.  A trailing `0x00` is accepted but not required.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] for malformed JSON,
/// [`ProtocolError::UnknownVariant`] for an unassigned `type` or `status`
/// byte, and [`ProtocolError::Invalid`] when validation fails.
pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let wire: WireResponse = serde_json::from_slice(strip_terminator(bytes))?;
    let packet_type =
        PacketType::try_from(wire.packet_type).map_err(|()| ProtocolError::UnknownVariant {
            field: "packet type",
            value: wire.packet_type,
        })?;
    let result_type = wire
        .status
        .map(|status| {
            ResultType::try_from(status).map_err(|()| ProtocolError::UnknownVariant {
                field: "result type",
                value: status,
            })
        })
        .transpose()?;

    let config = ResponseConfig {
        id: wire.id,
        packet_type,
        result_type,
        message: wire.message,
        time_remaining: positive_millis(wire.time_remaining),
        effect: wire.effect,
    };
    Ok(Response::new(config)?)
}

// ── Frame reader ──────────────────────────────────────────────────────────────

/// Splits a byte stream into `0x00`-terminated frames.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(512),
        }
    }

    /// Mutable access to the underlying reader (e.g. to write on a full-duplex stream).
    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }

    /// Reads up to and including the next terminator.
    ///
    /// Returns `Ok(None)` when the stream ends with nothing buffered, which is
    /// how a closed peer shows up.  A partial frame at end-of-stream is still
    /// returned so the decoder can report it as malformed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] on a read failure and
    /// [`ProtocolError::FrameTooLarge`] when no terminator appears within
    /// [`MAX_FRAME_LEN`] bytes.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.buf.clear();
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }

            let (consumed, done) = match available.iter().position(|&b| b == FRAME_TERMINATOR) {
                Some(pos) => {
                    self.buf.extend_from_slice(&available[..=pos]);
                    (pos + 1, true)
                }
                None => {
                    self.buf.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.inner.consume(consumed);

            if self.buf.len() > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge { max: MAX_FRAME_LEN });
            }
            if done {
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
