//! Request and reply bodies carried in frame payloads.
//!
//! Both bodies are written with [`ByteCursor`]: strings and maps are
//! length-prefixed, counters are unsigned varints, and argument/result values are
//! opaque bytes produced by the serializer named in the frame header.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use strato_core::{
    BusinessError, FrameworkError, FramingError, Reply, Request, StratoError,
};

use crate::cursor::ByteCursor;
use crate::frame::{Frame, FrameKind, FrameVersion};

const STATUS_OK: u8 = 0;
const STATUS_BUSINESS: u8 = 1;
const STATUS_FRAMEWORK: u8 = 2;

/// A decoded frame.
#[derive(Debug, Clone)]
pub enum Message {
    /// A call to dispatch.
    Request(Request),
    /// The answer to a call.
    Reply(Reply),
    /// Liveness probe or its echo.
    Heartbeat(u64),
}

fn to_micros(at: Option<SystemTime>) -> u64 {
    at.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

fn from_micros(micros: u64) -> Option<SystemTime> {
    (micros != 0).then(|| UNIX_EPOCH + Duration::from_micros(micros))
}

/// Encode a request into a frame of the given layout.
pub fn encode_request(request: &Request, version: FrameVersion) -> Result<Frame, FramingError> {
    let mut cur = ByteCursor::with_capacity(64 + request.args.len());
    cur.write_str(&request.interface);
    cur.write_str(&request.version);
    cur.write_str(&request.method);
    cur.write_str(&request.signature);
    cur.write_map(&request.options);
    cur.write_uvarint(u64::from(request.attempt));
    cur.write_uvarint(to_micros(request.sent_at));
    cur.write_bytes(&request.args);

    let frame = Frame::new(FrameKind::Request, request.request_id, cur.into_bytes())
        .with_serialization(request.serialization)
        .with_version(version);
    frame.header()?;
    Ok(frame)
}

/// Encode a reply into a frame of the given layout.
///
/// Errors other than business errors travel as their display text.
pub fn encode_reply(reply: &Reply, version: FrameVersion) -> Result<Frame, FramingError> {
    let mut cur = ByteCursor::with_capacity(32);
    match &reply.outcome {
        Ok(result) => {
            cur.write_u8(STATUS_OK);
            cur.write_bytes(result);
        }
        Err(StratoError::Business(e)) => {
            cur.write_u8(STATUS_BUSINESS);
            cur.write_uvarint(u64::from(e.code));
            cur.write_str(&e.message);
        }
        Err(StratoError::Framework(FrameworkError::Remote(message))) => {
            cur.write_u8(STATUS_FRAMEWORK);
            cur.write_str(message);
        }
        Err(other) => {
            cur.write_u8(STATUS_FRAMEWORK);
            cur.write_str(&other.to_string());
        }
    }
    cur.write_map(&reply.options);
    cur.write_uvarint(u64::try_from(reply.elapsed.as_micros()).unwrap_or(u64::MAX));

    // error replies carry no values; keep them json so legacy peers can read them
    let serialization = if reply.is_ok() {
        reply.serialization
    } else {
        strato_core::DEFAULT_SERIALIZATION
    };

    let frame = Frame::new(FrameKind::Response, reply.request_id, cur.into_bytes())
        .with_serialization(serialization)
        .with_version(version);
    frame.header()?;
    Ok(frame)
}

/// Heartbeat frame with an empty payload.
#[must_use]
pub fn encode_heartbeat(request_id: u64, version: FrameVersion) -> Frame {
    Frame::new(FrameKind::Other, request_id, Vec::new()).with_version(version)
}

/// Decode a frame body.
pub fn decode(frame: &Frame) -> Result<Message, FramingError> {
    match frame.kind {
        FrameKind::Request => decode_request(frame).map(Message::Request),
        FrameKind::Response => decode_reply(frame).map(Message::Reply),
        FrameKind::Other => Ok(Message::Heartbeat(frame.request_id)),
    }
}

fn decode_request(frame: &Frame) -> Result<Request, FramingError> {
    let mut cur = ByteCursor::from_slice(&frame.payload);

    let interface = cur.read_string()?;
    let version = cur.read_string()?;
    let method = cur.read_string()?;
    let signature = cur.read_string()?;
    let options = cur.read_map()?;
    let attempt = cur.read_uvarint32()?;
    let sent_at = from_micros(cur.read_uvarint()?);
    let args = cur.read_bytes()?;

    Ok(Request {
        request_id: frame.request_id,
        interface,
        version,
        method,
        signature,
        serialization: frame.serialization,
        args,
        options,
        attempt,
        sent_at,
        received_at: Some(SystemTime::now()),
    })
}

fn decode_reply(frame: &Frame) -> Result<Reply, FramingError> {
    let mut cur = ByteCursor::from_slice(&frame.payload);

    let outcome = match cur.read_u8()? {
        STATUS_OK => Ok(cur.read_bytes()?),
        STATUS_BUSINESS => {
            let code = cur.read_uvarint32()?;
            let message = cur.read_string()?;
            Err(StratoError::Business(BusinessError::new(code, message)))
        }
        STATUS_FRAMEWORK => Err(StratoError::Framework(FrameworkError::Remote(
            cur.read_string()?,
        ))),
        other => {
            return Err(FramingError::Deserialization(format!(
                "unknown reply status {other}"
            )));
        }
    };
    let options = cur.read_map()?;
    let elapsed = Duration::from_micros(cur.read_uvarint()?);

    Ok(Reply {
        request_id: frame.request_id,
        serialization: frame.serialization,
        outcome,
        options,
        elapsed,
    })
}
