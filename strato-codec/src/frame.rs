//! Length-prefixed frame codec with two coexisting header layouts.
//!
//! ## Current layout (15-byte header, big-endian)
//!
//! ```text
//! +-------------+-----------------------+----------------+--------------+---------+
//! | Magic 0xBABE| Serializer:4 | Kind:4 | RequestId (u64)| Length (u32) | Payload |
//! +-------------+-----------------------+----------------+--------------+---------+
//! ```
//!
//! ## Legacy layout (11-byte header, big-endian)
//!
//! ```text
//! +-------------+--------------+----------------+------------+---------+
//! | Magic 0xCAFE| Length (u32) | RequestId (u32)| Kind (u8)  | Payload |
//! +-------------+--------------+----------------+------------+---------+
//! ```
//!
//! The decoder sniffs the leading two bytes to pick the layout, so peers on either
//! generation can share a connection during a rolling upgrade. Replies are written in
//! the layout of the frame they answer.

use ntex_bytes::{Buf, BufMut, Bytes, BytesMut};
use ntex_codec::{Decoder, Encoder};

use strato_core::{DEFAULT_SERIALIZATION, FramingError};

/// Magic of the current header layout.
pub const MAGIC: u16 = 0xBABE;

/// Magic of the legacy header layout.
pub const LEGACY_MAGIC: u16 = 0xCAFE;

/// Size of the current header.
pub const HEADER_LEN: usize = 15;

/// Size of the legacy header.
pub const LEGACY_HEADER_LEN: usize = 11;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Call request.
    Request = 0,
    /// Reply to a request.
    Response = 1,
    /// Anything else; heartbeats today.
    Other = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Other),
            other => Err(FramingError::InvalidKind(other)),
        }
    }
}

/// Header layout generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameVersion {
    /// 15-byte header with 64-bit ids and a serializer nibble.
    #[default]
    Current,
    /// 11-byte header with 32-bit ids, json only.
    Legacy,
}

/// A parsed frame header, tagged by layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// Current layout.
    Current {
        /// Frame kind
        kind: FrameKind,
        /// Serializer id from the high nibble
        serialization: u8,
        /// Correlation id
        request_id: u64,
        /// Payload length
        len: u32,
    },
    /// Legacy layout.
    Legacy {
        /// Frame kind
        kind: FrameKind,
        /// Correlation id
        request_id: u32,
        /// Payload length
        len: u32,
    },
}

fn be_u32(src: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&src[..4]);
    u32::from_be_bytes(b)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&src[..8]);
    u64::from_be_bytes(b)
}

impl FrameHeader {
    /// Parse the header at the start of `src`.
    ///
    /// Returns `Ok(None)` if more bytes are needed to tell.
    pub fn parse(src: &[u8]) -> Result<Option<Self>, FramingError> {
        if src.len() < 2 {
            return Ok(None);
        }

        match u16::from_be_bytes([src[0], src[1]]) {
            MAGIC => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                Ok(Some(Self::Current {
                    kind: FrameKind::try_from(src[2] & 0x0f)?,
                    serialization: src[2] >> 4,
                    request_id: be_u64(&src[3..11]),
                    len: be_u32(&src[11..15]),
                }))
            }
            LEGACY_MAGIC => {
                if src.len() < LEGACY_HEADER_LEN {
                    return Ok(None);
                }
                Ok(Some(Self::Legacy {
                    len: be_u32(&src[2..6]),
                    request_id: be_u32(&src[6..10]),
                    kind: FrameKind::try_from(src[10])?,
                }))
            }
            other => Err(FramingError::BadMagic(other)),
        }
    }

    /// Layout generation.
    #[must_use]
    pub fn version(&self) -> FrameVersion {
        match self {
            Self::Current { .. } => FrameVersion::Current,
            Self::Legacy { .. } => FrameVersion::Legacy,
        }
    }

    /// Header size in bytes.
    #[must_use]
    pub fn header_len(&self) -> usize {
        match self {
            Self::Current { .. } => HEADER_LEN,
            Self::Legacy { .. } => LEGACY_HEADER_LEN,
        }
    }

    /// Declared payload length.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match *self {
            Self::Current { len, .. } | Self::Legacy { len, .. } => len as usize,
        }
    }

    /// Frame kind.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match *self {
            Self::Current { kind, .. } | Self::Legacy { kind, .. } => kind,
        }
    }

    /// Correlation id, widened to 64 bits.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        match *self {
            Self::Current { request_id, .. } => request_id,
            Self::Legacy { request_id, .. } => u64::from(request_id),
        }
    }

    /// Serializer id; legacy frames are always json.
    #[must_use]
    pub fn serialization(&self) -> u8 {
        match *self {
            Self::Current { serialization, .. } => serialization,
            Self::Legacy { .. } => DEFAULT_SERIALIZATION,
        }
    }

    fn write(&self, dst: &mut BytesMut) {
        match *self {
            Self::Current {
                kind,
                serialization,
                request_id,
                len,
            } => {
                dst.put_u16(MAGIC);
                dst.put_u8((serialization << 4) | kind as u8);
                dst.put_u64(request_id);
                dst.put_u32(len);
            }
            Self::Legacy {
                kind,
                request_id,
                len,
            } => {
                dst.put_u16(LEGACY_MAGIC);
                dst.put_u32(len);
                dst.put_u32(request_id);
                dst.put_u8(kind as u8);
            }
        }
    }
}

/// One frame: header fields plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header layout to use (or that was read).
    pub version: FrameVersion,
    /// Frame kind.
    pub kind: FrameKind,
    /// Serializer id of the payload values.
    pub serialization: u8,
    /// Correlation id.
    pub request_id: u64,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a current-layout frame.
    #[must_use]
    pub fn new(kind: FrameKind, request_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            version: FrameVersion::Current,
            kind,
            serialization: DEFAULT_SERIALIZATION,
            request_id,
            payload: payload.into(),
        }
    }

    /// Set the serializer id.
    #[must_use]
    pub fn with_serialization(mut self, serialization: u8) -> Self {
        self.serialization = serialization;
        self
    }

    /// Set the header layout.
    #[must_use]
    pub fn with_version(mut self, version: FrameVersion) -> Self {
        self.version = version;
        self
    }

    /// Header describing this frame.
    pub fn header(&self) -> Result<FrameHeader, FramingError> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            FramingError::HeaderOverflow(format!("payload length {}", self.payload.len()))
        })?;

        match self.version {
            FrameVersion::Current => {
                if self.serialization > 0x0f {
                    return Err(FramingError::HeaderOverflow(format!(
                        "serialization id {}",
                        self.serialization
                    )));
                }
                Ok(FrameHeader::Current {
                    kind: self.kind,
                    serialization: self.serialization,
                    request_id: self.request_id,
                    len,
                })
            }
            FrameVersion::Legacy => {
                if self.serialization != DEFAULT_SERIALIZATION && self.kind != FrameKind::Other {
                    return Err(FramingError::HeaderOverflow(format!(
                        "legacy frames carry serialization {DEFAULT_SERIALIZATION} only, got {}",
                        self.serialization
                    )));
                }
                let request_id = u32::try_from(self.request_id).map_err(|_| {
                    FramingError::HeaderOverflow(format!("legacy request id {}", self.request_id))
                })?;
                Ok(FrameHeader::Legacy {
                    kind: self.kind,
                    request_id,
                    len,
                })
            }
        }
    }
}

/// Frame codec configuration.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Largest accepted payload.
    pub max_payload_size: usize,

    /// Layout used for frames this side originates.
    pub encode_version: FrameVersion,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            encode_version: FrameVersion::Current,
        }
    }
}

impl CodecConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum payload size.
    #[must_use]
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the layout for originated frames.
    #[must_use]
    pub fn encode_version(mut self, version: FrameVersion) -> Self {
        self.encode_version = version;
        self
    }
}

/// Frame encoder/decoder.
///
/// ## Example
///
/// ```rust
/// use strato_codec::{Frame, FrameKind, WireCodec};
/// use ntex_bytes::BytesMut;
/// use ntex_codec::{Decoder, Encoder};
///
/// let codec = WireCodec::new();
/// let mut buf = BytesMut::new();
///
/// codec.encode(Frame::new(FrameKind::Request, 7, &b"hello"[..]), &mut buf).unwrap();
///
/// let frame = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(frame.request_id, 7);
/// assert_eq!(&frame.payload[..], b"hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct WireCodec {
    config: CodecConfig,
}

impl WireCodec {
    /// Create a codec with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with a custom configuration.
    #[inline]
    #[must_use]
    pub fn with_config(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Create a codec with a custom maximum payload size.
    #[inline]
    #[must_use]
    pub fn with_max_payload_size(max_payload_size: usize) -> Self {
        Self::with_config(CodecConfig::new().max_payload_size(max_payload_size))
    }

    /// Get the maximum payload size.
    #[inline]
    #[must_use]
    pub fn max_payload_size(&self) -> usize {
        self.config.max_payload_size
    }

    /// Layout used for originated frames.
    #[inline]
    #[must_use]
    pub fn encode_version(&self) -> FrameVersion {
        self.config.encode_version
    }

    fn check_size(&self, size: usize) -> Result<(), FramingError> {
        if size > self.config.max_payload_size {
            return Err(FramingError::FrameTooLarge {
                size,
                max: self.config.max_payload_size,
            });
        }
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = FrameHeader::parse(src)? else {
            return Ok(None);
        };

        // reject before buffering the body
        let len = header.payload_len();
        self.check_size(len)?;

        let total_len = header.header_len() + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(header.header_len());
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame {
            version: header.version(),
            kind: header.kind(),
            serialization: header.serialization(),
            request_id: header.request_id(),
            payload,
        }))
    }
}

impl Encoder for WireCodec {
    type Item = Frame;
    type Error = FramingError;

    fn encode(&self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.check_size(item.payload.len())?;
        let header = item.header()?;

        dst.reserve(header.header_len() + item.payload.len());
        header.write(dst);
        dst.put_slice(&item.payload);

        Ok(())
    }
}
