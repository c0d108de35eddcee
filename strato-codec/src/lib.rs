//! # strato-codec
//!
//! Wire encoding for the Strato RPC runtime.
//!
//! This crate provides:
//! - `ByteCursor` - Growable byte buffer with varint and length-prefixed fields
//! - `WireCodec` - Frame encoder/decoder for the current and legacy header layouts
//! - `Serialization` - Serializer registry (json, msgpack) selected by header id
//! - `body` - Request/reply body encoding on top of frames
//!
//! ## Frame Format
//!
//! ```text
//! current: | 0xBABE | ser:4 kind:4 | request id (u64) | length (u32) | payload |
//! legacy:  | 0xCAFE | length (u32) | request id (u32) | kind (u8)    | payload |
//! ```
//!
//! All header integers are big-endian.

pub mod body;
mod cursor;
mod frame;
mod serialization;

pub use body::{Message, decode, encode_heartbeat, encode_reply, encode_request};
pub use cursor::{
    ByteCursor, MAX_VARINT_LEN_32, MAX_VARINT_LEN_64, zigzag_decode, zigzag_decode32,
    zigzag_encode, zigzag_encode32,
};
pub use frame::{
    CodecConfig, DEFAULT_MAX_PAYLOAD_SIZE, Frame, FrameHeader, FrameKind, FrameVersion,
    HEADER_LEN, LEGACY_HEADER_LEN, LEGACY_MAGIC, MAGIC, WireCodec,
};
pub use serialization::{Serialization, signature_of};
