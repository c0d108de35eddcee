//! Frame read and write loops shared by client connections and exposers.

use ntex_bytes::{Bytes, BytesMut};
use ntex_codec::{Decoder, Encoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use strato_codec::{Frame, WireCodec};
use strato_core::{FramingError, StratoError, TransportError};

const READ_CHUNK: usize = 16 * 1024;
const WRITE_BATCH: usize = 64;

/// Depth of the per-connection outbound frame queue.
pub(crate) const WRITE_QUEUE: usize = 1024;

/// Reads whole frames off a socket.
pub(crate) struct FrameReader {
    stream: OwnedReadHalf,
    codec: WireCodec,
    buf: BytesMut,
    chunk: Box<[u8]>,
}

impl FrameReader {
    pub(crate) fn new(stream: OwnedReadHalf, codec: WireCodec) -> Self {
        Self {
            stream,
            codec,
            buf: BytesMut::with_capacity(READ_CHUNK),
            chunk: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Next frame, or `None` on a clean end of stream.
    pub(crate) async fn next(&mut self) -> Result<Option<Frame>, StratoError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            let n = self.stream.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionClosed.into());
            }
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }
}

/// Encode one frame into an owned buffer for the write queue.
pub(crate) fn encode_frame(codec: &WireCodec, frame: Frame) -> Result<Bytes, FramingError> {
    let mut buf = BytesMut::with_capacity(frame.payload.len() + strato_codec::HEADER_LEN);
    codec.encode(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Drain the queue onto the socket, batching whatever is ready.
pub(crate) async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
) -> std::io::Result<()> {
    let mut batch = Vec::with_capacity(WRITE_BATCH);
    loop {
        if queue.recv_many(&mut batch, WRITE_BATCH).await == 0 {
            return stream.shutdown().await;
        }

        for bytes in batch.drain(..) {
            stream.write_all(&bytes).await?;
        }
        stream.flush().await?;
    }
}
