//! Stream Framing
//!
//! Two frame shapes share one TCP stream:
//!
//! - **Line**: one compact JSON object terminated by `\n`. serde_json
//!   escapes newlines inside strings, so the delimiter never appears in
//!   a payload.
//! - **Bulk**: 8-byte big-endian length, then that many bytes of gzip
//!   payload. Payloads are capped at [`MAX_BULK_LEN`], so the first
//!   length byte is always `0x00`, which no JSON line starts with.
//!
//! Client to server, a lone `0x00` byte acknowledges a bulk frame.
//!
//! [`FrameDecoder`] is a pure incremental decoder; [`FrameReader`] wraps
//! it around an async byte stream.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Longest accepted command line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 1 << 20;

/// Largest accepted bulk payload.
pub const MAX_BULK_LEN: u64 = 64 << 20;

/// Acknowledgement byte sent after a bulk frame is received.
pub const ACK: u8 = 0x00;

const LENGTH_PREFIX: usize = 8;

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// Line exceeded [`MAX_LINE_LEN`]; it is skipped up to the next newline.
    #[error("Line too long ({0} bytes)")]
    LineTooLong(usize),

    /// Line was not valid UTF-8.
    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    /// Bulk length prefix above [`MAX_BULK_LEN`]. The stream cannot be
    /// resynchronised after this.
    #[error("Bulk frame of {0} bytes exceeds limit")]
    BulkTooLarge(u64),

    /// Compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(std::io::Error),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Fatal errors end the connection; the rest drop one frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FramingError::BulkTooLarge(_) | FramingError::Io(_))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One JSON line, without its terminator.
    Line(String),
    /// Compressed bulk payload, without its length prefix.
    Bulk(Vec<u8>),
    /// Bulk acknowledgement.
    Ack,
}

/// Which side of the connection is decoding. Servers receive lines and
/// acks; clients receive lines and bulk frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Decoding client-to-server traffic.
    Server,
    /// Decoding server-to-client traffic.
    Client,
}

/// Incremental frame decoder. Feed bytes with [`FrameDecoder::extend`],
/// pull frames with [`FrameDecoder::next_frame`].
#[derive(Debug)]
pub struct FrameDecoder {
    mode: DecodeMode,
    buf: Vec<u8>,
    discarding: bool,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
            discarding: false,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// A recoverable error consumes the offending line; calling again
    /// continues with whatever follows it.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        loop {
            if self.discarding {
                match self.buf.iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        self.buf.drain(..=end);
                        self.discarding = false;
                    }
                    None => {
                        self.buf.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(&first) = self.buf.first() else {
                return Ok(None);
            };

            if first == 0x00 {
                return match self.mode {
                    DecodeMode::Server => {
                        self.buf.drain(..1);
                        Ok(Some(Frame::Ack))
                    }
                    DecodeMode::Client => self.next_bulk(),
                };
            }

            let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_LINE_LEN {
                    let len = self.buf.len();
                    self.buf.clear();
                    self.discarding = true;
                    return Err(FramingError::LineTooLong(len));
                }
                return Ok(None);
            };

            let line: Vec<u8> = self.buf.drain(..=end).take(end).collect();
            if line.len() > MAX_LINE_LEN {
                return Err(FramingError::LineTooLong(line.len()));
            }
            let text = String::from_utf8(line).map_err(|_| FramingError::InvalidUtf8)?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(Frame::Line(trimmed.to_string())));
        }
    }

    fn next_bulk(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let len = u64::from_be_bytes(prefix);
        if len > MAX_BULK_LEN {
            return Err(FramingError::BulkTooLarge(len));
        }

        let total = LENGTH_PREFIX + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[LENGTH_PREFIX..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Frame::Bulk(payload)))
    }
}

/// Serialize a message as one `\n`-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, FramingError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Compress `payload` and prefix it with its 8-byte big-endian length.
pub fn encode_bulk(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let compressed = compress(payload)?;
    let len = compressed.len() as u64;
    if len > MAX_BULK_LEN {
        return Err(FramingError::BulkTooLarge(len));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + compressed.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

/// Gzip-compress a payload.
pub fn compress(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).map_err(FramingError::Compression)?;
    encoder.finish().map_err(FramingError::Compression)
}

/// Inflate a gzip payload, refusing output larger than [`MAX_BULK_LEN`].
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::new();
    GzDecoder::new(payload)
        .take(MAX_BULK_LEN + 1)
        .read_to_end(&mut out)
        .map_err(FramingError::Compression)?;
    if out.len() as u64 > MAX_BULK_LEN {
        return Err(FramingError::BulkTooLarge(out.len() as u64));
    }
    Ok(out)
}

/// Async frame source over a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader.
    pub fn new(reader: R, mode: DecodeMode) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(mode),
            chunk: vec![0u8; 8 * 1024].into_boxed_slice(),
        }
    }

    /// Next frame, `Ok(None)` on clean end of stream.
    ///
    /// Recoverable framing errors are logged and skipped. Cancel safe:
    /// bytes already read stay buffered in the decoder.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("dropping malformed frame: {}", e);
                    continue;
                }
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    warn!(bytes = self.decoder.buffered(), "stream closed mid-frame");
                }
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}
