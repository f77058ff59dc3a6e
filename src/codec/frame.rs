use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use super::{
    compression::{compress, decompress, CompressionEncoding},
    CodecError, HEADER_SIZE,
};

/// Read bytes are reclaimed once the cursor passes this many bytes and more
/// than half of the buffer.
const DISCARD_THRESHOLD: usize = 1024;

/// Reassembles length-prefixed messages from arbitrarily chunked input.
///
/// The reader is sans-io: the caller appends whatever bytes the transport
/// produced and repeatedly asks for the next complete message. A message may
/// span many chunks and a chunk may hold many messages plus a partial tail.
pub struct FrameReader {
    state: State,
    buf: BytesMut,
    /// Bytes of `buf` already consumed. Kept explicit so read bytes can be
    /// reclaimed lazily instead of on every message.
    read: usize,
    decompressor: Option<CompressionEncoding>,
    decompression_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectingFlag,
    ExpectingLength { compressed: bool },
    ExpectingPayload { compressed: bool, len: usize },
}

impl FrameReader {
    /// Create a reader.
    ///
    /// `decompressor` is the negotiated algorithm for inbound messages;
    /// `None` means frames with the compressed flag set are a protocol error.
    /// `decompression_limit` bounds the inflated size of any single message.
    pub fn new(decompressor: Option<CompressionEncoding>, decompression_limit: usize) -> Self {
        FrameReader {
            state: State::ExpectingFlag,
            buf: BytesMut::new(),
            read: 0,
            decompressor,
            decompression_limit,
        }
    }

    /// Append transport bytes to the internal buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// True while the reader sits in the middle of a message: a frame header
    /// was started but its payload has not been delivered yet, or unread
    /// bytes remain buffered.
    pub fn is_reading(&self) -> bool {
        self.state != State::ExpectingFlag || self.unread() > 0
    }

    fn unread(&self) -> usize {
        self.buf.len() - self.read
    }

    fn peek(&self) -> &[u8] {
        &self.buf[self.read..]
    }

    /// Pull the next complete message out of the buffer.
    ///
    /// Returns `Ok(None)` when more input is needed. `max_length` bounds the
    /// announced payload length of the frame being read; a frame that exceeds
    /// it fails without consuming its header, so the reader's state is
    /// unchanged by the error.
    pub fn next_message(&mut self, max_length: usize) -> Result<Option<Bytes>, CodecError> {
        loop {
            match self.state {
                State::ExpectingFlag => {
                    if self.unread() < 1 {
                        return Ok(None);
                    }
                    let flag = self.peek()[0];
                    let compressed = match flag {
                        0 => false,
                        1 => {
                            if self.decompressor.is_none() {
                                return Err(CodecError::CompressionUnsupported);
                            }
                            true
                        }
                        other => {
                            trace!("unexpected compression flag {other}");
                            return Err(CodecError::InvalidCompressionFlag(other));
                        }
                    };
                    self.read += 1;
                    self.state = State::ExpectingLength { compressed };
                }
                State::ExpectingLength { compressed } => {
                    if self.unread() < HEADER_SIZE - 1 {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes(
                        self.peek()[..4].try_into().expect("four bytes are buffered"),
                    ) as usize;
                    if len > max_length {
                        return Err(CodecError::PayloadLengthLimitExceeded {
                            actual: len,
                            limit: max_length,
                        });
                    }
                    self.read += 4;
                    self.buf.reserve(len.saturating_sub(self.unread()));
                    self.state = State::ExpectingPayload { compressed, len };
                }
                State::ExpectingPayload { compressed, len } => {
                    if self.unread() < len {
                        return Ok(None);
                    }

                    let message = self.take_payload(compressed, len)?;
                    self.state = State::ExpectingFlag;
                    self.maybe_discard_read_bytes();
                    return Ok(Some(message));
                }
            }
        }
    }

    fn take_payload(&mut self, compressed: bool, len: usize) -> Result<Bytes, CodecError> {
        let message = if compressed {
            let encoding = self
                .decompressor
                .expect("compressed flag was validated against the decompressor");

            let mut inflated = BytesMut::new();
            decompress(
                encoding,
                &self.peek()[..len],
                &mut inflated,
                self.decompression_limit,
            )?;
            inflated.freeze()
        } else {
            Bytes::copy_from_slice(&self.peek()[..len])
        };

        self.read += len;
        Ok(message)
    }

    /// Bound buffered memory: drop the buffer entirely once it holds nothing
    /// unread, otherwise reclaim read bytes when the cursor passed 1024 bytes
    /// and more than half the buffer.
    fn maybe_discard_read_bytes(&mut self) {
        if self.unread() == 0 {
            self.buf = BytesMut::new();
            self.read = 0;
        } else if self.read > DISCARD_THRESHOLD && self.read > self.buf.capacity() / 2 {
            self.buf.advance(self.read);
            self.read = 0;
        }
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("state", &self.state)
            .field("buffered", &self.unread())
            .finish()
    }
}

/// Produces framed buffers from opaque payloads.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    compression: Option<CompressionEncoding>,
}

impl FrameWriter {
    /// Create a writer with an optional outbound compression algorithm.
    pub fn new(compression: Option<CompressionEncoding>) -> Self {
        FrameWriter { compression }
    }

    /// Frame one payload: flag byte, big-endian length, then the payload,
    /// compressed when a non-identity algorithm is configured and the
    /// per-message flag asks for it.
    pub fn encode(&self, payload: &[u8], compressed: bool) -> Result<Bytes, CodecError> {
        let flagged = compressed && self.compression.is_some();
        let transform = self
            .compression
            .filter(|encoding| compressed && !encoding.is_identity());

        let body: Bytes = match transform {
            Some(encoding) => {
                let mut dst = BytesMut::new();
                compress(encoding, payload, &mut dst)?;
                dst.freeze()
            }
            None => Bytes::copy_from_slice(payload),
        };

        if body.len() > u32::MAX as usize {
            return Err(CodecError::MessageTooLarge { actual: body.len() });
        }

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
        frame.put_u8(u8::from(flagged));
        frame.put_u32(body.len() as u32);
        frame.put(body);
        Ok(frame.freeze())
    }
}
