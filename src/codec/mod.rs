//! Length-prefixed gRPC message framing.
//!
//! Every gRPC message travels as `[1 byte compressed flag][4 byte big-endian
//! length][payload]`. [`FrameReader`] reassembles messages from arbitrarily
//! chunked byte input and [`FrameWriter`] produces framed buffers, applying
//! per-message compression when configured.

pub(crate) mod compression;
mod frame;

pub use compression::{CompressionEncoding, EnabledCompressionEncodings};
pub use frame::{FrameReader, FrameWriter};

use std::{error::Error, fmt};

use crate::{Code, Status};

/// Flag byte plus the four length bytes.
pub const HEADER_SIZE: usize = 5;

/// Default bound on the inflated size of a single message: 4 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced while framing or deframing messages.
#[derive(Debug)]
pub enum CodecError {
    /// A frame arrived with the compressed flag set but no decompressor was
    /// configured for the stream.
    CompressionUnsupported,
    /// The flag byte was neither 0 nor 1.
    InvalidCompressionFlag(u8),
    /// The announced payload length exceeds the configured limit.
    PayloadLengthLimitExceeded {
        /// Length announced by the frame header.
        actual: usize,
        /// The configured bound.
        limit: usize,
    },
    /// Inflating a compressed payload would exceed the decompression limit.
    DecompressionLimitExceeded {
        /// The configured bound.
        limit: usize,
    },
    /// An outgoing payload does not fit in the four-byte length prefix.
    MessageTooLarge {
        /// Size of the offending payload.
        actual: usize,
    },
    /// The underlying zlib stream failed.
    Compression(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::CompressionUnsupported => {
                write!(f, "received a compressed message but no decompressor is configured")
            }
            CodecError::InvalidCompressionFlag(flag) => write!(
                f,
                "protocol error: received message with invalid compression flag: {flag} (valid flags are 0 and 1)"
            ),
            CodecError::PayloadLengthLimitExceeded { actual, limit } => write!(
                f,
                "message length {actual} exceeds the limit of {limit} bytes"
            ),
            CodecError::DecompressionLimitExceeded { limit } => write!(
                f,
                "message would decompress beyond the limit of {limit} bytes"
            ),
            CodecError::MessageTooLarge { actual } => {
                write!(f, "message of {actual} bytes does not fit in a frame")
            }
            CodecError::Compression(err) => write!(f, "compression failed: {err}"),
        }
    }
}

impl Error for CodecError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CodecError::Compression(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Status {
        let code = match err {
            CodecError::PayloadLengthLimitExceeded { .. }
            | CodecError::DecompressionLimitExceeded { .. } => Code::ResourceExhausted,
            _ => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}
