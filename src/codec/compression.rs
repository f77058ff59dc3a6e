use std::io::Read;

use bytes::{BufMut, BytesMut};
use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use http::{HeaderMap, HeaderValue};

use super::CodecError;
use crate::{
    metadata::{GRPC_ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER},
    Status,
};

/// The compression algorithms this engine knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionEncoding {
    /// No transformation; the compressed flag may still travel.
    Identity,
    /// RFC 1952 gzip.
    Gzip,
    /// RFC 1950 zlib, called `deflate` on the wire.
    Deflate,
}

impl CompressionEncoding {
    /// All encodings that actually transform bytes, in preference order.
    pub const ENCODINGS: &'static [CompressionEncoding] =
        &[CompressionEncoding::Gzip, CompressionEncoding::Deflate];

    /// The wire token for this encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionEncoding::Identity => "identity",
            CompressionEncoding::Gzip => "gzip",
            CompressionEncoding::Deflate => "deflate",
        }
    }

    /// Parse a wire token.
    pub fn from_header_token(token: &str) -> Option<CompressionEncoding> {
        match token.trim() {
            "identity" => Some(CompressionEncoding::Identity),
            "gzip" => Some(CompressionEncoding::Gzip),
            "deflate" => Some(CompressionEncoding::Deflate),
            _ => None,
        }
    }

    pub(crate) fn into_header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }

    /// Whether this encoding transforms bytes at all.
    pub fn is_identity(self) -> bool {
        self == CompressionEncoding::Identity
    }

    /// Resolve the `grpc-encoding` header of an inbound request against the
    /// encodings the server has enabled.
    ///
    /// An absent header means `identity`. An unknown or disabled algorithm
    /// yields an `unimplemented` status whose metadata carries
    /// `grpc-accept-encoding` listing the advertised algorithms, matching the
    /// trailers-only reply the server must send.
    pub(crate) fn from_encoding_header(
        map: &HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Result<CompressionEncoding, Status> {
        let Some(value) = map.get(GRPC_ENCODING_HEADER) else {
            return Ok(CompressionEncoding::Identity);
        };

        let token = value.to_str().unwrap_or("");

        if let Some(encoding) = CompressionEncoding::from_header_token(token) {
            if enabled.is_enabled(encoding) {
                return Ok(encoding);
            }
        }

        let status = match enabled.into_accept_encoding_header_value() {
            Some(advertised) => {
                let mut status = Status::unimplemented(format!(
                    "Content is compressed with `{token}` which isn't supported"
                ));
                status
                    .metadata_mut()
                    .insert(GRPC_ACCEPT_ENCODING_HEADER, advertised);
                status
            }
            None => Status::unimplemented("compression is not supported"),
        };

        Err(status)
    }

    /// Pick a response encoding: the first entry of the peer's
    /// `grpc-accept-encoding` that the local side has enabled, else `None`.
    pub(crate) fn from_accept_encoding_header(
        map: &HeaderMap,
        enabled: EnabledCompressionEncodings,
    ) -> Option<CompressionEncoding> {
        let header = map.get(GRPC_ACCEPT_ENCODING_HEADER)?;
        let header = header.to_str().ok()?;

        header
            .split(',')
            .filter_map(CompressionEncoding::from_header_token)
            .find(|encoding| !encoding.is_identity() && enabled.is_enabled(*encoding))
    }
}

impl std::fmt::Display for CompressionEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of compression algorithms a side has enabled.
///
/// `identity` is always enabled; only transforming algorithms occupy bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnabledCompressionEncodings {
    inner: u8,
}

impl EnabledCompressionEncodings {
    /// Enable an encoding. Enabling `identity` is a no-op: it is always on.
    pub fn enable(&mut self, encoding: CompressionEncoding) {
        match encoding {
            CompressionEncoding::Identity => {}
            CompressionEncoding::Gzip => self.inner |= 0b01,
            CompressionEncoding::Deflate => self.inner |= 0b10,
        }
    }

    /// Whether the given encoding may be used.
    pub fn is_enabled(&self, encoding: CompressionEncoding) -> bool {
        match encoding {
            CompressionEncoding::Identity => true,
            CompressionEncoding::Gzip => self.inner & 0b01 != 0,
            CompressionEncoding::Deflate => self.inner & 0b10 != 0,
        }
    }

    /// The `grpc-accept-encoding` value advertising the enabled algorithms,
    /// or `None` when only `identity` is enabled.
    pub fn into_accept_encoding_header_value(self) -> Option<HeaderValue> {
        let tokens: Vec<&str> = CompressionEncoding::ENCODINGS
            .iter()
            .filter(|&&encoding| self.is_enabled(encoding))
            .map(|encoding| encoding.as_str())
            .collect();

        if tokens.is_empty() {
            return None;
        }

        Some(
            HeaderValue::from_str(&tokens.join(","))
                .expect("encoding tokens are valid header text"),
        )
    }
}

/// Compress `src` into `dst`.
///
/// `Identity` copies the bytes through unchanged.
pub(crate) fn compress(
    encoding: CompressionEncoding,
    src: &[u8],
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    let capacity = ((src.len() / 2) + 16).min(src.len() + 16);
    dst.reserve(capacity);

    match encoding {
        CompressionEncoding::Identity => {
            dst.put_slice(src);
            Ok(())
        }
        CompressionEncoding::Gzip => {
            let mut encoder = GzEncoder::new(src, flate2::Compression::default());
            read_to_buf(&mut encoder, dst, usize::MAX)
        }
        CompressionEncoding::Deflate => {
            let mut encoder = ZlibEncoder::new(src, flate2::Compression::default());
            read_to_buf(&mut encoder, dst, usize::MAX)
        }
    }
}

/// Decompress `src` into `dst`, bounded by `limit`.
///
/// A fresh decoder is constructed per message, so no inflate context leaks
/// from one message into the next.
pub(crate) fn decompress(
    encoding: CompressionEncoding,
    src: &[u8],
    dst: &mut BytesMut,
    limit: usize,
) -> Result<(), CodecError> {
    let estimate = (src.len() * 2).min(limit);
    dst.reserve(estimate);

    match encoding {
        CompressionEncoding::Identity => {
            if src.len() > limit {
                return Err(CodecError::DecompressionLimitExceeded { limit });
            }
            dst.put_slice(src);
            Ok(())
        }
        CompressionEncoding::Gzip => {
            let mut decoder = GzDecoder::new(src);
            read_to_buf(&mut decoder, dst, limit)
        }
        CompressionEncoding::Deflate => {
            let mut decoder = ZlibDecoder::new(src);
            read_to_buf(&mut decoder, dst, limit)
        }
    }
}

/// Drain a reader into `dst`, failing once more than `limit` bytes come out.
fn read_to_buf(
    reader: &mut impl Read,
    dst: &mut BytesMut,
    limit: usize,
) -> Result<(), CodecError> {
    let mut chunk = [0u8; 8 * 1024];
    let mut total = 0usize;

    loop {
        let n = reader.read(&mut chunk).map_err(CodecError::Compression)?;
        if n == 0 {
            return Ok(());
        }
        total = total.saturating_add(n);
        if total > limit {
            return Err(CodecError::DecompressionLimitExceeded { limit });
        }
        dst.put_slice(&chunk[..n]);
    }
}
