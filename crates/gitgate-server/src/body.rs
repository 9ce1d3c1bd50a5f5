//! Request body decompression.
//!
//! Git compresses large upload-pack requests with gzip. The decoder works
//! chunk by chunk so a body never has to be held in memory compressed and
//! decompressed at the same time.

use crate::error::ServerError;
use axum::http::{header, HeaderMap};
use bytes::Bytes;
use flate2::write::{GzDecoder, ZlibDecoder};
use std::io::{self, Write};

/// Streaming decoder selected by `Content-Encoding`.
pub enum BodyDecoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl BodyDecoder {
    /// Picks the decoder for the request's `Content-Encoding`.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ServerError> {
        let Some(value) = headers.get(header::CONTENT_ENCODING) else {
            return Ok(BodyDecoder::Identity);
        };

        let encoding = value
            .to_str()
            .map_err(|_| ServerError::UnsupportedEncoding("<non-ascii>".to_string()))?
            .trim()
            .to_ascii_lowercase();

        match encoding.as_str() {
            "" | "identity" => Ok(BodyDecoder::Identity),
            "gzip" | "x-gzip" => Ok(BodyDecoder::Gzip(GzDecoder::new(Vec::new()))),
            "deflate" => Ok(BodyDecoder::Deflate(ZlibDecoder::new(Vec::new()))),
            other => Err(ServerError::UnsupportedEncoding(other.to_string())),
        }
    }

    /// Feeds one compressed chunk, returning whatever it decoded to.
    pub fn decode(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        match self {
            BodyDecoder::Identity => Ok(Bytes::copy_from_slice(chunk)),
            BodyDecoder::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                Ok(take(decoder.get_mut()))
            }
            BodyDecoder::Deflate(decoder) => {
                decoder.write_all(chunk)?;
                Ok(take(decoder.get_mut()))
            }
        }
    }

    /// Flushes the decoder at end of input.
    pub fn finish(&mut self) -> io::Result<Bytes> {
        match self {
            BodyDecoder::Identity => Ok(Bytes::new()),
            BodyDecoder::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(take(decoder.get_mut()))
            }
            BodyDecoder::Deflate(decoder) => {
                decoder.try_finish()?;
                Ok(take(decoder.get_mut()))
            }
        }
    }
}

fn take(buf: &mut Vec<u8>) -> Bytes {
    Bytes::from(std::mem::take(buf))
}
