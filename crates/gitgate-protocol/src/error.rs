//! Wire protocol error types.

use thiserror::Error;

/// Errors that can occur while framing or parsing git wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid pkt-line length prefix.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Payload does not fit in a single pkt-line.
    #[error("pkt-line payload of {0} bytes exceeds the 65531 byte limit")]
    PayloadTooLarge(usize),

    /// Unknown or unsupported service name.
    #[error("unsupported service: {0}")]
    UnknownService(String),
}
