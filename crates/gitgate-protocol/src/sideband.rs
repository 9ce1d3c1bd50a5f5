//! Sideband multiplexing.
//!
//! With `side-band-64k` negotiated, every pkt-line in a pack response starts
//! with a channel byte: 1 carries pack data, 2 progress text shown by the
//! client as `remote: ...`, and 3 a fatal error message.

use crate::pktline::encode_pkt_line;
use crate::Result;

/// A sideband channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Pack data.
    PackData = 1,
    /// Progress messages.
    Progress = 2,
    /// Fatal error messages.
    Error = 3,
}

/// Frames `payload` on the given channel as a single pkt-line.
pub fn encode_sideband(channel: Channel, payload: &[u8]) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(channel as u8);
    data.extend_from_slice(payload);
    encode_pkt_line(&data)
}

/// Frames a progress message.
pub fn progress(text: &str) -> Result<Vec<u8>> {
    encode_sideband(Channel::Progress, text.as_bytes())
}

/// Frames a fatal error message.
pub fn fatal(text: &str) -> Result<Vec<u8>> {
    encode_sideband(Channel::Error, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_frame() {
        assert_eq!(progress("hello\n").unwrap(), b"000b\x02hello\n");
    }

    #[test]
    fn test_fatal_frame() {
        let frame = fatal("denied").unwrap();
        assert_eq!(&frame[..5], b"000b\x03");
    }

    #[test]
    fn test_channel_byte_counts_toward_limit() {
        let payload = vec![0u8; crate::MAX_PKT_LEN - 4];
        assert!(encode_sideband(Channel::PackData, &payload).is_err());
    }
}
