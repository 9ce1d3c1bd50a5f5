//! Git pkt-line format implementation.
//!
//! Every line of the smart protocol is prefixed with a 4-character lowercase
//! hex length that counts itself plus the payload. `0000` is the flush
//! packet; `0001` and `0002` are the protocol v2 delimiter and response-end
//! markers.

use crate::{ProtocolError, Result, Service};

/// The flush packet.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// Largest value the length prefix may carry.
pub const MAX_PKT_LEN: usize = 0xffff;

const PREFIX_LEN: usize = 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Data(data) => encode_pkt_line(data),
            Self::Flush => Ok(FLUSH_PKT.to_vec()),
            Self::Delimiter => Ok(b"0001".to_vec()),
            Self::ResponseEnd => Ok(b"0002".to_vec()),
        }
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// Frames `payload` as a single data pkt-line.
///
/// Fails with [`ProtocolError::PayloadTooLarge`] rather than truncating when
/// the framed length would not fit in four hex digits.
pub fn encode_pkt_line(payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload.len() + PREFIX_LEN;
    if len > MAX_PKT_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(format!("{:04x}", len).as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parses a 4-byte length prefix.
///
/// Returns the full frame length (prefix included), or 0 for the special
/// packets `0000`, `0001` and `0002`.
pub fn decode_pkt_len(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < PREFIX_LEN {
        return Err(ProtocolError::InvalidPktLine(
            "length prefix is shorter than 4 bytes".to_string(),
        ));
    }

    let digits = &prefix[..PREFIX_LEN];
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ProtocolError::InvalidPktLine(format!(
            "non-hex length prefix {:?}",
            String::from_utf8_lossy(digits)
        )));
    }

    let mut raw = [0u8; 2];
    hex::decode_to_slice(digits, &mut raw)
        .map_err(|e| ProtocolError::InvalidPktLine(e.to_string()))?;
    let len = u16::from_be_bytes(raw) as usize;

    match len {
        0..=2 => Ok(0),
        3 => Err(ProtocolError::InvalidPktLine("length too small".to_string())),
        n => Ok(n),
    }
}

fn special(prefix: &[u8]) -> Option<PktLine> {
    match prefix {
        b"0000" => Some(PktLine::Flush),
        b"0001" => Some(PktLine::Delimiter),
        b"0002" => Some(PktLine::ResponseEnd),
        _ => None,
    }
}

/// Reads one packet off the front of `buf`.
///
/// Returns the packet and the bytes it occupies, or `None` when `buf` does
/// not yet hold a complete packet.
pub fn next_pkt_line(buf: &[u8]) -> Result<Option<(PktLine, usize)>> {
    if buf.len() < PREFIX_LEN {
        return Ok(None);
    }

    let prefix = &buf[..PREFIX_LEN];
    let len = decode_pkt_len(prefix)?;
    if len == 0 {
        return Ok(special(prefix).map(|pkt| (pkt, PREFIX_LEN)));
    }
    if buf.len() < len {
        return Ok(None);
    }

    Ok(Some((PktLine::Data(buf[PREFIX_LEN..len].to_vec()), len)))
}

/// Slices as many complete packets as possible off the front of `buf`.
///
/// Returns the packets and the number of bytes they occupy. A trailing
/// partial packet is left for the caller to complete with more input.
pub fn split_pkt_lines(buf: &[u8]) -> Result<(Vec<PktLine>, usize)> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while let Some((pkt, used)) = next_pkt_line(&buf[pos..])? {
        packets.push(pkt);
        pos += used;
    }

    Ok((packets, pos))
}

/// Builds the preamble of a ref advertisement response:
/// `# service=git-<service>\n` as a pkt-line followed by a flush.
pub fn service_announcement(service: Service) -> Vec<u8> {
    let line = format!("# service={}\n", service.as_str());
    // The announcement is a few dozen bytes and always fits in one frame.
    let mut out = encode_pkt_line(line.as_bytes()).unwrap_or_default();
    out.extend_from_slice(FLUSH_PKT);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_counts_prefix() {
        assert_eq!(encode_pkt_line(b"hello\n").unwrap(), b"000ahello\n");
        assert_eq!(encode_pkt_line(b"").unwrap(), b"0004");
    }

    #[test]
    fn test_encode_lowercase_hex() {
        let payload = vec![b'x'; 0xab - 4];
        let encoded = encode_pkt_line(&payload).unwrap();
        assert_eq!(&encoded[..4], b"00ab");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PKT_LEN - 3];
        assert!(matches!(
            encode_pkt_line(&payload),
            Err(ProtocolError::PayloadTooLarge(_))
        ));

        let fits = vec![0u8; MAX_PKT_LEN - 4];
        assert_eq!(&encode_pkt_line(&fits).unwrap()[..4], b"ffff");
    }

    #[test]
    fn test_special_packets() {
        assert_eq!(PktLine::Flush.encode().unwrap(), b"0000");
        assert_eq!(PktLine::Delimiter.encode().unwrap(), b"0001");
        assert_eq!(PktLine::ResponseEnd.encode().unwrap(), b"0002");
    }

    #[test]
    fn test_decode_pkt_len() {
        assert_eq!(decode_pkt_len(b"000a").unwrap(), 10);
        assert_eq!(decode_pkt_len(b"FFFF").unwrap(), 0xffff);
        assert_eq!(decode_pkt_len(b"0000").unwrap(), 0);
        assert!(decode_pkt_len(b"0003").is_err());
        assert!(decode_pkt_len(b"zz01").is_err());
        assert!(decode_pkt_len(b"00").is_err());
    }

    #[test]
    fn test_split_leaves_partial_frame() {
        let mut buf = encode_pkt_line(b"want abc\n").unwrap();
        buf.extend_from_slice(FLUSH_PKT);
        buf.extend_from_slice(b"0010par");

        let (packets, consumed) = split_pkt_lines(&buf).unwrap();
        assert_eq!(
            packets,
            vec![PktLine::Data(b"want abc\n".to_vec()), PktLine::Flush]
        );
        assert_eq!(consumed, buf.len() - 7);
    }

    #[test]
    fn test_split_rejects_bad_prefix() {
        assert!(split_pkt_lines(b"0009ok\nxyg!!!").is_err());
        // A short tail after a complete frame is only partial input.
        assert_eq!(split_pkt_lines(b"0009ok\nxyz!").unwrap().1, 9);
    }

    #[test]
    fn test_next_pkt_line() {
        assert_eq!(
            next_pkt_line(b"0008abcdrest").unwrap(),
            Some((PktLine::Data(b"abcd".to_vec()), 8))
        );
        assert_eq!(
            next_pkt_line(b"0001").unwrap(),
            Some((PktLine::Delimiter, 4))
        );
        assert_eq!(next_pkt_line(b"0008ab").unwrap(), None);
        assert_eq!(next_pkt_line(b"00").unwrap(), None);
        assert!(next_pkt_line(b"0003").is_err());
    }

    #[test]
    fn test_service_announcement() {
        let preamble = service_announcement(Service::UploadPack);
        assert_eq!(preamble, b"001e# service=git-upload-pack\n0000");
    }

    #[test]
    fn test_data_of_special_packets() {
        assert_eq!(PktLine::Data(vec![0xff]).data(), Some(&[0xff][..]));
        assert!(PktLine::Flush.data().is_none());
    }
}
