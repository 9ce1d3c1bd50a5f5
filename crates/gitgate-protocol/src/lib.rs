//! Git smart HTTP wire format for gitgate.
//!
//! This crate holds the pieces of the git transport that are pure byte
//! manipulation: pkt-line framing, the sideband progress channel, and the
//! sniffing of the first command section of an upload-pack or receive-pack
//! request body. Nothing in here spawns processes or touches the network.

mod error;
mod header;
mod pktline;
mod service;
mod sideband;

pub use error::ProtocolError;
pub use header::{sniff, ReceivePackHeader, RefKind, RefUpdate, Sniff, UploadPackHeader};
pub use pktline::{
    decode_pkt_len, encode_pkt_line, next_pkt_line, service_announcement, split_pkt_lines,
    PktLine, FLUSH_PKT, MAX_PKT_LEN,
};
pub use service::Service;
pub use sideband::{encode_sideband, fatal, progress, Channel};

/// Result type for wire protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
