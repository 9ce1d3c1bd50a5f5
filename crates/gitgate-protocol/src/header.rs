//! Sniffing of request headers.
//!
//! Before a pack exchange is handed to git, the server looks at the first
//! command section of the request body to learn what the client is about
//! to do: which refs a push updates, or which commit a fetch wants. The
//! body is tokenised on pkt-line boundaries and each complete line is
//! matched against the line shapes of the requested service. Lines that do
//! not match are skipped; only broken framing is an error.

use crate::pktline::{next_pkt_line, PktLine};
use crate::{Result, Service};

/// Namespace of an updated ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// `refs/heads/*`
    Heads,
    /// `refs/tags/*`
    Tags,
    /// Anything else, such as `refs/notes/*`.
    Other,
}

/// One `<old> <new> <ref>` command of a receive-pack request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Object id the ref pointed at (all zeros when creating).
    pub old: String,
    /// Object id the ref will point at (all zeros when deleting).
    pub new: String,
    /// Namespace of the ref.
    pub ref_kind: RefKind,
    /// Ref name with the `refs/heads/` or `refs/tags/` prefix removed. Other
    /// refs keep their full name.
    pub name: String,
}

/// Commands found in a receive-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivePackHeader {
    /// Ref updates in request order.
    pub updates: Vec<RefUpdate>,
    /// Capabilities sent after the NUL of the first command.
    pub capabilities: Vec<String>,
}

impl ReceivePackHeader {
    /// The first branch or tag update, which classifies the request.
    pub fn first(&self) -> Option<&RefUpdate> {
        self.updates
            .iter()
            .find(|update| update.ref_kind != RefKind::Other)
    }
}

/// Wants found in an upload-pack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPackHeader {
    /// Wanted object ids in request order.
    pub wants: Vec<String>,
    /// Capabilities sent on the first want line.
    pub capabilities: Vec<String>,
}

impl UploadPackHeader {
    /// The commit of the first want line.
    pub fn commit(&self) -> Option<&str> {
        self.wants.first().map(String::as_str)
    }
}

/// Outcome of sniffing a (possibly partial) request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    /// The first command section has not been fully received yet.
    Incomplete,
    /// A receive-pack request with at least one branch or tag update.
    ReceivePack(ReceivePackHeader),
    /// An upload-pack request.
    UploadPack(UploadPackHeader),
    /// A receive-pack request without any branch or tag update, such as a
    /// bare flush-pkt.
    Empty,
}

/// Sniffs the first command section of `buf`.
///
/// The section ends at the first flush-pkt. While it is still open the
/// result is [`Sniff::Incomplete`], unless `eof` says no more input will
/// arrive, in which case whatever complete lines exist are used.
pub fn sniff(service: Service, buf: &[u8], eof: bool) -> Result<Sniff> {
    let mut lines = Vec::new();
    let mut closed = false;
    let mut pos = 0;

    // Pack data follows the first flush, so stop there rather than
    // framing the rest of the buffer.
    while let Some((pkt, used)) = next_pkt_line(&buf[pos..])? {
        match pkt {
            PktLine::Flush => {
                closed = true;
                break;
            }
            PktLine::Data(line) => lines.push(line),
            PktLine::Delimiter | PktLine::ResponseEnd => {}
        }
        pos += used;
    }

    if !closed && !eof {
        return Ok(Sniff::Incomplete);
    }

    Ok(match service {
        Service::ReceivePack => {
            let header = parse_receive_pack(&lines);
            if header.first().is_none() {
                Sniff::Empty
            } else {
                Sniff::ReceivePack(header)
            }
        }
        Service::UploadPack => Sniff::UploadPack(parse_upload_pack(&lines)),
    })
}

/// Splits a line into its command part and the capability list after NUL.
fn split_capabilities(line: &[u8]) -> (String, Vec<String>) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches('\n');
    match text.split_once('\0') {
        Some((cmd, caps)) => (
            cmd.to_string(),
            caps.split_whitespace().map(str::to_string).collect(),
        ),
        None => (text.to_string(), Vec::new()),
    }
}

fn is_object_id(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_receive_pack(lines: &[Vec<u8>]) -> ReceivePackHeader {
    let mut header = ReceivePackHeader::default();

    for (i, line) in lines.iter().enumerate() {
        let (cmd, caps) = split_capabilities(line);
        if i == 0 {
            header.capabilities = caps;
        }

        let mut tokens = cmd.split(' ');
        let (Some(old), Some(new), Some(refname), None) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            continue;
        };

        if !is_object_id(old) || !is_object_id(new) {
            continue;
        }

        let (ref_kind, name) = if let Some(name) = refname.strip_prefix("refs/heads/") {
            (RefKind::Heads, name)
        } else if let Some(name) = refname.strip_prefix("refs/tags/") {
            (RefKind::Tags, name)
        } else {
            tracing::trace!(refname, "update outside heads and tags");
            (RefKind::Other, refname)
        };

        if name.is_empty() {
            continue;
        }

        header.updates.push(RefUpdate {
            old: old.to_string(),
            new: new.to_string(),
            ref_kind,
            name: name.to_string(),
        });
    }

    header
}

fn parse_upload_pack(lines: &[Vec<u8>]) -> UploadPackHeader {
    let mut header = UploadPackHeader::default();

    for line in lines {
        let (cmd, _) = split_capabilities(line);
        let mut tokens = cmd.split(' ');
        if tokens.next() != Some("want") {
            continue;
        }
        let Some(oid) = tokens.next().filter(|oid| is_object_id(oid)) else {
            continue;
        };

        if header.wants.is_empty() {
            // Capabilities ride on the first want line, space separated.
            header.capabilities = tokens.map(str::to_string).collect();
        }
        header.wants.push(oid.to_string());
    }

    header
}
