//! Smart HTTP services.

use crate::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// The two stateless-rpc services a git client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// `git-upload-pack`: fetch and clone.
    UploadPack,
    /// `git-receive-pack`: push.
    ReceivePack,
}

impl Service {
    /// Name with the `git-` prefix, as used in URLs and `# service=` lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    /// Bare plumbing verb, as passed to the `git` dispatcher.
    pub fn verb(&self) -> &'static str {
        match self {
            Service::UploadPack => "upload-pack",
            Service::ReceivePack => "receive-pack",
        }
    }

    /// Content type of the `info/refs` response.
    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type of the stateless-rpc POST response.
    pub fn result_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

impl FromStr for Service {
    type Err = ProtocolError;

    /// Accepts both `git-upload-pack` and `upload-pack`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("git-").unwrap_or(s) {
            "upload-pack" => Ok(Service::UploadPack),
            "receive-pack" => Ok(Service::ReceivePack),
            _ => Err(ProtocolError::UnknownService(s.to_string())),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service() {
        assert_eq!(
            "git-upload-pack".parse::<Service>().unwrap(),
            Service::UploadPack
        );
        assert_eq!(
            "receive-pack".parse::<Service>().unwrap(),
            Service::ReceivePack
        );
        assert!("git-upload-archive".parse::<Service>().is_err());
        assert!("".parse::<Service>().is_err());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            Service::ReceivePack.result_content_type(),
            "application/x-git-receive-pack-result"
        );
        assert_eq!(
            Service::UploadPack.advertisement_content_type(),
            "application/x-git-upload-pack-advertisement"
        );
    }
}
