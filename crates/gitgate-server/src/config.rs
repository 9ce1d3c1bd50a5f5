//! Server configuration.

use crate::observability::LogFormat;
use crate::process::Invocation;
use crate::session::{SessionConfig, DEFAULT_MAX_HEADER_BYTES};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Static HTTP Basic credentials accepted by the bundled binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

/// Configuration for a gitgate server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// Directory holding the repositories.
    pub repo_root: PathBuf,
    /// Create missing repositories on info and service requests.
    pub auto_create: bool,
    /// Realm in `WWW-Authenticate` challenges.
    pub realm: String,
    /// How git services are invoked.
    pub invocation: Invocation,
    /// Bytes buffered at most while classifying a pack request.
    pub max_header_bytes: usize,
    /// Limit on the authorizer, in seconds.
    pub auth_timeout_secs: Option<u64>,
    /// Limit on listener decisions, in seconds.
    pub decision_timeout_secs: Option<u64>,
    /// Log level.
    pub log_level: String,
    /// Log format.
    pub log_format: LogFormat,
    /// Require these credentials on every request.
    pub basic_auth: Option<BasicAuthConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            repo_root: PathBuf::from("./repos"),
            auto_create: false,
            realm: "gitgate".to_string(),
            invocation: Invocation::default(),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            auth_timeout_secs: None,
            decision_timeout_secs: None,
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            basic_auth: None,
        }
    }
}

impl ServerConfig {
    /// Reads a YAML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks what serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_header_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_header_bytes must be greater than zero".to_string(),
            ));
        }
        if self.auth_timeout_secs == Some(0) || self.decision_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "timeouts must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Option<Duration> {
        self.auth_timeout_secs.map(Duration::from_secs)
    }

    pub fn decision_timeout(&self) -> Option<Duration> {
        self.decision_timeout_secs.map(Duration::from_secs)
    }

    /// Limits applied to each pack session.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_header_bytes: self.max_header_bytes,
            decision_timeout: self.decision_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen: 0.0.0.0:9418\nauto_create: true\ninvocation: dashed\nlog_format: json\ndecision_timeout_secs: 30"
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9418".parse().unwrap());
        assert!(config.auto_create);
        assert_eq!(config.invocation, Invocation::Dashed);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.decision_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.realm, "gitgate");
        assert_eq!(config.max_header_bytes, DEFAULT_MAX_HEADER_BYTES);
        assert!(config.auth_timeout().is_none());
    }

    #[test]
    fn test_basic_auth_section() {
        let config: ServerConfig =
            serde_yaml::from_str("basic_auth:\n  username: git\n  password: hunter2\n").unwrap();
        assert_eq!(config.basic_auth.unwrap().username, "git");
    }

    #[test]
    fn test_invalid_values() {
        let config = ServerConfig {
            max_header_bytes: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            auth_timeout_secs: Some(0),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ServerConfig::load("/nonexistent/gitgate.yaml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
