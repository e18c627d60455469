//! Aggregated configuration.
//!
//! Every component owns its config struct with defaults; this module just
//! gathers them so a deployment can be described by one JSON file:
//!
//! ```json
//! {
//!   "server":    { "bind_addr": "0.0.0.0:9090" },
//!   "conflicts": { "capacity": 1000 },
//!   "audit_log": "/var/lib/concord/audit.jsonl"
//! }
//! ```
//!
//! Missing sections and fields fall back to their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditConfig, ReplayConfig};
use crate::client::ClientConfig;
use crate::conflict::ConflictStoreConfig;
use crate::divergence::{DiffLimits, HashChannelConfig};
use crate::server::ServerConfig;
use crate::upgrade::UpgradeConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcordConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub conflicts: ConflictStoreConfig,
    pub diff: DiffLimits,
    pub hash_channel: HashChannelConfig,
    pub upgrade: UpgradeConfig,
    pub audit: AuditConfig,
    pub replay: ReplayConfig,
    /// JSONL file the server's audit trail is appended to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
}

impl ConcordConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.server.limits;
        if limits.max_message_bytes == 0 || limits.max_id_len == 0 || limits.max_doc_id_len == 0 {
            return Err(ConfigError::Invalid("message limits must be positive".into()));
        }
        if self.server.session_queue_capacity == 0 || self.client.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be positive".into()));
        }
        if self.client.backoff_base_ms > self.client.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff base {} ms exceeds cap {} ms",
                self.client.backoff_base_ms, self.client.backoff_max_ms
            )));
        }
        if self.server.server_id.is_empty() {
            return Err(ConfigError::Invalid("server id must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_is_default() {
        let config = ConcordConfig::from_json_str("{}").unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.diff, DiffLimits::default());
        assert!(config.audit_log.is_none());
    }

    #[test]
    fn test_partial_override() {
        let config = ConcordConfig::from_json_str(
            r#"{"server": {"bind_addr": "0.0.0.0:7000"}, "audit_log": "/tmp/a.jsonl"}"#,
        )
        .unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.server.session_queue_capacity, 256);
        assert_eq!(config.audit_log, Some(PathBuf::from("/tmp/a.jsonl")));
    }

    #[test]
    fn test_rejects_invalid() {
        let err = ConcordConfig::from_json_str(r#"{"client": {"queue_capacity": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(matches!(ConcordConfig::from_json_str("[").unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"server_id": "hub"}}}}"#).unwrap();
        let config = ConcordConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.server.server_id, "hub");

        let missing = ConcordConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
