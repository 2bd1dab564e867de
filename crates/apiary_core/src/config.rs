//! Server configuration stored at `~/.apiary/config.json`.
//!
//! Every field has a default, so a missing or partial file always yields a
//! runnable server. `validate` applies the protocol floors (a gossip
//! interval below one second is clamped, not rejected) and rejects values
//! that cannot possibly work, like an unparseable listen address.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::protocol;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiaryConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: String,

    // Authentication timing, in seconds.
    pub challenge_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub max_clock_skew_secs: u64,

    // Device proof.
    pub device_proof_required: bool,
    pub device_proof_max_age_secs: u64,

    // Gossip federation.
    pub gossip_peers: Vec<String>,
    pub gossip_secret: Option<String>,
    pub gossip_interval_secs: u64,
    pub gossip_http_timeout_secs: u64,

    /// Message log location. `None` keeps the log in memory; a path selects
    /// the durable SQLite backend.
    pub db_path: Option<PathBuf>,

    /// Log directory override. `None` uses `~/.apiary/logs`.
    pub log_dir: Option<PathBuf>,
}

impl Default for ApiaryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7410".to_string(),
            challenge_ttl_secs: (protocol::CHALLENGE_TTL_MS / 1000) as u64,
            session_ttl_secs: (protocol::SESSION_TTL_MS / 1000) as u64,
            max_clock_skew_secs: (protocol::MAX_CLOCK_SKEW_MS / 1000) as u64,
            device_proof_required: false,
            device_proof_max_age_secs: (protocol::DEVICE_PROOF_MAX_AGE_MS / 1000) as u64,
            gossip_peers: Vec::new(),
            gossip_secret: None,
            gossip_interval_secs: protocol::GOSSIP_INTERVAL_SECS,
            gossip_http_timeout_secs: protocol::GOSSIP_HTTP_TIMEOUT_SECS,
            db_path: None,
            log_dir: None,
        }
    }
}

impl ApiaryConfig {
    /// Returns the base directory: `~/.apiary/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".apiary"))
    }

    /// Returns the default config file path: `~/.apiary/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the effective logs directory, honoring the override.
    pub fn logs_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::base_dir()?.join("logs")),
        }
    }

    /// Loads config from the default location, creating a default file on
    /// first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        Self::load_from_path(&path)
    }

    /// Loads config from a specific file path, or creates a default file
    /// there if missing.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Saves config to a specific file path, pretty-printed.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Parses the configured listen address.
    pub fn listen_socket(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("Invalid listen_addr: {}", self.listen_addr))
    }

    /// Applies protocol floors and checks the fields that have to be sane
    /// before the server can start. Peer URLs are normalized in place
    /// (trailing slashes stripped) so the gossip engine can join paths onto
    /// them directly.
    pub fn validate(&mut self) -> Result<()> {
        self.listen_socket()?;

        if self.gossip_interval_secs < protocol::GOSSIP_MIN_INTERVAL_SECS {
            warn!(
                "gossip_interval_secs {} below floor, clamping to {}",
                self.gossip_interval_secs,
                protocol::GOSSIP_MIN_INTERVAL_SECS
            );
            self.gossip_interval_secs = protocol::GOSSIP_MIN_INTERVAL_SECS;
        }
        if self.gossip_http_timeout_secs == 0 {
            warn!("gossip_http_timeout_secs 0 is not allowed, clamping to 1");
            self.gossip_http_timeout_secs = 1;
        }

        for peer in &mut self.gossip_peers {
            let parsed =
                Url::parse(peer).with_context(|| format!("Invalid gossip peer URL: {peer}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("Gossip peer URL must be http or https: {peer}");
            }
            while peer.ends_with('/') {
                peer.pop();
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ApiaryConfig::default();
        assert_eq!(config.challenge_ttl_secs, 120);
        assert_eq!(config.session_ttl_secs, 86_400);
        assert_eq!(config.max_clock_skew_secs, 120);
        assert_eq!(config.device_proof_max_age_secs, 300);
        assert_eq!(config.gossip_interval_secs, 5);
        assert!(!config.device_proof_required);
        assert!(config.gossip_peers.is_empty());
        assert!(config.db_path.is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = ApiaryConfig::default();
        config.listen_addr = "0.0.0.0:9000".to_string();
        config.gossip_peers = vec!["http://peer-a:7410".to_string()];
        config.gossip_secret = Some("s3cret".to_string());
        config.save_to_path(&path).unwrap();

        let loaded = ApiaryConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.listen_addr, "0.0.0.0:9000");
        assert_eq!(loaded.gossip_peers, vec!["http://peer-a:7410"]);
        assert_eq!(loaded.gossip_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn missing_file_creates_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        assert!(!path.exists());

        let config = ApiaryConfig::load_from_path(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.listen_addr, ApiaryConfig::default().listen_addr);
    }

    #[test]
    fn corrupt_file_errors_with_context() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = ApiaryConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"listen_addr": "127.0.0.1:8000"}"#).unwrap();

        let config = ApiaryConfig::load_from_path(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8000");
        assert_eq!(config.challenge_ttl_secs, 120);
    }

    #[test]
    fn validate_clamps_gossip_interval() {
        let mut config = ApiaryConfig::default();
        config.gossip_interval_secs = 0;
        config.gossip_http_timeout_secs = 0;
        config.validate().unwrap();
        assert_eq!(config.gossip_interval_secs, 1);
        assert_eq!(config.gossip_http_timeout_secs, 1);
    }

    #[test]
    fn validate_normalizes_peer_urls() {
        let mut config = ApiaryConfig::default();
        config.gossip_peers = vec!["http://peer-a:7410/".to_string()];
        config.validate().unwrap();
        assert_eq!(config.gossip_peers, vec!["http://peer-a:7410"]);
    }

    #[test]
    fn validate_rejects_bad_listen_addr() {
        let mut config = ApiaryConfig::default();
        config.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_peer_url() {
        let mut config = ApiaryConfig::default();
        config.gossip_peers = vec!["peer-a:7410".to_string()];
        assert!(config.validate().is_err());
    }
}
