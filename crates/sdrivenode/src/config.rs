//! Optional TOML configuration shared by both node binaries.
//!
//! ```toml
//! [ledger]
//! listen = "0.0.0.0:9000"
//! cert_out = "ledger.der"
//!
//! [ledger.criteria.standard]
//! weight_traffic = 2
//! weight_speed = 5
//! # ...
//! alpha = 2
//! beta = 3
//!
//! [owner]
//! owner_id = "owner-1"
//! peer = "127.0.0.1:9000"
//! ledger_cert = "ledger.der"
//! key_store = "~/.securedrive/keys"
//!
//! [retry]
//! attempts = 4
//! timeout_ms = 10000
//! backoff_ms = 250
//! ```
//!
//! Command-line flags take precedence over anything read here.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sdrivealgo::CriteriaWeights;
use serde::Deserialize;
use tracing::debug;

use crate::retry::RetryPolicy;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub ledger: LedgerSection,
    pub owner: OwnerSection,
    pub retry: RetrySection,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSection {
    pub listen: Option<SocketAddr>,
    pub cert_out: Option<PathBuf>,
    /// Named weight sets a `PremiumReq` can refer to.
    pub criteria: BTreeMap<String, CriteriaWeights>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OwnerSection {
    pub owner_id: Option<String>,
    pub peer: Option<SocketAddr>,
    pub ledger_cert: Option<PathBuf>,
    pub key_store: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub attempts: u32,
    pub timeout_ms: u64,
    pub backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let p = RetryPolicy::default();
        Self {
            attempts: p.attempts,
            timeout_ms: p.timeout.as_millis() as u64,
            backoff_ms: p.backoff.as_millis() as u64,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            timeout: Duration::from_millis(self.timeout_ms),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    // ~/.securedrive/node.toml
    dirs_next::home_dir().map(|h| h.join(".securedrive").join("node.toml"))
}

/// Default location of the owner's key store when neither flag nor file sets one.
pub fn default_key_store_dir() -> Option<PathBuf> {
    dirs_next::home_dir().map(|h| h.join(".securedrive").join("keys"))
}

pub fn resolve_config_path(cli_path: &Option<PathBuf>) -> Option<PathBuf> {
    if let Some(p) = cli_path {
        return Some(p.clone());
    }
    default_config_path()
}

impl NodeConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid node configuration")
    }

    /// Load the file named on the command line, or the default file if it
    /// exists. A missing explicit file is an error; a missing default file
    /// yields the built-in defaults.
    pub fn load(cli_path: &Option<PathBuf>) -> Result<Self> {
        let Some(path) = resolve_config_path(cli_path) else {
            return Ok(Self::default());
        };
        if cli_path.is_none() && !path.exists() {
            debug!(path = %path.display(), "no node configuration, using defaults");
            return Ok(Self::default());
        }
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("Read node config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Parse node config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = NodeConfig::parse("").unwrap();
        assert_eq!(cfg, NodeConfig::default());
        assert_eq!(cfg.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn full_file() {
        let cfg = NodeConfig::parse(
            r#"
            [ledger]
            listen = "127.0.0.1:9100"

            [ledger.criteria.standard]
            weight_traffic = 2
            weight_speed = 5
            weight_acceleration = 3
            weight_braking = 4
            weight_distance = 2
            weight_zone = 3
            weight_time = 1
            alpha = 2
            beta = 3

            [owner]
            owner_id = "owner-1"
            peer = "127.0.0.1:9100"

            [retry]
            attempts = 2
            timeout_ms = 500
            backoff_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ledger.listen, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(cfg.ledger.criteria["standard"].beta, 3);
        assert_eq!(cfg.owner.owner_id.as_deref(), Some("owner-1"));
        assert_eq!(cfg.retry.policy().timeout, Duration::from_millis(500));
    }

    #[test]
    fn criteria_fields_default_to_zero() {
        let cfg = NodeConfig::parse("[ledger.criteria.flat]\nalpha = 1\n").unwrap();
        let w = cfg.ledger.criteria["flat"];
        assert_eq!(w.alpha, 1);
        assert_eq!(w.beta, 0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(NodeConfig::parse("[ledger]\nlisten_addr = \"x\"\n").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Some(dir.path().join("nope.toml"));
        assert!(NodeConfig::load(&missing).is_err());
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[retry]\nattempts = 9\n").unwrap();
        let cfg = NodeConfig::load(&Some(path)).unwrap();
        assert_eq!(cfg.retry.attempts, 9);
        assert_eq!(cfg.retry.backoff_ms, 250);
    }
}
