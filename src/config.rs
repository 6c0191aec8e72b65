//! Config types and TOML loading.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_BASE_DN: &str = "o=smartdc";
pub const DEFAULT_CHECKPOINT_OBJECTCLASS: &str = "sdcreplcheckpoint";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ldap: LdapConfig,
    pub base_dn: String,
    /// Base DN under which checkpoint records live; defaults to `base_dn`.
    pub checkpoint_dn: Option<String>,
    pub checkpoint_objectclass: String,
    pub poll_interval_ms: u64,
    pub remotes: Vec<RemoteConfig>,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ldap: LdapConfig::default(),
            base_dn: DEFAULT_BASE_DN.to_string(),
            checkpoint_dn: None,
            checkpoint_objectclass: DEFAULT_CHECKPOINT_OBJECTCLASS.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            remotes: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn checkpoint_base(&self) -> &str {
        self.checkpoint_dn.as_deref().unwrap_or(&self.base_dn)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    pub url: String,
    pub bind_dn: String,
    pub bind_credentials: String,
    pub reconnect: ReconnectConfig,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            url: "ldaps://127.0.0.1:636".to_string(),
            bind_dn: "cn=root".to_string(),
            bind_credentials: String::new(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// The local client reconnects forever; these only shape attempt pacing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    /// Cap on a single connect attempt.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub bind_dn: Option<String>,
    #[serde(default)]
    pub bind_credentials: Option<String>,
    /// Acceptance filters, stored verbatim in the checkpoint record.
    #[serde(default)]
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbosity: u8,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbosity: 1,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}
