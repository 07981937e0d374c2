//! Typed settings for the Wager ledger service.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `WAGER__SECTION__KEY` environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Path probed when no explicit config file is supplied.
pub const DEFAULT_CONFIG_PATH: &str = "config/wager.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub reconciliation: ReconciliationConfig,
    pub http: HttpConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// How long a writer waits for the account lock before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/wager.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// What to persist when a `lose` wager exceeds the available balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Keep a terminal rejected record so replays of the id stay rejected.
    #[default]
    Persist,
    /// Roll everything back; a later retry of the same id is treated as new.
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Account targeted by requests that do not carry their own key.
    pub account_key: String,
    pub rejections: RejectionPolicy,
    /// Accepted `Source-Type` tags. Empty accepts any tag.
    pub allowed_sources: Vec<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            account_key: "1".to_string(),
            rejections: RejectionPolicy::default(),
            allowed_sources: vec!["game".into(), "server".into(), "payment".into()],
        }
    }
}

impl LedgerConfig {
    pub fn source_allowed(&self, source: &str) -> bool {
        self.allowed_sources.is_empty() || self.allowed_sources.iter().any(|s| s == source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Number of most recent transactions reversed per tick.
    pub window: usize,
    /// Accounts to reconcile. Empty means the ledger's default account.
    pub account_keys: Vec<String>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            window: 10,
            account_keys: Vec::new(),
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    /// When set, logs are also written to a daily rolling file here.
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (or [`DEFAULT_CONFIG_PATH`] if present)
    /// layered under environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_PATH).required(false));
            }
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("WAGER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration sources")?;
        let config: Self = settings
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.account_key.trim().is_empty() {
            bail!("ledger.account_key must not be empty");
        }
        if self.reconciliation.enabled {
            if self.reconciliation.interval_secs == 0 {
                bail!("reconciliation.interval_secs must be greater than zero");
            }
            if self.reconciliation.window == 0 {
                bail!("reconciliation.window must be greater than zero");
            }
        }
        Ok(())
    }

    /// Accounts the reconciliation scheduler should cover.
    pub fn reconciled_accounts(&self) -> Vec<String> {
        if self.reconciliation.account_keys.is_empty() {
            vec![self.ledger.account_key.clone()]
        } else {
            self.reconciliation.account_keys.clone()
        }
    }
}
