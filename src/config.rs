use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique session identifier; generated when empty
    #[serde(default)]
    pub session_id: String,

    /// Strategy label recorded in the session
    pub strategy: String,

    /// Directory holding the audit log, keys and snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Snapshot storage location; defaults to `<data_dir>/snapshots`
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    /// Audit signing key file; defaults to `<data_dir>/signing.key`
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,

    /// Starting balances per asset
    pub initial_capital: BTreeMap<String, Decimal>,

    pub session: SessionConfig,

    pub governance: GovernanceConfig,

    /// Operator token settings (optional; commands are disabled without it)
    #[serde(default)]
    pub operator: Option<OperatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_retries")]
    pub max_transaction_retries: u32,
    #[serde(default = "default_idempotency_timeout")]
    pub idempotency_timeout_secs: u64,
    #[serde(default = "default_effect_timeout")]
    pub effect_timeout_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Mutations wait for an operator when true
    #[serde(default = "default_approval_required")]
    pub approval_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// HMAC secret for bearer tokens
    pub token_secret: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_retries() -> u32 {
    3
}

fn default_idempotency_timeout() -> u64 {
    300
}

fn default_effect_timeout() -> u64 {
    30
}

fn default_heartbeat() -> u64 {
    30
}

fn default_approval_required() -> bool {
    true
}

fn default_token_ttl() -> i64 {
    3600
}

impl Config {
    /// Snapshot storage directory, explicit or derived from `data_dir`.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("snapshots"))
    }

    /// Signing key file, explicit or derived from `data_dir`.
    pub fn signing_key_path(&self) -> PathBuf {
        self.signing_key_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("signing.key"))
    }

    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        if config.session_id.is_empty() {
            config.session_id = uuid::Uuid::new_v4().to_string();
        }
        info!(session_id = %config.session_id, strategy = %config.strategy, "configuration loaded");
        Ok(config)
    }

    /// Default paper-trading configuration
    pub fn default_local(strategy: &str) -> Self {
        let mut initial_capital = BTreeMap::new();
        initial_capital.insert("USDC".to_string(), dec!(10000));
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            strategy: strategy.to_string(),
            data_dir: default_data_dir(),
            snapshot_dir: None,
            signing_key_path: None,
            initial_capital,
            session: SessionConfig {
                max_transaction_retries: default_max_retries(),
                idempotency_timeout_secs: default_idempotency_timeout(),
                effect_timeout_secs: default_effect_timeout(),
                heartbeat_secs: default_heartbeat(),
            },
            governance: GovernanceConfig {
                approval_required: default_approval_required(),
            },
            operator: None,
        }
    }
}
