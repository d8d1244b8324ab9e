//! Configuration management for the Sponsor Relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::U256;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const GWEI: u64 = 1_000_000_000;
/// One year
const MAX_TOP_UP_INTERVAL_HOURS: i64 = 24 * 365;
/// Leases are renewed every third of the TTL; keep that well above the store round trip
const MIN_LOCK_TTL_SECS: u64 = 30;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub topping: ToppingConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// Deployment environment; `development` relaxes the daily top-up limit
    pub environment: String,
    pub health_check_interval_secs: u64,
}

impl RelayerConfig {
    pub fn is_permissive(&self) -> bool {
        self.environment == "development"
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL. Empty selects the in-process lock store.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: u64,
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_interval_ms: u64,
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding the master mnemonic
    pub mnemonic_env: Option<String>,
    /// Environment variable holding a single private key; takes precedence over the mnemonic
    pub private_key_env: Option<String>,
    pub number_of_accounts: u32,
    /// Minimum balance (gwei) for a pool account to be considered funded
    pub min_balance_gwei: u64,
}

impl WalletConfig {
    pub fn min_balance_wei(&self) -> U256 {
        U256::from(self.min_balance_gwei) * U256::from(GWEI)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    pub default_gas: u64,
    pub default_gas_price_gwei: u64,
}

impl GasConfig {
    pub fn default_gas_price_wei(&self) -> U256 {
        U256::from(self.default_gas_price_gwei) * U256::from(GWEI)
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            default_gas: 200_000,
            default_gas_price_gwei: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// How often a waiting caller re-polls the store for a free reservation
    pub poll_interval_ms: u64,
    /// Age after which a held lock is considered abandoned by a dead process
    pub lock_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            lock_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToppingConfig {
    /// Balance (gwei) a topped-up address is brought up to
    pub max_top_gwei: u64,
    /// Minimum shortfall, as a percent of the maximum, that justifies an unforced top-up
    pub min_shortfall_percent: u64,
    pub min_interval_hours: i64,
}

impl ToppingConfig {
    pub fn max_top_wei(&self) -> U256 {
        U256::from(self.max_top_gwei) * U256::from(GWEI)
    }
}

impl Default for ToppingConfig {
    fn default() -> Self {
        Self {
            max_top_gwei: 1_000_000,
            min_shortfall_percent: 75,
            min_interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    pub pool_top_up_enabled: bool,
    pub pool_top_up_interval_secs: u64,
    /// Cron expression (seconds field first); overrides the interval when set
    #[serde(default)]
    pub pool_top_up_cron: Option<String>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            pool_top_up_enabled: true,
            pool_top_up_interval_secs: 3600,
            pool_top_up_cron: None,
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_receipt_poll_ms() -> u64 {
    1000
}

fn default_receipt_timeout() -> u64 {
    120
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("SPONSOR_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        if self.wallet.mnemonic_env.is_none() && self.wallet.private_key_env.is_none() {
            anyhow::bail!("Wallet needs either mnemonic_env or private_key_env");
        }

        if self.wallet.number_of_accounts == 0 {
            anyhow::bail!("wallet.number_of_accounts must be at least 1");
        }

        if self.topping.min_shortfall_percent > 100 {
            anyhow::bail!("topping.min_shortfall_percent must be within 0..=100");
        }

        if !(0..=MAX_TOP_UP_INTERVAL_HOURS).contains(&self.topping.min_interval_hours) {
            anyhow::bail!(
                "topping.min_interval_hours must be within 0..={}",
                MAX_TOP_UP_INTERVAL_HOURS
            );
        }

        // An account at the funded threshold must still qualify for an unforced top-up,
        // otherwise the top-up task can never bring it back into the funded set
        let qualifying_balance = self.topping.max_top_wei()
            * U256::from(100 - self.topping.min_shortfall_percent)
            / U256::from(100);
        if self.wallet.min_balance_wei() > qualifying_balance {
            anyhow::bail!(
                "wallet.min_balance_gwei ({}) is above the balance that triggers a top-up \
                 ({} gwei with topping.max_top_gwei = {} and min_shortfall_percent = {})",
                self.wallet.min_balance_gwei,
                qualifying_balance / U256::from(GWEI),
                self.topping.max_top_gwei,
                self.topping.min_shortfall_percent
            );
        }

        if self.locks.lock_ttl_secs < MIN_LOCK_TTL_SECS {
            anyhow::bail!("locks.lock_ttl_secs must be at least {}", MIN_LOCK_TTL_SECS);
        }

        if let Some(expr) = &self.tasks.pool_top_up_cron {
            cron::Schedule::from_str(expr)
                .with_context(|| format!("Invalid tasks.pool_top_up_cron: {}", expr))?;
        }

        if self.database.url.is_empty() {
            tracing::warn!("No database configured - nonce reservations are process-local");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
