//! Configuration management for the refill monitor
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::state::RefillPhase;

use anyhow::{Context, Result};
use ethers::types::Address;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Per-phase overrides of the polling catalog, keyed by phase name
    #[serde(default)]
    pub phases: HashMap<String, PhaseOverride>,
    /// Absent means snapshots are only kept in memory
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub chains: ChainsConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub explorer: ExplorerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub reconcile_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub success_grace_secs: u64,
    pub failure_grace_secs: u64,
    pub max_failures: u32,
    pub max_backoff_secs: u64,
    pub stale_after_secs: u64,
    pub recovery_window_blocks: u64,
    pub max_log_range: u64,
    pub extraction_attempts: u32,
    pub block_poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            sync_interval_secs: 30,
            success_grace_secs: 30,
            failure_grace_secs: 60,
            max_failures: 5,
            max_backoff_secs: 60,
            stale_after_secs: 120,
            recovery_window_blocks: 5000,
            max_log_range: 1000,
            extraction_attempts: 3,
            block_poll_interval_ms: 2000,
        }
    }
}

impl MonitorConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn success_grace(&self) -> Duration {
        Duration::from_secs(self.success_grace_secs)
    }

    pub fn failure_grace(&self) -> Duration {
        Duration::from_secs(self.failure_grace_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseOverride {
    pub initial_delay_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
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

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainsConfig {
    /// Chain hosting the faucet contract
    pub local: ChainConfig,
    /// Chain hosting the volatility helper contract
    pub remote: ChainConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub contract_address: String,
}

impl ChainConfig {
    pub fn address(&self) -> Result<Address> {
        self.contract_address
            .parse()
            .with_context(|| format!("Invalid contract address for chain {}", self.name))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "FAUCET_OPERATOR_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExplorerConfig {
    pub base_url: Option<String>,
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("REFILL_MONITOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    /// Load settings from a specific file
    pub fn from_path(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        for chain in [&self.chains.local, &self.chains.remote] {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
            chain.address()?;
        }

        for (name, phase) in &self.phases {
            name.parse::<RefillPhase>()
                .map_err(|_| anyhow::anyhow!("Unknown phase in [phases]: {}", name))?;
            if phase.max_attempts == Some(0) {
                anyhow::bail!("Phase {} must allow at least one attempt", name);
            }
        }

        if self.monitor.max_log_range == 0 {
            anyhow::bail!("monitor.max_log_range must be positive");
        }

        Ok(())
    }
}

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASE: &str = r#"
[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chains.local]
chain_id = 10143
name = "monad-testnet"
rpc_urls = ["${REFILL_TEST_RPC}"]
contract_address = "0x00000000000000000000000000000000000000f1"

[chains.remote]
chain_id = 43113
name = "avalanche-fuji"
rpc_urls = ["https://api.avax-test.network/ext/bc/C/rpc"]
contract_address = "0x00000000000000000000000000000000000000a2"
"#;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", body).unwrap();
        f
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_with_defaults() {
        env::set_var("REFILL_TEST_RPC", "https://testnet-rpc.monad.xyz");
        let f = write_config(BASE);

        let settings = Settings::from_path(f.path()).unwrap();
        assert_eq!(settings.chains.local.rpc_urls[0], "https://testnet-rpc.monad.xyz");
        assert_eq!(settings.monitor.reconcile_interval_secs, 60);
        assert_eq!(settings.wallet.private_key_env, "FAUCET_OPERATOR_KEY");
        assert!(settings.database.is_none());
        assert!(settings.phases.is_empty());
    }

    #[test]
    fn test_rejects_unknown_phase_override() {
        let body = format!("{}\n[phases.moon_confirm]\nmax_attempts = 3\n", BASE);
        let f = write_config(&body);
        assert!(Settings::from_path(f.path()).is_err());
    }

    #[test]
    fn test_rejects_zero_attempt_override() {
        let body = format!("{}\n[phases.ccip_response]\nmax_attempts = 0\n", BASE);
        let f = write_config(&body);
        assert!(Settings::from_path(f.path()).is_err());
    }

    #[test]
    fn test_rejects_bad_contract_address() {
        let body = BASE.replace(
            "0x00000000000000000000000000000000000000a2",
            "not-an-address",
        );
        let f = write_config(&body);
        assert!(Settings::from_path(f.path()).is_err());
    }
}
