//! ## Pool Configuration Module
//!
//! Defines [`PoolConfig`], the primary configuration structure for the pool
//! daemon, deserialized from a TOML file.
//!
//! This module handles:
//! - Network selection and node RPC endpoint
//! - Treasury address, fee and rebate rates
//! - The stratum port table ([`StratumPortConfig`])
//! - Template cache sizing and upstream retry policy

use std::path::{Path, PathBuf};
use std::str::FromStr;

use kaspa_addresses::Address;
use kaspa_consensus_core::network::NetworkId;
use serde::Deserialize;

use crate::error::{PoolError, PoolResult};

fn default_template_cache_size() -> usize {
    256
}

fn default_rpc_retry_interval_secs() -> u64 {
    5
}

fn default_rpc_request_timeout_secs() -> u64 {
    // The notification stream is long-lived; requests only time out when the
    // connection is wedged.
    86_400
}

fn default_treasury_workers() -> usize {
    10
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_extra_nonce_size() -> u8 {
    2
}

/// Configuration for the pool daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Network identifier: `mainnet`, `testnet-10` or `testnet-11`.
    pub network: String,
    /// wRPC URL of the kaspad node.
    pub node_rpc_url: String,
    /// Optional REST explorer base URL used as a fallback when the node
    /// cannot resolve reward blocks.
    pub rest_api_url: Option<String>,
    /// Treasury address coinbase rewards are paid to.
    pub pool_address: String,
    /// Tag embedded in the coinbase miner-info string; used to recognize the
    /// pool's own blocks among merge-set blues.
    pub pool_tag: String,
    /// Pool fee in basis points (200 = 2%).
    pub pool_fee_bps: u64,
    /// Share of the pool fee rebated to miners, in basis points of the fee.
    pub rebate_bps: u64,
    /// Postgres connection string.
    pub database_url: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    /// Maximum number of templates (and jobs) kept in memory.
    #[serde(default = "default_template_cache_size")]
    pub template_cache_size: usize,
    /// Interval between node reconnection attempts.
    #[serde(default = "default_rpc_retry_interval_secs")]
    pub rpc_retry_interval_secs: u64,
    /// Wall-clock timeout for a single RPC request.
    #[serde(default = "default_rpc_request_timeout_secs")]
    pub rpc_request_timeout_secs: u64,
    /// Parallelism of the treasury block-added worker pool.
    #[serde(default = "default_treasury_workers")]
    pub treasury_workers: usize,
    /// Stratum listener table; one entry per port.
    pub stratum: Vec<StratumPortConfig>,
    /// The path to the log file for the pool.
    log_file: Option<PathBuf>,
}

/// Configuration for one stratum listening port.
#[derive(Debug, Deserialize, Clone)]
pub struct StratumPortConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Difficulty assigned to workers at authorize time.
    pub initial_difficulty: u64,
    /// Target share rate the VarDiff controller converges on.
    pub shares_per_minute: f64,
    /// Round adjusted difficulties down to the nearest power of two.
    #[serde(default)]
    pub clamp_pow2: bool,
    /// Enable the per-worker variable difficulty controller.
    #[serde(default)]
    pub var_diff: bool,
    /// Extranonce prefix size in bytes; 0 disables extranonce assignment.
    #[serde(default = "default_extra_nonce_size")]
    pub extra_nonce_size: u8,
    /// Lower difficulty bound for this port.
    pub min_diff: u64,
    /// Upper difficulty bound for this port.
    pub max_diff: u64,
    /// Honor the optional difficulty argument of `mining.authorize`.
    /// Only the designated configuration port should set this.
    #[serde(default)]
    pub allow_custom_difficulty: bool,
}

impl PoolConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PoolError::Config(format!("reading {}: {e}", path.display())))?;
        let config: PoolConfig =
            toml::from_str(&content).map_err(|e| PoolError::Config(format!("parsing TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration. Any violation is a startup failure.
    pub fn validate(&self) -> PoolResult<()> {
        self.network_id()?;
        let address = self.pool_address()?;
        let expected = self.network_id()?.network_type().into();
        if address.prefix != expected {
            return Err(PoolError::Config(format!(
                "pool address prefix {:?} does not match network {}",
                address.prefix, self.network
            )));
        }
        if self.pool_fee_bps > 10_000 {
            return Err(PoolError::Config(format!(
                "pool_fee_bps must be at most 10000, got {}",
                self.pool_fee_bps
            )));
        }
        if self.rebate_bps > 10_000 {
            return Err(PoolError::Config(format!(
                "rebate_bps must be at most 10000, got {}",
                self.rebate_bps
            )));
        }
        if self.pool_tag.is_empty() {
            return Err(PoolError::Config("pool_tag must not be empty".to_string()));
        }
        if self.template_cache_size < 2 {
            return Err(PoolError::Config(
                "template_cache_size must be at least 2".to_string(),
            ));
        }
        if self.stratum.is_empty() {
            return Err(PoolError::Config(
                "at least one stratum port must be configured".to_string(),
            ));
        }
        let mut seen_ports = std::collections::HashSet::new();
        for entry in &self.stratum {
            if !seen_ports.insert(entry.port) {
                return Err(PoolError::Config(format!(
                    "duplicate stratum port {}",
                    entry.port
                )));
            }
            entry.validate()?;
        }
        Ok(())
    }

    /// Parsed network identifier.
    pub fn network_id(&self) -> PoolResult<NetworkId> {
        NetworkId::from_str(&self.network)
            .map_err(|e| PoolError::Config(format!("invalid network {:?}: {e}", self.network)))
    }

    /// Parsed treasury address.
    pub fn pool_address(&self) -> PoolResult<Address> {
        Address::try_from(self.pool_address.as_str())
            .map_err(|e| PoolError::Config(format!("invalid pool address: {e}")))
    }

    pub fn set_log_dir(&mut self, log_dir: Option<PathBuf>) {
        if let Some(dir) = log_dir {
            self.log_file = Some(dir);
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

impl StratumPortConfig {
    fn validate(&self) -> PoolResult<()> {
        if self.min_diff == 0 {
            return Err(PoolError::Config(format!(
                "port {}: min_diff must be positive",
                self.port
            )));
        }
        if self.min_diff > self.max_diff {
            return Err(PoolError::Config(format!(
                "port {}: min_diff {} exceeds max_diff {}",
                self.port, self.min_diff, self.max_diff
            )));
        }
        if self.initial_difficulty < self.min_diff || self.initial_difficulty > self.max_diff {
            return Err(PoolError::Config(format!(
                "port {}: initial_difficulty {} outside [{}, {}]",
                self.port, self.initial_difficulty, self.min_diff, self.max_diff
            )));
        }
        if self.shares_per_minute <= 0.0 {
            return Err(PoolError::Config(format!(
                "port {}: shares_per_minute must be positive",
                self.port
            )));
        }
        // The composed nonce is 16 hex digits; the prefix must leave room
        // for the miner's extranonce2.
        if self.extra_nonce_size > 3 {
            return Err(PoolError::Config(format!(
                "port {}: extra_nonce_size must be at most 3 bytes",
                self.port
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_port() -> StratumPortConfig {
        StratumPortConfig {
            port: 4444,
            initial_difficulty: 64,
            shares_per_minute: 20.0,
            clamp_pow2: true,
            var_diff: true,
            extra_nonce_size: 2,
            min_diff: 4,
            max_diff: 32_768,
            allow_custom_difficulty: false,
        }
    }

    fn base_config() -> PoolConfig {
        let pool_address = Address::new(
            kaspa_addresses::Prefix::Mainnet,
            kaspa_addresses::Version::PubKey,
            &[0u8; 32],
        );
        PoolConfig {
            network: "mainnet".to_string(),
            node_rpc_url: "ws://127.0.0.1:17110".to_string(),
            rest_api_url: None,
            pool_address: pool_address.to_string(),
            pool_tag: "kpool".to_string(),
            pool_fee_bps: 200,
            rebate_bps: 330,
            database_url: "postgres://localhost/kpool".to_string(),
            database_max_connections: 10,
            template_cache_size: 256,
            rpc_retry_interval_secs: 5,
            rpc_request_timeout_secs: 86_400,
            treasury_workers: 10,
            stratum: vec![base_port()],
            log_file: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_network() {
        let mut config = base_config();
        config.network = "devnet-99".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_excessive_fee() {
        let mut config = base_config();
        config.pool_fee_bps = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ports() {
        let mut config = base_config();
        config.stratum.push(base_port());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_initial_difficulty_outside_bounds() {
        let mut config = base_config();
        config.stratum[0].initial_difficulty = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_extranonce() {
        let mut config = base_config();
        config.stratum[0].extra_nonce_size = 4;
        assert!(config.validate().is_err());
    }
}
