//! Environment-driven configuration for the dream service.

use std::path::PathBuf;

/// Environment variable names
pub mod env_vars {
    pub const PORT: &str = "DREAM_SERVICE_PORT";
    pub const MEMORY_PATH: &str = "DREAM_MEMORY_PATH";
    pub const DB_PATH: &str = "DREAM_DB_PATH";
    pub const RPC_URL: &str = "DREAM_RPC_URL";
    pub const CHAIN_ID: &str = "DREAM_CHAIN_ID";
    pub const DEPLOYER_KEY: &str = "DEPLOYER_KEY";
    pub const SIMULATE: &str = "SYNDICATE_SIMULATE";
    pub const ARTIFACTS_DIR: &str = "DREAM_ARTIFACTS_DIR";
    pub const LISTENER_POLL_SECS: &str = "DREAM_LISTENER_POLL_SECS";
    pub const LISTENER_RETRY_SECS: &str = "DREAM_LISTENER_RETRY_SECS";
    pub const LISTENER_MAX_EVENTS: &str = "DREAM_LISTENER_MAX_EVENTS";
    pub const RELAYER_QUEUE_CAPACITY: &str = "DREAM_RELAYER_QUEUE_CAPACITY";
    pub const BELIEF_REWRITES: &str = "DREAM_BELIEF_REWRITES";
    pub const MICROSTRUCTURES: &str = "DREAM_MICROSTRUCTURES";
    pub const FORWARDER_ADDRESS: &str = "DREAM_FORWARDER_ADDRESS";
    pub const TREASURY_ADDRESS: &str = "DREAM_TREASURY_ADDRESS";
    pub const DISTRIBUTOR_ADDRESS: &str = "DREAM_DISTRIBUTOR_ADDRESS";
    pub const STABLECOINS: &str = "DREAM_STABLECOINS";
    pub const AGENT_REGISTRY_PATH: &str = "DREAM_AGENT_REGISTRY_PATH";
}

pub const DEFAULT_PORT: u16 = 9110;
pub const DEFAULT_RPC_URL: &str = "https://mainnet.skalenodes.com/v1/elated-tan-skat";
pub const DEFAULT_CHAIN_ID: u64 = 2046399126;
pub const DEFAULT_TREASURY_ADDRESS: &str = "4eJZVbbsiLAG6EkWvgEYEWKEpdhJPFBYMeJ6DBX98w6a";

/// USDC, USDT, DAI on Ethereum mainnet
pub const DEFAULT_STABLECOINS: [&str; 3] = [
    "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
    "0xdac17f958d2ee523a2206206994597c13d831ec7",
    "0x6b175474e89094c44da98b954eedeac495271d0f",
];

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub memory_path: PathBuf,
    pub db_path: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub deployer_key: Option<String>,
    pub simulate: bool,
    pub artifacts_dir: PathBuf,
    pub listener_poll_secs: u64,
    pub listener_retry_secs: u64,
    pub listener_max_events: usize,
    pub relayer_queue_capacity: usize,
    pub belief_rewrites_enabled: bool,
    pub microstructures_enabled: bool,
    pub forwarder_address: Option<String>,
    pub treasury_address: String,
    pub distributor_address: Option<String>,
    pub stablecoins: Vec<String>,
    pub agent_registry_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build a config from any key/value lookup
    pub fn from_source<F>(get: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let stablecoins = match non_empty(env_vars::STABLECOINS) {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_STABLECOINS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Self {
            port: parse_or(&non_empty, env_vars::PORT, DEFAULT_PORT)?,
            memory_path: non_empty(env_vars::MEMORY_PATH)
                .unwrap_or_else(|| "./iem_memory.json".to_string())
                .into(),
            db_path: non_empty(env_vars::DB_PATH).unwrap_or_else(|| "./dream_service.db".to_string()),
            rpc_url: non_empty(env_vars::RPC_URL).unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            chain_id: parse_or(&non_empty, env_vars::CHAIN_ID, DEFAULT_CHAIN_ID)?,
            deployer_key: non_empty(env_vars::DEPLOYER_KEY),
            simulate: non_empty(env_vars::SIMULATE).map(|v| parse_flag(&v)).unwrap_or(false),
            artifacts_dir: non_empty(env_vars::ARTIFACTS_DIR)
                .unwrap_or_else(|| "./artifacts".to_string())
                .into(),
            listener_poll_secs: parse_or(&non_empty, env_vars::LISTENER_POLL_SECS, 2)?,
            listener_retry_secs: parse_or(&non_empty, env_vars::LISTENER_RETRY_SECS, 5)?,
            listener_max_events: parse_or(&non_empty, env_vars::LISTENER_MAX_EVENTS, 1000)?,
            relayer_queue_capacity: parse_or(&non_empty, env_vars::RELAYER_QUEUE_CAPACITY, 1024)?,
            belief_rewrites_enabled: non_empty(env_vars::BELIEF_REWRITES)
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            microstructures_enabled: non_empty(env_vars::MICROSTRUCTURES)
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            forwarder_address: non_empty(env_vars::FORWARDER_ADDRESS),
            treasury_address: non_empty(env_vars::TREASURY_ADDRESS)
                .unwrap_or_else(|| DEFAULT_TREASURY_ADDRESS.to_string()),
            distributor_address: non_empty(env_vars::DISTRIBUTOR_ADDRESS),
            stablecoins,
            agent_registry_path: non_empty(env_vars::AGENT_REGISTRY_PATH)
                .unwrap_or_else(|| "./agent_addresses.json".to_string())
                .into(),
        })
    }

    /// True when no transaction will reach a real chain
    pub fn simulation_mode(&self) -> bool {
        self.simulate || self.deployer_key.is_none()
    }
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| format!("{} must be a valid number ({}): {}", key, raw, e)),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_source(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.chain_id, DEFAULT_CHAIN_ID);
        assert_eq!(config.listener_poll_secs, 2);
        assert_eq!(config.listener_retry_secs, 5);
        assert_eq!(config.listener_max_events, 1000);
        assert_eq!(config.stablecoins.len(), 3);
        assert!(config.belief_rewrites_enabled);
        assert!(config.simulation_mode());
    }

    #[test]
    fn test_deployer_key_disables_simulation() {
        let config = config_from(&[(env_vars::DEPLOYER_KEY, "0xabc")]).unwrap();
        assert!(!config.simulation_mode());

        let config = config_from(&[
            (env_vars::DEPLOYER_KEY, "0xabc"),
            (env_vars::SIMULATE, "1"),
        ])
        .unwrap();
        assert!(config.simulation_mode());
    }

    #[test]
    fn test_blank_values_fall_back() {
        let config = config_from(&[(env_vars::DEPLOYER_KEY, "  "), (env_vars::PORT, "")]).unwrap();
        assert!(config.deployer_key.is_none());
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = config_from(&[(env_vars::CHAIN_ID, "skale")]).unwrap_err();
        assert!(err.contains(env_vars::CHAIN_ID));
    }

    #[test]
    fn test_stablecoin_list_is_lowercased() {
        let config = config_from(&[(env_vars::STABLECOINS, "0xAAA, 0xBbB")]).unwrap();
        assert_eq!(config.stablecoins, vec!["0xaaa", "0xbbb"]);
    }

    #[test]
    fn test_feature_toggles() {
        let config = config_from(&[
            (env_vars::BELIEF_REWRITES, "false"),
            (env_vars::MICROSTRUCTURES, "0"),
        ])
        .unwrap();
        assert!(!config.belief_rewrites_enabled);
        assert!(!config.microstructures_enabled);
    }
}
