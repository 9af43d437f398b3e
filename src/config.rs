use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use log::info;
use thiserror::Error;

use crate::blockchain::pow::{MiningError, DEFAULT_DIFFICULTY};
use crate::blockchain::{
    ChainStore, Consensus, ConsensusMode, JsonFileStore, MemoryStore, ProofOfWorkMiner,
    SledStore, StakeError, StakeRegistry, StorageError, ValidatorSelector,
};

/// Stakes used when `LEDGER_STAKES` is not set
pub const DEFAULT_STAKES: &str = "Alice:50,Bob:30,Charlie:20";

/// Errors that can occur while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid stakes: {0}")]
    Stake(#[from] StakeError),

    #[error("Invalid difficulty: {0}")]
    Mining(#[from] MiningError),
}

/// Where the chain is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Json,
    Sled,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(StoreKind::Json),
            "sled" => Ok(StoreKind::Sled),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store '{}'", other)),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub consensus: ConsensusMode,
    pub difficulty: usize,
    pub max_mining_attempts: Option<u64>,
    pub stakes: StakeRegistry,
    pub rng_seed: Option<u64>,
    pub store: StoreKind,
    pub data_path: PathBuf,
    pub strict_load: bool,
}

impl NodeConfig {
    /// Reads the configuration from the environment and an optional `.env` file
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            info!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let store: StoreKind = parse_or(&get, "LEDGER_STORE", StoreKind::Json)?;
        let data_path = get("LEDGER_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_path(store));
        let stakes = get("LEDGER_STAKES")
            .as_deref()
            .unwrap_or(DEFAULT_STAKES)
            .parse::<StakeRegistry>()?;

        let config = NodeConfig {
            host: get("LEDGER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&get, "LEDGER_PORT", 8080)?,
            consensus: parse_or(&get, "LEDGER_CONSENSUS", ConsensusMode::Pow)?,
            difficulty: parse_or(&get, "LEDGER_DIFFICULTY", DEFAULT_DIFFICULTY)?,
            max_mining_attempts: parse_optional(&get, "LEDGER_MAX_MINING_ATTEMPTS")?,
            stakes,
            rng_seed: parse_optional(&get, "LEDGER_RNG_SEED")?,
            store,
            data_path,
            strict_load: parse_or(&get, "LEDGER_STRICT_LOAD", false)?,
        };

        ProofOfWorkMiner::new(config.difficulty)?;
        Ok(config)
    }

    /// Builds the consensus component this configuration describes
    pub fn build_consensus(&self) -> Result<Consensus, ConfigError> {
        match self.consensus {
            ConsensusMode::Pow => Ok(Consensus::proof_of_work(
                ProofOfWorkMiner::new(self.difficulty)?,
                self.max_mining_attempts,
            )),
            ConsensusMode::Pos => {
                let selector = match self.rng_seed {
                    Some(seed) => ValidatorSelector::with_seed(self.stakes.clone(), seed),
                    None => ValidatorSelector::new(self.stakes.clone()),
                };
                Ok(Consensus::proof_of_stake(selector))
            }
        }
    }

    /// Opens the store this configuration describes
    pub fn build_store(&self) -> Result<Box<dyn ChainStore>, StorageError> {
        Ok(match self.store {
            StoreKind::Json => Box::new(JsonFileStore::new(&self.data_path)),
            StoreKind::Sled => Box::new(SledStore::new(&self.data_path)?),
            StoreKind::Memory => Box::new(MemoryStore::new()),
        })
    }
}

fn default_data_path(store: StoreKind) -> PathBuf {
    match store {
        StoreKind::Sled => PathBuf::from("data/ledger"),
        StoreKind::Json | StoreKind::Memory => PathBuf::from("data/ledger.json"),
    }
}

fn parse_optional<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(get, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    fn config_from(pairs: &[(&str, &str)]) -> Result<NodeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.consensus, ConsensusMode::Pow);
        assert_eq!(config.difficulty, 4);
        assert_eq!(config.max_mining_attempts, None);
        assert_eq!(config.stakes.len(), 3);
        assert_eq!(config.store, StoreKind::Json);
        assert_eq!(config.data_path, PathBuf::from("data/ledger.json"));
        assert!(!config.strict_load);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("LEDGER_CONSENSUS", "pos"),
            ("LEDGER_STAKES", "Eve:1,Frank:3"),
            ("LEDGER_RNG_SEED", "99"),
            ("LEDGER_STORE", "sled"),
            ("LEDGER_PORT", "9000"),
            ("LEDGER_STRICT_LOAD", "true"),
            ("LEDGER_MAX_MINING_ATTEMPTS", "500"),
        ])
        .unwrap();

        assert_eq!(config.consensus, ConsensusMode::Pos);
        assert_eq!(BTreeMap::from(config.stakes.clone())["Frank"], 3.0);
        assert_eq!(config.rng_seed, Some(99));
        assert_eq!(config.store, StoreKind::Sled);
        assert_eq!(config.data_path, PathBuf::from("data/ledger"));
        assert_eq!(config.port, 9000);
        assert!(config.strict_load);
        assert_eq!(config.max_mining_attempts, Some(500));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("LEDGER_PORT", "eighty")]),
            Err(ConfigError::InvalidValue { key: "LEDGER_PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("LEDGER_CONSENSUS", "pbft")]),
            Err(ConfigError::InvalidValue { key: "LEDGER_CONSENSUS", .. })
        ));
        assert!(matches!(
            config_from(&[("LEDGER_DIFFICULTY", "65")]),
            Err(ConfigError::Mining(MiningError::DifficultyTooHigh(65)))
        ));
        assert!(matches!(
            config_from(&[("LEDGER_STAKES", "Alice:-5")]),
            Err(ConfigError::Stake(StakeError::InvalidStake { .. }))
        ));
    }

    #[test]
    fn test_build_consensus() {
        let pow = config_from(&[("LEDGER_DIFFICULTY", "2")]).unwrap();
        assert_eq!(pow.build_consensus().unwrap().mode(), ConsensusMode::Pow);

        let pos = config_from(&[("LEDGER_CONSENSUS", "pos"), ("LEDGER_RNG_SEED", "1")]).unwrap();
        let consensus = pos.build_consensus().unwrap();
        assert_eq!(consensus.mode(), ConsensusMode::Pos);
        assert_eq!(consensus.stake_registry().map(StakeRegistry::len), Some(3));
    }
}
