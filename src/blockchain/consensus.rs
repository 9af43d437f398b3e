use std::fmt;
use std::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::block::{Block, Proof, UnsealedBlock, GENESIS_VALIDATOR};
use super::pow::ProofOfWorkMiner;
use super::stake::{StakeError, StakeRegistry, ValidatorSelector};

/// Errors that can occur while sealing a block
#[derive(Debug, Error, PartialEq)]
pub enum ConsensusError {
    #[error("Stake error: {0}")]
    Stake(#[from] StakeError),

    #[error("No valid nonce found within {attempts} attempts")]
    MiningCutoff { attempts: u64 },

    #[error("Operation requires {expected} consensus, chain uses {actual}")]
    ModeMismatch {
        expected: ConsensusMode,
        actual: ConsensusMode,
    },
}

/// Which mechanism decides who appends the next block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    Pow,
    Pos,
}

impl ConsensusMode {
    /// Whether `proof` is the variant this mode produces
    pub fn accepts(&self, proof: &Proof) -> bool {
        matches!(
            (self, proof),
            (ConsensusMode::Pow, Proof::Nonce(_)) | (ConsensusMode::Pos, Proof::Validator(_))
        )
    }
}

impl fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusMode::Pow => write!(f, "proof-of-work"),
            ConsensusMode::Pos => write!(f, "proof-of-stake"),
        }
    }
}

impl FromStr for ConsensusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pow" | "proof-of-work" => Ok(ConsensusMode::Pow),
            "pos" | "proof-of-stake" => Ok(ConsensusMode::Pos),
            other => Err(format!("unknown consensus mode '{}'", other)),
        }
    }
}

/// The consensus component a chain seals its blocks with
#[derive(Debug)]
pub enum Consensus {
    ProofOfWork {
        miner: ProofOfWorkMiner,
        /// Give up after this many nonces; `None` searches forever
        max_attempts: Option<u64>,
    },
    ProofOfStake(ValidatorSelector),
}

impl Consensus {
    /// Proof-of-work, giving up after `max_attempts` nonces if set
    pub fn proof_of_work(miner: ProofOfWorkMiner, max_attempts: Option<u64>) -> Self {
        Consensus::ProofOfWork {
            miner,
            max_attempts,
        }
    }

    pub fn proof_of_stake(selector: ValidatorSelector) -> Self {
        Consensus::ProofOfStake(selector)
    }

    pub fn mode(&self) -> ConsensusMode {
        match self {
            Consensus::ProofOfWork { .. } => ConsensusMode::Pow,
            Consensus::ProofOfStake(_) => ConsensusMode::Pos,
        }
    }

    /// The miner, if this is proof-of-work
    pub fn miner(&self) -> Option<&ProofOfWorkMiner> {
        match self {
            Consensus::ProofOfWork { miner, .. } => Some(miner),
            Consensus::ProofOfStake(_) => None,
        }
    }

    /// The stakes, if this is proof-of-stake
    pub fn stake_registry(&self) -> Option<&StakeRegistry> {
        match self {
            Consensus::ProofOfWork { .. } => None,
            Consensus::ProofOfStake(selector) => Some(selector.registry()),
        }
    }

    /// Replaces the stakes of a proof-of-stake chain
    pub fn set_stake_registry(&mut self, registry: StakeRegistry) -> Result<(), ConsensusError> {
        match self {
            Consensus::ProofOfStake(selector) => {
                selector.set_registry(registry);
                Ok(())
            }
            Consensus::ProofOfWork { .. } => Err(ConsensusError::ModeMismatch {
                expected: ConsensusMode::Pos,
                actual: ConsensusMode::Pow,
            }),
        }
    }

    /// Produces the proof and hash for `candidate`
    pub fn seal(&mut self, candidate: UnsealedBlock) -> Result<Block, ConsensusError> {
        match self {
            Consensus::ProofOfWork {
                miner,
                max_attempts: None,
            } => {
                let (nonce, hash) = miner.mine(&candidate);
                Ok(candidate.seal_with_nonce(nonce, hash))
            }
            Consensus::ProofOfWork {
                miner,
                max_attempts: Some(attempts),
            } => {
                let (nonce, hash) = miner
                    .mine_bounded(&candidate, *attempts)
                    .ok_or(ConsensusError::MiningCutoff {
                        attempts: *attempts,
                    })?;
                Ok(candidate.seal_with_nonce(nonce, hash))
            }
            Consensus::ProofOfStake(selector) => {
                let validator = selector.select()?;
                Ok(candidate.seal_with_validator(validator))
            }
        }
    }

    /// Seals a genesis block
    ///
    /// Proof-of-stake genesis carries the reserved `system` validator
    /// instead of a drawn one.
    pub fn seal_genesis(&mut self, candidate: UnsealedBlock) -> Result<Block, ConsensusError> {
        let block = match self {
            Consensus::ProofOfStake(_) => {
                candidate.seal_with_validator(GENESIS_VALIDATOR.to_string())
            }
            Consensus::ProofOfWork { .. } => self.seal(candidate)?,
        };

        info!("Created genesis block with hash {}", block.hash());
        Ok(block)
    }
}
