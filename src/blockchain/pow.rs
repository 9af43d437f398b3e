use log::debug;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::block::UnsealedBlock;
use super::codec::HASH_HEX_LEN;

/// Difficulty used when none is configured
pub const DEFAULT_DIFFICULTY: usize = 4;

/// Errors that can occur when configuring the miner
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiningError {
    #[error("Difficulty {0} exceeds the {} hex digits of a hash", HASH_HEX_LEN)]
    DifficultyTooHigh(usize),
}

/// Searches for a nonce whose block hash starts with `difficulty` zero digits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOfWorkMiner {
    target: String,
}

impl ProofOfWorkMiner {
    /// Creates a miner for the given number of leading zero hex digits
    pub fn new(difficulty: usize) -> Result<Self, MiningError> {
        if difficulty > HASH_HEX_LEN {
            return Err(MiningError::DifficultyTooHigh(difficulty));
        }

        Ok(ProofOfWorkMiner {
            target: "0".repeat(difficulty),
        })
    }

    /// The prefix every accepted hash starts with
    pub fn target_prefix(&self) -> &str {
        &self.target
    }

    /// Whether `hash` satisfies the difficulty predicate
    pub fn meets_difficulty(&self, hash: &str) -> bool {
        hash.starts_with(&self.target)
    }

    /// Performs proof of work to find a valid hash
    ///
    /// Starts at nonce 0 and never gives up; the same fields always yield
    /// the same result.
    ///
    /// # Returns
    ///
    /// The winning nonce and its hash
    pub fn mine(&self, candidate: &UnsealedBlock) -> (u64, String) {
        let search = Search::new(candidate);
        let mut nonce = 0;

        loop {
            if let Some(hash) = search.attempt(nonce, self) {
                debug!(
                    "Mined block {} after {} attempts",
                    candidate.index(),
                    nonce + 1
                );
                return (nonce, hash);
            }

            nonce += 1;
        }
    }

    /// Like [`mine`](Self::mine) but stops after `max_attempts` nonces
    pub fn mine_bounded(
        &self,
        candidate: &UnsealedBlock,
        max_attempts: u64,
    ) -> Option<(u64, String)> {
        let search = Search::new(candidate);

        let found = (0..max_attempts).find_map(|nonce| {
            search.attempt(nonce, self).map(|hash| (nonce, hash))
        });

        if found.is_none() {
            debug!(
                "Gave up mining block {} after {} attempts",
                candidate.index(),
                max_attempts
            );
        }

        found
    }
}

impl Default for ProofOfWorkMiner {
    fn default() -> Self {
        ProofOfWorkMiner {
            target: "0".repeat(DEFAULT_DIFFICULTY),
        }
    }
}

/// Hasher state with everything but the nonce already absorbed
struct Search {
    prefix: Sha256,
}

impl Search {
    fn new(candidate: &UnsealedBlock) -> Self {
        Search {
            prefix: Sha256::new_with_prefix(candidate.canonical_prefix().as_bytes()),
        }
    }

    fn attempt(&self, nonce: u64, miner: &ProofOfWorkMiner) -> Option<String> {
        let mut hasher = self.prefix.clone();
        hasher.update(nonce.to_string().as_bytes());
        let hash = hex::encode(hasher.finalize());

        if miner.meets_difficulty(&hash) {
            Some(hash)
        } else {
            None
        }
    }
}
