use std::slice;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use super::block::{Block, UnsealedBlock, GENESIS_PREVIOUS_HASH};
use super::codec;
use super::consensus::{Consensus, ConsensusError, ConsensusMode};
use super::merkle::{MerkleError, MerkleTree};
use super::stake::StakeRegistry;
use super::storage::{ChainStore, MemoryStore, StorageError};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Consensus error: {0}")]
    ConsensusError(#[from] ConsensusError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Chain integrity violated at position(s) {0:?}")]
    IntegrityViolation(Vec<usize>),
}

/// Which invariant a block breaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The first block is not a genesis block
    GenesisMismatch,
    /// The block's index is not its position in the chain
    IndexMismatch,
    /// `previous_hash` differs from the preceding block's hash
    BrokenLink,
    /// The stored hash differs from the hash of the stored fields
    HashMismatch,
    /// The hash lacks the required leading zeros
    DifficultyNotMet,
    /// The proof belongs to the other consensus mode
    ProofModeMismatch,
}

/// One invariant violation found by [`Blockchain::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChainViolation {
    /// Position of the offending block
    pub position: usize,

    pub kind: ViolationKind,

    /// Human readable detail
    pub detail: String,
}

/// Represents the blockchain
pub struct Blockchain {
    /// The chain of blocks; never empty
    chain: Vec<Block>,

    /// Seals new blocks
    consensus: Consensus,

    /// Receives the full chain after every append
    store: Box<dyn ChainStore>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("length", &self.chain.len())
            .field("consensus", &self.consensus)
            .finish()
    }
}

impl Blockchain {
    /// Creates an in-memory blockchain holding only a genesis block
    pub fn new(consensus: Consensus) -> Result<Self, BlockchainError> {
        Self::open(consensus, Box::new(MemoryStore::new()))
    }

    /// Loads the chain from `store`, creating a genesis block if it is empty
    ///
    /// Integrity violations in a loaded chain are logged, not rejected; see
    /// [`open_verified`](Self::open_verified).
    ///
    /// # Arguments
    ///
    /// * `consensus` - Seals blocks appended from now on
    /// * `store` - The persistence collaborator
    pub fn open(
        mut consensus: Consensus,
        mut store: Box<dyn ChainStore>,
    ) -> Result<Self, BlockchainError> {
        let chain = match store.load()? {
            Some(blocks) if !blocks.is_empty() => {
                info!("Loaded blockchain with {} blocks from storage", blocks.len());
                blocks
            }
            _ => {
                info!("No existing blockchain found in storage, creating genesis block");
                let genesis = Self::genesis(&mut consensus, codec::now_timestamp())?;
                store.persist(slice::from_ref(&genesis))?;
                vec![genesis]
            }
        };

        let blockchain = Blockchain {
            chain,
            consensus,
            store,
        };

        for violation in blockchain.validate() {
            warn!(
                "Block at position {} is invalid ({:?}): {}",
                violation.position, violation.kind, violation.detail
            );
        }

        Ok(blockchain)
    }

    /// Like [`open`](Self::open) but refuses a chain with any violation
    pub fn open_verified(
        consensus: Consensus,
        store: Box<dyn ChainStore>,
    ) -> Result<Self, BlockchainError> {
        let blockchain = Self::open(consensus, store)?;
        let positions = blockchain.violating_positions();

        if positions.is_empty() {
            Ok(blockchain)
        } else {
            Err(BlockchainError::IntegrityViolation(positions))
        }
    }

    /// Builds and seals the genesis block
    pub fn genesis(consensus: &mut Consensus, timestamp: f64) -> Result<Block, ConsensusError> {
        consensus.seal_genesis(UnsealedBlock::genesis(timestamp))
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> &Block {
        &self.chain[self.chain.len() - 1]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn mode(&self) -> ConsensusMode {
        self.consensus.mode()
    }

    pub fn consensus(&self) -> &Consensus {
        &self.consensus
    }

    /// Replaces the stakes used for the next proof-of-stake draws
    pub fn set_stake_registry(&mut self, registry: StakeRegistry) -> Result<(), BlockchainError> {
        self.consensus.set_stake_registry(registry)?;
        Ok(())
    }

    /// Appends a block carrying `payload`, stamped with the current time
    pub fn append(&mut self, payload: Value) -> Result<Block, BlockchainError> {
        self.append_at(payload, codec::now_timestamp())
    }

    /// Appends a block carrying `payload` with an explicit timestamp
    ///
    /// Timestamps are not required to increase along the chain.
    ///
    /// # Returns
    ///
    /// The sealed block. On any error the chain is left unchanged.
    pub fn append_at(&mut self, payload: Value, timestamp: f64) -> Result<Block, BlockchainError> {
        let last = self.last_block();
        let candidate = UnsealedBlock::new(
            last.index() + 1,
            last.hash().to_string(),
            payload,
            timestamp,
        );

        let block = self.consensus.seal(candidate)?;
        self.chain.push(block.clone());

        if let Err(err) = self.store.persist(&self.chain) {
            error!("Failed to persist block {}: {}", block.index(), err);
            self.chain.pop();
            return Err(err.into());
        }

        match block.proof().validator() {
            Some(validator) => info!(
                "Appended block {} sealed by {} with hash {}",
                block.index(),
                validator,
                block.hash()
            ),
            None => info!("Appended block {} with hash {}", block.index(), block.hash()),
        }
        Ok(block)
    }

    /// Validates the blockchain
    ///
    /// Checks the genesis block, index continuity, hash links, recomputed
    /// hashes, the proof variant and, for proof-of-work, the difficulty.
    ///
    /// # Returns
    ///
    /// Every violation found, in chain order; empty for a consistent chain
    pub fn validate(&self) -> Vec<ChainViolation> {
        let mode = self.consensus.mode();
        let miner = self.consensus.miner();
        let mut violations = Vec::new();
        let mut report = |position: usize, kind: ViolationKind, detail: String| {
            violations.push(ChainViolation {
                position,
                kind,
                detail,
            })
        };

        for (position, block) in self.chain.iter().enumerate() {
            if position == 0 {
                if !block.is_genesis() {
                    report(
                        position,
                        ViolationKind::GenesisMismatch,
                        format!(
                            "expected index 0 and previous hash {}, found {} and {}",
                            GENESIS_PREVIOUS_HASH,
                            block.index(),
                            block.previous_hash()
                        ),
                    );
                }
            } else {
                let previous = &self.chain[position - 1];

                if block.index() != position as u64 {
                    report(
                        position,
                        ViolationKind::IndexMismatch,
                        format!("expected index {}, found {}", position, block.index()),
                    );
                }

                if block.previous_hash() != previous.hash() {
                    report(
                        position,
                        ViolationKind::BrokenLink,
                        format!(
                            "previous hash {} does not match {}",
                            block.previous_hash(),
                            previous.hash()
                        ),
                    );
                }
            }

            if !mode.accepts(block.proof()) {
                report(
                    position,
                    ViolationKind::ProofModeMismatch,
                    format!("block proof is not {}", mode),
                );
            }

            let recomputed = block.calculate_hash();
            if block.hash() != recomputed {
                report(
                    position,
                    ViolationKind::HashMismatch,
                    format!("stored {}, recomputed {}", block.hash(), recomputed),
                );
            }

            if let Some(miner) = miner {
                if !miner.meets_difficulty(block.hash()) {
                    report(
                        position,
                        ViolationKind::DifficultyNotMet,
                        format!(
                            "hash {} lacks prefix {}",
                            block.hash(),
                            miner.target_prefix()
                        ),
                    );
                }
            }
        }

        violations
    }

    /// true if the blockchain is valid, false otherwise
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// Sorted, deduplicated positions of blocks with any violation
    pub fn violating_positions(&self) -> Vec<usize> {
        let mut positions: Vec<usize> = self.validate().into_iter().map(|v| v.position).collect();
        positions.dedup();
        positions
    }

    /// Merkle tree over the block hashes, in chain order
    pub fn merkle_tree(&self) -> Result<MerkleTree, MerkleError> {
        MerkleTree::build(self.chain.iter().map(Block::hash))
    }
}
