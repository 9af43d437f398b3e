// Blockchain module
//
// This module contains the core ledger implementation including:
// - Canonical hashing of block fields
// - Block structure and sealing
// - Proof of work mining
// - Stake-weighted validator selection
// - Blockchain structure and validation
// - Merkle trees
// - Chain persistence

pub mod block;
pub mod chain;
pub mod codec;
pub mod consensus;
pub mod merkle;
pub mod pow;
pub mod stake;
pub mod storage;

// Re-export main components for easier access
pub use block::{Block, Proof};
pub use chain::{Blockchain, BlockchainError, ChainViolation, ViolationKind};
pub use consensus::{Consensus, ConsensusError, ConsensusMode};
pub use merkle::{MerkleError, MerkleTree};
pub use pow::ProofOfWorkMiner;
pub use stake::{StakeError, StakeRegistry, ValidatorSelector};
pub use storage::{ChainStore, JsonFileStore, MemoryStore, SledStore, StorageError};
