use std::fmt;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use super::codec;

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Validator identity stamped into a proof-of-stake genesis block
pub const GENESIS_VALIDATOR: &str = "system";

/// Payload carried by every genesis block
pub fn genesis_payload() -> Value {
    json!({
        "Name": "Genesis Block",
        "Roll Number": "N/A",
        "Branch": "N/A"
    })
}

/// Consensus evidence attached to a sealed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Proof {
    /// Proof-of-work nonce
    Nonce(u64),

    /// Identity of the proof-of-stake validator
    Validator(String),
}

impl Proof {
    pub fn nonce(&self) -> Option<u64> {
        match self {
            Proof::Nonce(nonce) => Some(*nonce),
            Proof::Validator(_) => None,
        }
    }

    pub fn validator(&self) -> Option<&str> {
        match self {
            Proof::Nonce(_) => None,
            Proof::Validator(validator) => Some(validator),
        }
    }
}

/// Block fields before a proof and hash are attached
#[derive(Debug, Clone, PartialEq)]
pub struct UnsealedBlock {
    index: u64,
    previous_hash: String,
    payload: Value,
    timestamp: f64,
}

impl UnsealedBlock {
    pub fn new(index: u64, previous_hash: String, payload: Value, timestamp: f64) -> Self {
        UnsealedBlock {
            index,
            previous_hash,
            payload,
            timestamp,
        }
    }

    /// The fixed first block of every chain
    pub fn genesis(timestamp: f64) -> Self {
        Self::new(
            0,
            GENESIS_PREVIOUS_HASH.to_string(),
            genesis_payload(),
            timestamp,
        )
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Canonical hash preimage for these fields, with an optional nonce
    pub fn canonical_bytes(&self, nonce: Option<u64>) -> Vec<u8> {
        codec::canonicalize(
            self.index,
            &self.previous_hash,
            &self.payload,
            self.timestamp,
            nonce,
        )
    }

    pub(crate) fn canonical_prefix(&self) -> String {
        codec::canonical_prefix(self.index, &self.previous_hash, &self.payload, self.timestamp)
    }

    /// Seals the block with a mined nonce
    ///
    /// # Arguments
    ///
    /// * `nonce` - The winning nonce
    /// * `hash` - The digest the miner produced for `nonce`
    pub fn seal_with_nonce(self, nonce: u64, hash: String) -> Block {
        debug_assert_eq!(hash, codec::digest(&self.canonical_bytes(Some(nonce))));

        Block {
            index: self.index,
            previous_hash: self.previous_hash,
            payload: self.payload,
            proof: Proof::Nonce(nonce),
            hash,
            timestamp: self.timestamp,
        }
    }

    /// Seals the block for a selected validator; the hash excludes any nonce.
    pub fn seal_with_validator(self, validator: String) -> Block {
        let hash = codec::digest(&self.canonical_bytes(None));

        Block {
            index: self.index,
            previous_hash: self.previous_hash,
            payload: self.payload,
            proof: Proof::Validator(validator),
            hash,
            timestamp: self.timestamp,
        }
    }
}

/// A sealed block of the ledger
///
/// Fields are only readable; a block is never modified once sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    index: u64,

    /// Hash of the previous block
    previous_hash: String,

    /// Opaque structured payload
    #[schema(value_type = Object)]
    payload: Value,

    /// Proof of work nonce or proof of stake validator
    proof: Proof,

    /// Hash of the block, fixed at seal time
    hash: String,

    /// Seconds since the Unix epoch
    timestamp: f64,
}

impl Block {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn proof(&self) -> &Proof {
        &self.proof
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Whether this block has the shape of a genesis block
    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Recomputes the hash from the stored fields
    ///
    /// # Returns
    ///
    /// The SHA-256 hash of the block as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        codec::digest(&codec::canonicalize(
            self.index,
            &self.previous_hash,
            &self.payload,
            self.timestamp,
            self.proof.nonce(),
        ))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = serde_json::to_string_pretty(&self.payload).map_err(|_| fmt::Error)?;
        let secs = self.timestamp.trunc() as i64;
        let nanos = (self.timestamp.fract() * 1e9) as u32;
        let when = match Utc.timestamp_opt(secs, nanos).single() {
            Some(time) => time.format("%a %b %e %H:%M:%S %Y").to_string(),
            None => codec::format_float(self.timestamp),
        };

        writeln!(f, "Block Number: {}", self.index)?;
        writeln!(f, "Previous Hash: {}", self.previous_hash)?;
        writeln!(f, "Data: {}", data)?;
        writeln!(f, "Timestamp: {}", when)?;
        match &self.proof {
            Proof::Nonce(nonce) => writeln!(f, "Nonce: {}", nonce)?,
            Proof::Validator(validator) => writeln!(f, "Validator: {}", validator)?,
        }
        writeln!(f, "Hash: {}", self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Value {
        json!({"Name": "Ada", "Roll Number": "7", "Branch": "CSE"})
    }

    #[test]
    fn test_seal_with_validator() {
        let block = UnsealedBlock::new(1, "prev".to_string(), sample_payload(), 1700000000.5)
            .seal_with_validator("Alice".to_string());

        assert_eq!(block.index(), 1);
        assert_eq!(block.previous_hash(), "prev");
        assert_eq!(block.proof().validator(), Some("Alice"));
        assert_eq!(block.hash().len(), 64);
        assert_eq!(block.hash(), block.calculate_hash());
    }

    #[test]
    fn test_seal_with_nonce_matches_recomputation() {
        let unsealed = UnsealedBlock::new(1, "0".to_string(), sample_payload(), 1700000000.5);
        let hash = codec::digest(&unsealed.canonical_bytes(Some(42)));
        let block = unsealed.seal_with_nonce(42, hash.clone());

        assert_eq!(block.proof().nonce(), Some(42));
        assert_eq!(block.calculate_hash(), hash);
        assert_eq!(
            hash,
            "1f3df21615405d9a12cd37908e9f27d25819c282a3c7a212f7e54ef35a23205c"
        );
    }

    #[test]
    fn test_validator_hash_ignores_identity() {
        let unsealed = UnsealedBlock::new(3, "abc".to_string(), sample_payload(), 10.0);
        let a = unsealed.clone().seal_with_validator("Alice".to_string());
        let b = unsealed.seal_with_validator("Bob".to_string());

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_genesis_shape() {
        let block = UnsealedBlock::genesis(0.0).seal_with_validator(GENESIS_VALIDATOR.to_string());

        assert!(block.is_genesis());
        assert_eq!(block.payload()["Name"], "Genesis Block");
    }

    #[test]
    fn test_record_layout() {
        let block = UnsealedBlock::new(2, "prev".to_string(), sample_payload(), 5.0)
            .seal_with_validator("Bob".to_string());
        let record = serde_json::to_value(&block).unwrap();

        assert_eq!(record["index"], 2);
        assert_eq!(record["proof"], json!({"validator": "Bob"}));
        assert_eq!(record["hash"], block.hash());

        let restored: Block = serde_json::from_value(record).unwrap();
        assert_eq!(restored, block);
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let record = json!({
            "index": 1,
            "previous_hash": "0",
            "payload": {},
            "hash": "00ab",
            "timestamp": 1.0
        });

        let err = serde_json::from_value::<Block>(record).unwrap_err();
        assert!(err.to_string().contains("proof"));
    }

    #[test]
    fn test_display_layout() {
        let block = UnsealedBlock::new(4, "prev".to_string(), sample_payload(), 0.0)
            .seal_with_validator("Carol".to_string());
        let text = block.to_string();

        assert!(text.starts_with("Block Number: 4\n"));
        assert!(text.contains("Timestamp: Thu Jan  1 00:00:00 1970"));
        assert!(text.contains("Validator: Carol"));
    }
}
