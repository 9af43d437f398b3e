use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::Value;
use sled::transaction::{TransactionError, TransactionResult};
use sled::{Batch, Db, Transactional, Tree};
use thiserror::Error;

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Malformed block record at position {position}: {reason}")]
    MalformedRecord { position: usize, reason: String },
}

/// Where a chain's blocks live outside the process
///
/// A store always receives the complete ordered sequence; whether it
/// rewrites or appends is its own concern.
pub trait ChainStore: Send {
    /// Loads the persisted blocks, or `None` if nothing was persisted yet
    fn load(&self) -> Result<Option<Vec<Block>>, StorageError>;

    /// Makes the store's contents match `blocks`
    fn persist(&mut self, blocks: &[Block]) -> Result<(), StorageError>;
}

/// Decodes one persisted record, naming its position on failure
fn decode_record(position: usize, record: Value) -> Result<Block, StorageError> {
    serde_json::from_value(record).map_err(|e| StorageError::MalformedRecord {
        position,
        reason: e.to_string(),
    })
}

/// Keeps the chain in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Option<Vec<Block>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `blocks`
    #[cfg(test)]
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        MemoryStore {
            blocks: Some(blocks),
        }
    }
}

impl ChainStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<Block>>, StorageError> {
        Ok(self.blocks.clone())
    }

    fn persist(&mut self, blocks: &[Block]) -> Result<(), StorageError> {
        self.blocks = Some(blocks.to_vec());
        Ok(())
    }
}

/// Stores the chain as a pretty-printed JSON array of block records
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        JsonFileStore {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ChainStore for JsonFileStore {
    fn load(&self) -> Result<Option<Vec<Block>>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)?;
        let records: Vec<Value> = serde_json::from_str(&contents).map_err(|e| {
            StorageError::MalformedRecord {
                position: 0,
                reason: format!("{} is not a JSON array of blocks: {}", self.path.display(), e),
            }
        })?;

        let blocks = records
            .into_iter()
            .enumerate()
            .map(|(position, record)| decode_record(position, record))
            .collect::<Result<Vec<_>, _>>()?;

        info!("Loaded {} blocks from {}", blocks.len(), self.path.display());
        Ok(Some(blocks))
    }

    fn persist(&mut self, blocks: &[Block]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write beside the target and rename so a crash never leaves half a file
        let staging = self.path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(fs::File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, blocks)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            writer.flush()?;
        }
        fs::rename(&staging, &self.path)?;

        Ok(())
    }
}

/// Storage for blockchain data in an embedded sled database
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Tree for blocks, keyed by big-endian position
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .finish()
    }
}

impl SledStore {
    /// Opens (or creates) the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            metadata,
        })
    }

    /// Gets the latest block hash
    pub fn latest_block_hash(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .metadata
            .get("latest_block_hash")?
            .map(|value| String::from_utf8_lossy(&value).to_string()))
    }

    /// Gets the position of the last stored block
    pub fn block_height(&self) -> Result<Option<u64>, StorageError> {
        match self.metadata.get("block_height")? {
            Some(value) => {
                let height: u64 = bincode::deserialize(&value)
                    .map_err(|e| StorageError::SerializationError(e.to_string()))?;
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// Position of the first block not yet stored, or 0 if the stored
    /// blocks are not a prefix of `blocks`
    fn resume_position(&self, blocks: &[Block]) -> Result<usize, StorageError> {
        let (height, hash) = match (self.block_height()?, self.latest_block_hash()?) {
            (Some(height), Some(hash)) => (height, hash),
            _ => return Ok(0),
        };

        let tip = usize::try_from(height)
            .ok()
            .filter(|&tip| blocks.get(tip).map_or(false, |block| block.hash() == hash));
        Ok(tip.map_or(0, |tip| tip + 1))
    }
}

impl ChainStore for SledStore {
    fn load(&self) -> Result<Option<Vec<Block>>, StorageError> {
        if self.blocks.is_empty() {
            return Ok(None);
        }

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (position, result) in self.blocks.iter().enumerate() {
            let (_, value) = result?;
            let record: Value =
                serde_json::from_slice(&value).map_err(|e| StorageError::MalformedRecord {
                    position,
                    reason: e.to_string(),
                })?;
            blocks.push(decode_record(position, record)?);
        }

        info!("Loaded {} blocks from sled", blocks.len());
        Ok(Some(blocks))
    }

    fn persist(&mut self, blocks: &[Block]) -> Result<(), StorageError> {
        let last = match blocks.last() {
            Some(last) => last,
            None => {
                self.blocks.clear()?;
                self.metadata.clear()?;
                return self.flush();
            }
        };

        let start = self.resume_position(blocks)?;
        let mut batch = Batch::default();

        if start == 0 {
            if !self.blocks.is_empty() {
                warn!("Stored blocks diverge from the chain; rewriting");
            }
            for key in self.blocks.range(block_key(blocks.len() as u64)..).keys() {
                batch.remove(key?);
            }
        }

        for (position, block) in blocks.iter().enumerate().skip(start) {
            let value = serde_json::to_vec(block)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            batch.insert(block_key(position as u64), value);
        }

        let height = bincode::serialize(&((blocks.len() - 1) as u64))
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        // Blocks and metadata commit atomically
        let committed: TransactionResult<(), sled::Error> = (&self.blocks, &self.metadata)
            .transaction(|(tx_blocks, tx_metadata)| {
                tx_blocks.apply_batch(&batch)?;
                tx_metadata.insert("latest_block_hash", last.hash().as_bytes())?;
                tx_metadata.insert("block_height", height.as_slice())?;
                Ok(())
            });
        committed.map_err(|err| match err {
            TransactionError::Abort(err) | TransactionError::Storage(err) => {
                StorageError::DatabaseError(err)
            }
        })?;

        self.flush()
    }
}

/// Big-endian key so sled iterates blocks in chain order
fn block_key(position: u64) -> Vec<u8> {
    position.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::UnsealedBlock;
    use serde_json::json;

    fn sample_blocks() -> Vec<Block> {
        let genesis = UnsealedBlock::genesis(1.0).seal_with_validator("system".to_string());
        let next = UnsealedBlock::new(
            1,
            genesis.hash().to_string(),
            json!({"Name": "Ada", "Roll Number": "7"}),
            2.0,
        )
        .seal_with_validator("Alice".to_string());
        vec![genesis, next]
    }

    fn extend(blocks: &mut Vec<Block>, validator: &str) {
        let last = &blocks[blocks.len() - 1];
        let block = UnsealedBlock::new(
            last.index() + 1,
            last.hash().to_string(),
            json!({"Name": validator}),
            last.index() as f64 + 10.0,
        )
        .seal_with_validator(validator.to_string());
        blocks.push(block);
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());

        store.persist(&sample_blocks()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample_blocks()));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");
        let mut store = JsonFileStore::new(&path);

        assert!(store.load().unwrap().is_none());
        store.persist(&sample_blocks()).unwrap();

        assert_eq!(store.load().unwrap(), Some(sample_blocks()));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_store_reports_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let mut records = serde_json::to_value(sample_blocks()).unwrap();
        records[1].as_object_mut().unwrap().remove("hash");
        fs::write(&path, records.to_string()).unwrap();

        let err = JsonFileStore::new(&path).load().unwrap_err();
        match err {
            StorageError::MalformedRecord { position, reason } => {
                assert_eq!(position, 1);
                assert!(reason.contains("hash"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_json_store_rejects_wrong_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let mut records = serde_json::to_value(sample_blocks()).unwrap();
        records[0]["index"] = json!("zero");
        fs::write(&path, records.to_string()).unwrap();

        assert!(matches!(
            JsonFileStore::new(&path).load(),
            Err(StorageError::MalformedRecord { position: 0, .. })
        ));
    }

    #[test]
    fn test_sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = sample_blocks();

        {
            let mut store = SledStore::new(dir.path()).unwrap();
            assert!(store.load().unwrap().is_none());

            store.persist(&blocks[..1]).unwrap();
            store.persist(&blocks).unwrap();

            assert_eq!(store.block_height().unwrap(), Some(1));
            assert_eq!(
                store.latest_block_hash().unwrap().as_deref(),
                Some(blocks[1].hash())
            );
        }

        let store = SledStore::new(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), Some(blocks));
    }

    #[test]
    fn test_sled_store_replaces_rolled_back_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SledStore::new(dir.path()).unwrap();

        // The store kept a block the chain later dropped
        let mut abandoned = sample_blocks();
        store.persist(&abandoned).unwrap();
        abandoned.pop();

        let mut blocks = abandoned;
        extend(&mut blocks, "Bob");
        extend(&mut blocks, "Carol");
        store.persist(&blocks).unwrap();

        assert_eq!(store.load().unwrap(), Some(blocks.clone()));
        assert_eq!(store.block_height().unwrap(), Some(2));
        assert_eq!(
            store.latest_block_hash().unwrap().as_deref(),
            Some(blocks[2].hash())
        );
    }

    #[test]
    fn test_sled_store_shrinks_to_shorter_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SledStore::new(dir.path()).unwrap();

        let mut blocks = sample_blocks();
        extend(&mut blocks, "Bob");
        store.persist(&blocks).unwrap();

        blocks.truncate(2);
        store.persist(&blocks).unwrap();

        assert_eq!(store.load().unwrap(), Some(blocks.clone()));
        assert_eq!(store.block_height().unwrap(), Some(1));
    }

    #[test]
    fn test_sled_store_skips_blocks_already_stored() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SledStore::new(dir.path()).unwrap();
        let mut blocks = sample_blocks();

        store.persist(&blocks).unwrap();
        assert_eq!(store.resume_position(&blocks).unwrap(), 2);

        extend(&mut blocks, "Bob");
        assert_eq!(store.resume_position(&blocks).unwrap(), 2);
        store.persist(&blocks).unwrap();
        assert_eq!(store.load().unwrap(), Some(blocks));
    }
}
