use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use log::{debug, error, info, warn};

use ghostchain_common::{
    block::{calculate_merkle_root, Block, Height},
    crypto::{Hash, Hashable},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimestampMillis,
};

use crate::{
    config::BLOCK_INDEX_SNAPSHOT_INTERVAL,
    core::error::{BlockchainError, DiskContext},
};

const BLOCKS_DIR: &str = "blocks";
const INDEX_FILE: &str = "index.dat";

/// One record of the in-memory block index and of the `index.dat`
/// snapshot. `offset` is where the block starts inside its file; with
/// one block per file it is always zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMetadata {
    pub hash: Hash,
    pub timestamp: TimestampMillis,
    pub tx_count: u32,
    pub offset: u64,
}

impl Serializer for BlockMetadata {
    fn write(&self, writer: &mut Writer) {
        self.hash.write(writer);
        writer.write_u64(self.timestamp);
        writer.write_u32(self.tx_count);
        writer.write_u64(self.offset);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let hash = Hash::read(reader)?;
        let timestamp = reader.read_u64()?;
        let tx_count = reader.read_u32()?;
        let offset = reader.read_u64()?;
        Ok(BlockMetadata {
            hash,
            timestamp,
            tx_count,
            offset,
        })
    }

    fn size(&self) -> usize {
        self.hash.size() + 8 + 4 + 8
    }
}

/// Durable block store: one canonical-encoded file per height under
/// `blocks/`, an in-memory index both ways (height to metadata, hash to
/// height) and a periodically rewritten `index.dat` snapshot. The index
/// is always rebuildable by scanning the directory, and the scan wins
/// over a stale snapshot.
pub struct BlockStore {
    blocks_dir: PathBuf,
    index: BTreeMap<Height, BlockMetadata>,
    hash_index: HashMap<Hash, Height>,
    blocks_since_snapshot: u64,
}

impl BlockStore {
    pub fn open(data_dir: &Path) -> Result<Self, BlockchainError> {
        let blocks_dir = data_dir.join(BLOCKS_DIR);
        fs::create_dir_all(&blocks_dir).map_err(|source| BlockchainError::IoError {
            context: DiskContext::BlockIndex,
            source,
        })?;

        let mut store = Self {
            blocks_dir,
            index: BTreeMap::new(),
            hash_index: HashMap::new(),
            blocks_since_snapshot: 0,
        };
        store.load_index()?;
        Ok(store)
    }

    fn block_path(&self, height: Height) -> PathBuf {
        self.blocks_dir.join(format!("block_{:010}.dat", height))
    }

    fn index_path(&self) -> PathBuf {
        self.blocks_dir.join(INDEX_FILE)
    }

    // Load the index snapshot, then reconcile it against a directory
    // scan. Any disagreement discards the snapshot.
    fn load_index(&mut self) -> Result<(), BlockchainError> {
        let snapshot = self.read_index_snapshot();
        let scanned_heights = self.scan_heights()?;

        if let Some(snapshot) = snapshot {
            let snapshot_heights: Vec<Height> = snapshot.keys().copied().collect();
            if snapshot_heights == scanned_heights {
                for (height, metadata) in &snapshot {
                    self.hash_index.insert(metadata.hash.clone(), *height);
                }
                self.index = snapshot;
                debug!("block index snapshot loaded, {} blocks", self.index.len());
                return Ok(());
            }
            warn!(
                "block index snapshot disagrees with directory scan ({} vs {} blocks), rebuilding",
                snapshot_heights.len(),
                scanned_heights.len()
            );
        }

        self.rebuild_index(&scanned_heights)?;
        if !scanned_heights.is_empty() {
            self.write_index_snapshot()?;
        }
        Ok(())
    }

    fn read_index_snapshot(&self) -> Option<BTreeMap<Height, BlockMetadata>> {
        let bytes = fs::read(self.index_path()).ok()?;
        let mut reader = Reader::new(&bytes);
        let count = reader.read_u32().ok()? as usize;
        let mut index = BTreeMap::new();
        for _ in 0..count {
            let height = reader.read_u64().ok()?;
            let metadata = BlockMetadata::read(&mut reader).ok()?;
            index.insert(height, metadata);
        }
        Some(index)
    }

    fn scan_heights(&self) -> Result<Vec<Height>, BlockchainError> {
        let mut heights = Vec::new();
        let entries = fs::read_dir(&self.blocks_dir).map_err(|source| BlockchainError::IoError {
            context: DiskContext::BlockIndex,
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| BlockchainError::IoError {
                context: DiskContext::BlockIndex,
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(height) = name
                .strip_prefix("block_")
                .and_then(|rest| rest.strip_suffix(".dat"))
                .and_then(|digits| digits.parse::<Height>().ok())
            {
                heights.push(height);
            }
        }
        heights.sort_unstable();
        Ok(heights)
    }

    fn rebuild_index(&mut self, heights: &[Height]) -> Result<(), BlockchainError> {
        self.index.clear();
        self.hash_index.clear();
        for height in heights {
            let block = self.read_block(*height)?;
            self.insert_index_entry(*height, &block);
        }
        if !heights.is_empty() {
            info!("block index rebuilt from scan, {} blocks", heights.len());
        }
        Ok(())
    }

    fn insert_index_entry(&mut self, height: Height, block: &Block) {
        let metadata = BlockMetadata {
            hash: block.get_hash().clone(),
            timestamp: block.get_timestamp(),
            tx_count: block.get_txs_count() as u32,
            offset: 0,
        };
        self.hash_index.insert(metadata.hash.clone(), height);
        self.index.insert(height, metadata);
    }

    fn write_index_snapshot(&mut self) -> Result<(), BlockchainError> {
        let mut writer = Writer::new();
        writer.write_u32(self.index.len() as u32);
        for (height, metadata) in &self.index {
            writer.write_u64(*height);
            metadata.write(&mut writer);
        }

        let path = self.index_path();
        let io_err = |source| BlockchainError::IoError {
            context: DiskContext::BlockIndex,
            source,
        };
        let mut file = File::create(&path).map_err(io_err)?;
        file.write_all(writer.as_slice()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        self.blocks_since_snapshot = 0;
        Ok(())
    }

    fn read_block(&self, height: Height) -> Result<Block, BlockchainError> {
        let path = self.block_path(height);
        if !path.exists() {
            return Err(BlockchainError::BlockNotFound(height));
        }
        let io_err = |source| BlockchainError::IoError {
            context: DiskContext::BlockFile(height),
            source,
        };
        let mut bytes = Vec::new();
        File::open(&path)
            .map_err(io_err)?
            .read_to_end(&mut bytes)
            .map_err(io_err)?;
        Block::from_bytes(&bytes).map_err(|e| {
            BlockchainError::Corruption(format!("block file at height {} undecodable: {}", height, e))
        })
    }

    /// Persist a block and index it. The block file is fsynced before the
    /// call returns; the index snapshot is rewritten every
    /// `BLOCK_INDEX_SNAPSHOT_INTERVAL` blocks and rebuilt from a scan
    /// after a crash in between.
    pub fn put_block(&mut self, block: &Block) -> Result<(), BlockchainError> {
        let height = block.get_height();
        let path = self.block_path(height);
        let io_err = |source| BlockchainError::IoError {
            context: DiskContext::BlockFile(height),
            source,
        };

        let mut file = File::create(&path).map_err(io_err)?;
        file.write_all(&block.to_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        self.insert_index_entry(height, block);
        self.blocks_since_snapshot += 1;
        if self.blocks_since_snapshot >= BLOCK_INDEX_SNAPSHOT_INTERVAL {
            self.write_index_snapshot()?;
        }
        Ok(())
    }

    pub fn get_block(&self, height: Height) -> Result<Block, BlockchainError> {
        if !self.index.contains_key(&height) {
            return Err(BlockchainError::BlockNotFound(height));
        }
        self.read_block(height)
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, BlockchainError> {
        let height = self
            .hash_index
            .get(hash)
            .copied()
            .ok_or_else(|| BlockchainError::BlockHashNotFound(hash.clone()))?;
        self.read_block(height)
    }

    pub fn get_height_for_hash(&self, hash: &Hash) -> Option<Height> {
        self.hash_index.get(hash).copied()
    }

    pub fn get_metadata(&self, height: Height) -> Option<&BlockMetadata> {
        self.index.get(&height)
    }

    pub fn has_blocks(&self) -> bool {
        !self.index.is_empty()
    }

    /// Maximum indexed height, 0 when the store is empty.
    pub fn latest_height(&self) -> Height {
        self.index.keys().next_back().copied().unwrap_or(0)
    }

    /// Delete every block above `height`, both on disk and in the
    /// indexes. Used by fork resolution; returns the removed blocks so
    /// the caller can unindex their transactions.
    pub fn pop_blocks_above(&mut self, height: Height) -> Result<Vec<Block>, BlockchainError> {
        let doomed: Vec<Height> = self
            .index
            .keys()
            .copied()
            .filter(|h| *h > height)
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for h in doomed {
            let block = self.read_block(h)?;
            fs::remove_file(self.block_path(h)).map_err(|source| BlockchainError::IoError {
                context: DiskContext::BlockFile(h),
                source,
            })?;
            if let Some(metadata) = self.index.remove(&h) {
                self.hash_index.remove(&metadata.hash);
            }
            removed.push(block);
        }
        if !removed.is_empty() {
            self.write_index_snapshot()?;
        }
        Ok(removed)
    }

    /// Flush the index snapshot regardless of the rewrite interval.
    pub fn flush(&mut self) -> Result<(), BlockchainError> {
        if self.has_blocks() {
            self.write_index_snapshot()?;
        }
        Ok(())
    }

    /// Walk the chain from height 1 upward, asserting that every stored
    /// block links to its predecessor and matches its own hash and
    /// merkle root. Pure with respect to storage; logs and reports the
    /// first violation.
    pub fn verify_chain(&self) -> Result<bool, BlockchainError> {
        if !self.has_blocks() {
            return Ok(true);
        }
        let latest = self.latest_height();
        let mut previous = self.get_block(0)?;
        for height in 1..=latest {
            let block = self.get_block(height)?;
            if block.get_previous_hash() != previous.get_hash() {
                error!(
                    "chain integrity violation at height {}: previous_hash {} != {}",
                    height,
                    block.get_previous_hash(),
                    previous.get_hash()
                );
                return Ok(false);
            }
            if &block.get_header().hash() != block.get_hash() {
                error!("chain integrity violation at height {}: header hash mismatch", height);
                return Ok(false);
            }
            if &calculate_merkle_root(block.get_transactions()) != block.get_merkle_root() {
                error!("chain integrity violation at height {}: merkle root mismatch", height);
                return Ok(false);
            }
            previous = block;
        }
        Ok(true)
    }
}
