use std::path::Path;

use ghostchain_common::{block::Height, crypto::Hash};

use crate::core::error::BlockchainError;

const TX_INDEX_DIR: &str = "tx_index";

/// Durable transaction index: canonical hash to `(height, position)`
/// within the committed chain.
pub struct TxIndexStore {
    db: sled::Db,
}

impl TxIndexStore {
    pub fn open(data_dir: &Path) -> Result<Self, BlockchainError> {
        let db = sled::open(data_dir.join(TX_INDEX_DIR))?;
        Ok(Self { db })
    }

    pub fn index_tx(
        &self,
        tx_hash: &Hash,
        height: Height,
        position: u32,
    ) -> Result<(), BlockchainError> {
        let mut value = [0u8; 12];
        value[..8].copy_from_slice(&height.to_le_bytes());
        value[8..].copy_from_slice(&position.to_le_bytes());
        self.db.insert(tx_hash.as_bytes(), value.to_vec())?;
        Ok(())
    }

    pub fn find_tx(&self, tx_hash: &Hash) -> Result<Option<(Height, u32)>, BlockchainError> {
        match self.db.get(tx_hash.as_bytes())? {
            Some(bytes) => {
                if bytes.len() != 12 {
                    return Err(BlockchainError::Corruption(
                        "malformed transaction index entry".into(),
                    ));
                }
                let height = u64::from_le_bytes(bytes[..8].try_into().unwrap());
                let position = u32::from_le_bytes(bytes[8..].try_into().unwrap());
                Ok(Some((height, position)))
            }
            None => Ok(None),
        }
    }

    /// Remove the entry of a transaction dropped by a chain rewind.
    pub fn unindex_tx(&self, tx_hash: &Hash) -> Result<(), BlockchainError> {
        self.db.remove(tx_hash.as_bytes())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), BlockchainError> {
        self.db.flush()?;
        Ok(())
    }
}
