mod block_store;
mod state;
mod tx_index;

pub use block_store::{BlockMetadata, BlockStore};
pub use state::StateStore;
pub use tx_index::TxIndexStore;

use std::path::Path;

use async_trait::async_trait;
use log::debug;

use ghostchain_common::{
    account::Account,
    asset::AssetKind,
    block::{Block, Height},
    crypto::{Address, Hash},
};

use super::{error::BlockchainError, validator::Validator};

/// Durable block storage keyed by height and hash.
#[async_trait]
pub trait BlockProvider {
    async fn put_block(&mut self, block: &Block) -> Result<(), BlockchainError>;

    async fn get_block(&self, height: Height) -> Result<Block, BlockchainError>;

    async fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, BlockchainError>;

    async fn get_height_for_hash(&self, hash: &Hash) -> Option<Height>;

    async fn get_block_metadata(&self, height: Height) -> Option<BlockMetadata>;

    async fn has_blocks(&self) -> bool;

    async fn latest_height(&self) -> Height;

    /// Remove every block above `height`; returns them in ascending order.
    async fn pop_blocks_above(&mut self, height: Height) -> Result<Vec<Block>, BlockchainError>;

    /// Re-check invariant 4 and 5 over the whole stored chain.
    async fn verify_chain(&self) -> Result<bool, BlockchainError>;
}

/// Durable byte-keyed state map plus typed derived-state helpers.
#[async_trait]
pub trait StateProvider {
    async fn put_state(&mut self, key: &[u8], value: &[u8]) -> Result<(), BlockchainError>;

    async fn get_state(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockchainError>;

    async fn put_account_snapshot(
        &mut self,
        address: &Address,
        account: &Account,
    ) -> Result<(), BlockchainError>;

    async fn get_account_snapshots(&self) -> Result<Vec<(Address, Account)>, BlockchainError>;

    async fn put_supply(&mut self, asset: AssetKind, supply: u64) -> Result<(), BlockchainError>;

    async fn get_supply(&self, asset: AssetKind) -> Result<Option<u64>, BlockchainError>;

    async fn put_validator(&mut self, validator: &Validator) -> Result<(), BlockchainError>;

    async fn delete_validator(&mut self, address: &Address) -> Result<(), BlockchainError>;

    async fn get_validators(&self) -> Result<Vec<Validator>, BlockchainError>;

    async fn get_snapshot_height(&self) -> Result<Option<Height>, BlockchainError>;

    async fn set_snapshot_height(&mut self, height: Height) -> Result<(), BlockchainError>;

    async fn clear_state(&mut self) -> Result<(), BlockchainError>;
}

/// Transaction hash to chain position index.
#[async_trait]
pub trait TxIndexProvider {
    async fn index_tx(
        &mut self,
        tx_hash: &Hash,
        height: Height,
        position: u32,
    ) -> Result<(), BlockchainError>;

    async fn find_tx(&self, tx_hash: &Hash) -> Result<Option<(Height, u32)>, BlockchainError>;

    async fn unindex_tx(&mut self, tx_hash: &Hash) -> Result<(), BlockchainError>;
}

/// The full storage engine contract the chain is generic over.
#[async_trait]
pub trait Storage: BlockProvider + StateProvider + TxIndexProvider + Send + Sync + 'static {
    /// Fsync all pending writes, called on shutdown.
    async fn flush(&mut self) -> Result<(), BlockchainError>;
}

/// Default storage engine: file-per-block store plus two sled databases
/// for derived state and the transaction index, all under one data
/// directory.
pub struct ChainStorage {
    blocks: BlockStore,
    state: StateStore,
    tx_index: TxIndexStore,
}

impl ChainStorage {
    pub fn open(data_dir: &Path) -> Result<Self, BlockchainError> {
        debug!("opening storage at {}", data_dir.display());
        Ok(Self {
            blocks: BlockStore::open(data_dir)?,
            state: StateStore::open(data_dir)?,
            tx_index: TxIndexStore::open(data_dir)?,
        })
    }
}

#[async_trait]
impl BlockProvider for ChainStorage {
    async fn put_block(&mut self, block: &Block) -> Result<(), BlockchainError> {
        self.blocks.put_block(block)
    }

    async fn get_block(&self, height: Height) -> Result<Block, BlockchainError> {
        self.blocks.get_block(height)
    }

    async fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, BlockchainError> {
        self.blocks.get_block_by_hash(hash)
    }

    async fn get_height_for_hash(&self, hash: &Hash) -> Option<Height> {
        self.blocks.get_height_for_hash(hash)
    }

    async fn get_block_metadata(&self, height: Height) -> Option<BlockMetadata> {
        self.blocks.get_metadata(height).cloned()
    }

    async fn has_blocks(&self) -> bool {
        self.blocks.has_blocks()
    }

    async fn latest_height(&self) -> Height {
        self.blocks.latest_height()
    }

    async fn pop_blocks_above(&mut self, height: Height) -> Result<Vec<Block>, BlockchainError> {
        self.blocks.pop_blocks_above(height)
    }

    async fn verify_chain(&self) -> Result<bool, BlockchainError> {
        self.blocks.verify_chain()
    }
}

#[async_trait]
impl StateProvider for ChainStorage {
    async fn put_state(&mut self, key: &[u8], value: &[u8]) -> Result<(), BlockchainError> {
        self.state.put_state(key, value)
    }

    async fn get_state(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockchainError> {
        self.state.get_state(key)
    }

    async fn put_account_snapshot(
        &mut self,
        address: &Address,
        account: &Account,
    ) -> Result<(), BlockchainError> {
        if account.is_empty() {
            self.state.delete_account(address)
        } else {
            self.state.put_account(address, account)
        }
    }

    async fn get_account_snapshots(&self) -> Result<Vec<(Address, Account)>, BlockchainError> {
        self.state.accounts()
    }

    async fn put_supply(&mut self, asset: AssetKind, supply: u64) -> Result<(), BlockchainError> {
        self.state.put_supply(asset, supply)
    }

    async fn get_supply(&self, asset: AssetKind) -> Result<Option<u64>, BlockchainError> {
        self.state.get_supply(asset)
    }

    async fn put_validator(&mut self, validator: &Validator) -> Result<(), BlockchainError> {
        self.state.put_validator(validator)
    }

    async fn delete_validator(&mut self, address: &Address) -> Result<(), BlockchainError> {
        self.state.delete_validator(address)
    }

    async fn get_validators(&self) -> Result<Vec<Validator>, BlockchainError> {
        self.state.validators()
    }

    async fn get_snapshot_height(&self) -> Result<Option<Height>, BlockchainError> {
        self.state.get_snapshot_height()
    }

    async fn set_snapshot_height(&mut self, height: Height) -> Result<(), BlockchainError> {
        self.state.set_snapshot_height(height)
    }

    async fn clear_state(&mut self) -> Result<(), BlockchainError> {
        self.state.clear()
    }
}

#[async_trait]
impl TxIndexProvider for ChainStorage {
    async fn index_tx(
        &mut self,
        tx_hash: &Hash,
        height: Height,
        position: u32,
    ) -> Result<(), BlockchainError> {
        self.tx_index.index_tx(tx_hash, height, position)
    }

    async fn find_tx(&self, tx_hash: &Hash) -> Result<Option<(Height, u32)>, BlockchainError> {
        self.tx_index.find_tx(tx_hash)
    }

    async fn unindex_tx(&mut self, tx_hash: &Hash) -> Result<(), BlockchainError> {
        self.tx_index.unindex_tx(tx_hash)
    }
}

#[async_trait]
impl Storage for ChainStorage {
    async fn flush(&mut self) -> Result<(), BlockchainError> {
        self.blocks.flush()?;
        self.state.flush()?;
        self.tx_index.flush()
    }
}
