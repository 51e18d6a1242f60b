use thiserror::Error;

use ghostchain_common::{
    asset::AssetKind,
    block::Height,
    crypto::Hash,
    serializer::ReaderError,
    transaction::ValidationError,
};

/// Where a storage read or write was issued from, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskContext {
    BlockFile(u64),
    BlockIndex,
    StateEntry,
    TxIndex,
}

impl std::fmt::Display for DiskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskContext::BlockFile(height) => write!(f, "block file at height {}", height),
            DiskContext::BlockIndex => write!(f, "block index"),
            DiskContext::StateEntry => write!(f, "state entry"),
            DiskContext::TxIndex => write!(f, "transaction index"),
        }
    }
}

/// Closed error taxonomy of the node core. Validation errors leave no
/// state change behind; storage errors abort the triggering operation
/// without mutating in-memory state.
#[derive(Debug, Error)]
pub enum BlockchainError {
    // Validation errors
    #[error("Invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("Transaction {0} is already known")]
    DuplicateTransaction(Hash),

    #[error("Insufficient GAS balance: need {need}, have {have}")]
    InsufficientGasBalance { need: u64, have: u64 },

    #[error("Insufficient {asset} balance: need {need}, have {have}")]
    InsufficientTokenBalance {
        asset: AssetKind,
        need: u64,
        have: u64,
    },

    #[error("Balance overflow on {0}")]
    Overflow(AssetKind),

    #[error("Supply cap exceeded for {0}")]
    SupplyCapExceeded(AssetKind),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Previous hash of block {height} does not match the chain tip")]
    PreviousHashMismatch { height: Height },

    #[error("Block height {got} does not extend the chain at {expected}")]
    InvalidBlockHeight { expected: Height, got: Height },

    // Resource errors
    #[error("Mempool is full")]
    MempoolFull,

    #[error("Peer table is full")]
    PeerTableFull,

    #[error("Rate limited")]
    RateLimited,

    // Consensus errors
    #[error("No active validator, block production is paused")]
    NoLeader,

    #[error("Not the leader for height {0}")]
    StaleLeader(Height),

    // Storage errors
    #[error("Storage I/O error on {context}: {source}")]
    IoError {
        context: DiskContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("Storage corruption detected: {0}")]
    Corruption(String),

    #[error("Block at height {0} not found")]
    BlockNotFound(Height),

    #[error("Block {0} not found")]
    BlockHashNotFound(Hash),

    #[error(transparent)]
    Decoding(#[from] ReaderError),

    // Genesis / configuration
    #[error("Genesis error: {0}")]
    Genesis(String),

    #[error("Contract execution failed: {0}")]
    ContractExecution(String),

    #[error("Chain rewind failed: {0}")]
    RewindFailed(String),
}

impl BlockchainError {
    /// Validation failures are reported and dropped; they never poison
    /// the chain state or the connection.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BlockchainError::InvalidNonce { .. }
                | BlockchainError::DuplicateTransaction(_)
                | BlockchainError::InsufficientGasBalance { .. }
                | BlockchainError::InsufficientTokenBalance { .. }
                | BlockchainError::Overflow(_)
                | BlockchainError::SupplyCapExceeded(_)
                | BlockchainError::Validation(_)
                | BlockchainError::PreviousHashMismatch { .. }
                | BlockchainError::InvalidBlockHeight { .. }
        )
    }
}
