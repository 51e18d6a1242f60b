use std::{
    fmt::{Display, Error, Formatter},
    ops::Deref,
    sync::Arc,
};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{calculate_merkle_root, BlockHeader};
use crate::{
    crypto::{Hash, Hashable},
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::{Transaction, ValidationError},
};

// Bound on transactions per block, protects decoding from hostile sizes
pub const MAX_BLOCK_TXS: usize = 10_000;

/// A committed or candidate block: header, body and the cached header
/// hash. Blocks are immutable once stored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    header: BlockHeader,
    transactions: Vec<Arc<Transaction>>,
    hash: Hash,
}

impl Block {
    /// Seal a header and body into a block, computing the header hash.
    pub fn new(header: BlockHeader, transactions: Vec<Arc<Transaction>>) -> Self {
        let hash = header.hash();
        Block {
            header,
            transactions,
            hash,
        }
    }

    pub fn get_header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn get_hash(&self) -> &Hash {
        &self.hash
    }

    pub fn get_txs_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn get_transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    pub fn split(self) -> (BlockHeader, Vec<Arc<Transaction>>) {
        (self.header, self.transactions)
    }

    /// Structural validation: the merkle root must match the body and the
    /// cached hash must match the header. No chain state is consulted.
    pub fn validate_structural(&self) -> Result<(), ValidationError> {
        if calculate_merkle_root(&self.transactions) != self.header.merkle_root {
            return Err(ValidationError::MerkleMismatch);
        }
        if self.header.hash() != self.hash {
            return Err(ValidationError::HashMismatch);
        }
        Ok(())
    }
}

impl Serializer for Block {
    fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        self.hash.write(writer);
        writer.write_u32(self.transactions.len() as u32);
        for tx in &self.transactions {
            tx.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Block, ReaderError> {
        let header = BlockHeader::read(reader)?;
        let hash = Hash::read(reader)?;
        let count = reader.read_u32()? as usize;
        if count > MAX_BLOCK_TXS {
            debug!("rejecting block with {} transactions", count);
            return Err(ReaderError::InvalidSize);
        }
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Arc::new(Transaction::read(reader)?));
        }
        Ok(Block {
            header,
            transactions,
            hash,
        })
    }

    fn size(&self) -> usize {
        self.header.size()
            + self.hash.size()
            + 4
            + self.transactions.iter().map(|tx| tx.size()).sum::<usize>()
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash {
        self.header.hash()
    }
}

impl Deref for Block {
    type Target = BlockHeader;

    fn deref(&self) -> &Self::Target {
        self.get_header()
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "Block[height: {}, hash: {}, previous: {}, txs: {}]",
            self.header.index,
            self.hash,
            self.header.previous_hash,
            self.transactions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asset::AssetKind,
        crypto::{Address, KeyPair},
    };

    fn build_block(amounts: &[u64]) -> Block {
        let keypair = KeyPair::new();
        let to = Address::from_public_key_bytes(&[3u8; 32]);
        let txs: Vec<Arc<Transaction>> = amounts
            .iter()
            .enumerate()
            .map(|(nonce, amount)| {
                Arc::new(Transaction::create(
                    &keypair,
                    to,
                    AssetKind::Gas,
                    *amount,
                    1,
                    nonce as u64,
                ))
            })
            .collect();
        let header = BlockHeader::new(1, 12345, Hash::zero(), calculate_merkle_root(&txs), 0);
        Block::new(header, txs)
    }

    #[test]
    fn test_block_roundtrip() {
        let block = build_block(&[10, 20, 30]);
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), block.size());
        let decoded = Block::from_bytes(&bytes).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn test_empty_block_is_structurally_valid() {
        let block = build_block(&[]);
        assert!(block.validate_structural().is_ok());
    }

    #[test]
    fn test_merkle_mismatch_detected() {
        let block = build_block(&[10]);
        let (mut header, txs) = block.split();
        header.merkle_root = Hash::zero();
        let tampered = Block::new(header, txs);
        assert_eq!(
            tampered.validate_structural(),
            Err(ValidationError::MerkleMismatch)
        );
    }

    #[test]
    fn test_hash_mismatch_detected() {
        let block = build_block(&[10]);
        let mut tampered = block.clone();
        tampered.hash = Hash::zero();
        assert_eq!(
            tampered.validate_structural(),
            Err(ValidationError::HashMismatch)
        );
    }
}
