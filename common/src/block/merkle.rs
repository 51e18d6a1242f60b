// Merkle root calculation for transaction lists

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::crypto::{Hash, Hashable};
use crate::transaction::Transaction;

/// Calculate the merkle root from a list of transactions.
///
/// This is a folded hash, not a binary tree: one SHA-256 hasher is fed
/// each transaction's canonical hash in block order and the final digest
/// is the root. The construction is part of the wire contract and must
/// be reproduced exactly; an empty list yields the digest of the empty
/// byte string.
pub fn calculate_merkle_root(transactions: &[Arc<Transaction>]) -> Hash {
    let mut hasher = Sha256::new();
    for tx in transactions {
        hasher.update(tx.hash().as_bytes());
    }
    Hash::new(hasher.finalize().into())
}
