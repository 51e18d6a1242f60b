use std::{collections::HashMap, sync::Arc};

use indexmap::IndexMap;
use log::{debug, trace};
use serde::Serialize;

use ghostchain_common::{
    asset::AssetKind,
    crypto::{Address, Hash, Hashable},
    time::{get_current_time_in_millis, TimestampMillis},
    transaction::Transaction,
};

use super::{error::BlockchainError, ledger::TokenLedger};

/// A transaction admitted to the pool, waiting for inclusion.
pub struct PendingTransaction {
    tx: Arc<Transaction>,
    inserted_at: TimestampMillis,
}

impl PendingTransaction {
    pub fn get_tx(&self) -> &Arc<Transaction> {
        &self.tx
    }

    pub fn get_inserted_at(&self) -> TimestampMillis {
        self.inserted_at
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct MempoolStats {
    pub pending: usize,
    pub capacity: usize,
    pub utilization: f64,
}

/// Bounded, validated buffer of pending transactions.
///
/// Selection order is FIFO by admission order: the underlying map keeps
/// insertion order, and `select` walks it front to back. Admission
/// serializes on the single pool lock held by the chain, which makes the
/// FIFO order identical on every node fed the same input order.
pub struct Mempool {
    // insertion order is the selection order
    txs: IndexMap<Hash, PendingTransaction>,
    // next admissible nonce per sender, including pending transactions
    account_nonces: HashMap<Address, u64>,
    capacity: usize,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            txs: IndexMap::new(),
            account_nonces: HashMap::new(),
            capacity,
        }
    }

    /// Validate and admit a transaction. The checks run in a fixed order
    /// so every node accepts or rejects with the same error kind.
    pub fn add_tx(
        &mut self,
        tx: Arc<Transaction>,
        ledger: &TokenLedger,
    ) -> Result<Hash, BlockchainError> {
        if self.txs.len() >= self.capacity {
            return Err(BlockchainError::MempoolFull);
        }

        tx.validate_structural()?;

        let hash = tx.hash();
        if self.txs.contains_key(&hash) {
            return Err(BlockchainError::DuplicateTransaction(hash));
        }

        tx.validate_signature()?;

        let from = *tx.get_from();
        let expected = self
            .account_nonces
            .get(&from)
            .copied()
            .unwrap_or_else(|| ledger.get_nonce(&from));
        if tx.get_nonce() != expected {
            return Err(BlockchainError::InvalidNonce {
                expected,
                got: tx.get_nonce(),
            });
        }

        let gas_have = ledger.get_balance(&from, AssetKind::Gas);
        let asset = tx.get_asset();
        if asset == AssetKind::Gas {
            let need = tx
                .get_gas_fee()
                .checked_add(tx.get_amount())
                .ok_or(BlockchainError::Overflow(AssetKind::Gas))?;
            if gas_have < need {
                return Err(BlockchainError::InsufficientGasBalance {
                    need,
                    have: gas_have,
                });
            }
        } else {
            if gas_have < tx.get_gas_fee() {
                return Err(BlockchainError::InsufficientGasBalance {
                    need: tx.get_gas_fee(),
                    have: gas_have,
                });
            }
            let have = ledger.get_balance(&from, asset);
            if have < tx.get_amount() {
                return Err(BlockchainError::InsufficientTokenBalance {
                    asset,
                    need: tx.get_amount(),
                    have,
                });
            }
        }

        trace!("mempool accepted tx {} from {}", hash, from);
        self.txs.insert(
            hash.clone(),
            PendingTransaction {
                tx,
                inserted_at: get_current_time_in_millis(),
            },
        );
        self.account_nonces.insert(from, expected + 1);
        Ok(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.txs.contains_key(hash)
    }

    pub fn get_tx(&self, hash: &Hash) -> Option<&Arc<Transaction>> {
        self.txs.get(hash).map(|pending| &pending.tx)
    }

    /// Up to `max_count` transactions in FIFO order.
    pub fn select(&self, max_count: usize) -> Vec<Arc<Transaction>> {
        self.txs
            .values()
            .take(max_count)
            .map(|pending| pending.tx.clone())
            .collect()
    }

    /// Drop a committed transaction. The sender's tentative nonce stays:
    /// later pending transactions of the same sender remain admissible.
    pub fn remove(&mut self, hash: &Hash) {
        if let Some(pending) = self.txs.shift_remove(hash) {
            let from = *pending.tx.get_from();
            if !self.has_pending_from(&from) {
                self.account_nonces.remove(&from);
            }
        }
    }

    /// Evict a transaction that failed to apply, along with every later
    /// pending transaction of the same sender (their nonces can no
    /// longer fit), and roll back the tentative nonce increments.
    pub fn evict(&mut self, hash: &Hash) {
        let Some(pending) = self.txs.shift_remove(hash) else {
            return;
        };
        let from = *pending.tx.get_from();
        let nonce = pending.tx.get_nonce();

        let stale: Vec<Hash> = self
            .txs
            .values()
            .filter(|p| p.tx.get_from() == &from && p.tx.get_nonce() > nonce)
            .map(|p| p.tx.hash())
            .collect();
        for hash in &stale {
            self.txs.shift_remove(hash);
        }

        if self.has_pending_from(&from) {
            self.account_nonces.insert(from, nonce);
        } else {
            self.account_nonces.remove(&from);
        }
        debug!(
            "evicted tx {} and {} dependents from sender {}",
            hash,
            stale.len(),
            from
        );
    }

    /// Periodic maintenance: drop transactions whose nonce was consumed
    /// by a block that arrived through sync rather than local production.
    pub fn cleanup(&mut self, ledger: &TokenLedger) {
        let stale: Vec<Hash> = self
            .txs
            .values()
            .filter(|pending| pending.tx.get_nonce() < ledger.get_nonce(pending.tx.get_from()))
            .map(|pending| pending.tx.hash())
            .collect();
        for hash in &stale {
            self.remove(hash);
        }
        if !stale.is_empty() {
            debug!("mempool cleanup dropped {} stale transactions", stale.len());
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            pending: self.txs.len(),
            capacity: self.capacity,
            utilization: self.txs.len() as f64 / self.capacity as f64,
        }
    }

    fn has_pending_from(&self, from: &Address) -> bool {
        self.txs.values().any(|pending| pending.tx.get_from() == from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostchain_common::crypto::KeyPair;

    fn funded_ledger(keypair: &KeyPair, gas: u64) -> TokenLedger {
        let mut ledger = TokenLedger::new();
        ledger
            .mint(&keypair.get_address(), AssetKind::Gas, gas)
            .unwrap();
        ledger
    }

    fn tx(keypair: &KeyPair, amount: u64, gas_fee: u64, nonce: u64) -> Arc<Transaction> {
        let to = Address::from_public_key_bytes(&[42u8; 32]);
        Arc::new(Transaction::create(
            keypair,
            to,
            AssetKind::Gas,
            amount,
            gas_fee,
            nonce,
        ))
    }

    #[test]
    fn test_fifo_selection_order() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 1_000);
        let mut mempool = Mempool::new(100);

        let first = tx(&keypair, 1, 1, 0);
        let second = tx(&keypair, 2, 1, 1);
        mempool.add_tx(first.clone(), &ledger).unwrap();
        mempool.add_tx(second.clone(), &ledger).unwrap();

        let selected = mempool.select(10);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].hash(), first.hash());
        assert_eq!(selected[1].hash(), second.hash());
    }

    #[test]
    fn test_capacity_limit() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 1_000);
        let mut mempool = Mempool::new(1);

        mempool.add_tx(tx(&keypair, 1, 1, 0), &ledger).unwrap();
        let err = mempool.add_tx(tx(&keypair, 2, 1, 1), &ledger).unwrap_err();
        assert!(matches!(err, BlockchainError::MempoolFull));
        assert_eq!(mempool.stats().pending, 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 1_000);
        let mut mempool = Mempool::new(100);

        let t = tx(&keypair, 1, 1, 0);
        mempool.add_tx(t.clone(), &ledger).unwrap();
        let err = mempool.add_tx(t, &ledger).unwrap_err();
        assert!(matches!(err, BlockchainError::DuplicateTransaction(_)));
    }

    #[test]
    fn test_nonce_gap_rejected_pool_unchanged() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 1_000);
        let mut mempool = Mempool::new(100);

        mempool.add_tx(tx(&keypair, 1, 1, 0), &ledger).unwrap();
        let before = mempool.len();
        let err = mempool.add_tx(tx(&keypair, 1, 1, 2), &ledger).unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::InvalidNonce { expected: 1, got: 2 }
        ));
        assert_eq!(mempool.len(), before);
    }

    #[test]
    fn test_insufficient_gas_rejected() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 5);
        let mut mempool = Mempool::new(100);

        let err = mempool.add_tx(tx(&keypair, 0, 10, 0), &ledger).unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::InsufficientGasBalance { need: 10, have: 5 }
        ));
    }

    #[test]
    fn test_gas_transfer_needs_fee_plus_amount() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 100);
        let mut mempool = Mempool::new(100);

        let err = mempool
            .add_tx(tx(&keypair, 95, 10, 0), &ledger)
            .unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::InsufficientGasBalance { need: 105, have: 100 }
        ));
    }

    #[test]
    fn test_evict_rolls_back_tentative_nonce() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 1_000);
        let mut mempool = Mempool::new(100);

        let first = tx(&keypair, 1, 1, 0);
        let second = tx(&keypair, 2, 1, 1);
        mempool.add_tx(first.clone(), &ledger).unwrap();
        mempool.add_tx(second, &ledger).unwrap();

        // evicting nonce 0 drops its dependent at nonce 1 as well
        mempool.evict(&first.hash());
        assert!(mempool.is_empty());

        // nonce 0 is admissible again
        mempool.add_tx(tx(&keypair, 3, 1, 0), &ledger).unwrap();
    }

    #[test]
    fn test_cleanup_drops_committed_nonces() {
        let keypair = KeyPair::new();
        let mut ledger = funded_ledger(&keypair, 1_000);
        let mut mempool = Mempool::new(100);

        let pending = tx(&keypair, 1, 1, 0);
        mempool.add_tx(pending.clone(), &ledger).unwrap();

        // the same nonce was committed through a synced block
        ledger.apply_transaction(&pending).unwrap();
        mempool.cleanup(&ledger);
        assert!(mempool.is_empty());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let keypair = KeyPair::new();
        let ledger = funded_ledger(&keypair, 1_000);
        let mut mempool = Mempool::new(100);

        let good = tx(&keypair, 1, 1, 0);
        let tampered = Arc::new(Transaction::new(
            *good.get_from(),
            *good.get_to(),
            good.get_asset(),
            good.get_amount() + 1,
            good.get_gas_fee(),
            good.get_nonce(),
            *good.get_public_key(),
            *good.get_signature(),
        ));
        let err = mempool.add_tx(tampered, &ledger).unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::Validation(
                ghostchain_common::transaction::ValidationError::InvalidSignature
            )
        ));
    }
}
