use std::collections::HashMap;

use log::trace;

use ghostchain_common::{
    account::Account,
    asset::{AssetKind, ASSET_COUNT},
    config::BRAND_SUPPLY_CAP,
    crypto::{Address, Hashable},
    transaction::Transaction,
};

use super::error::BlockchainError;

/// The authoritative in-memory account map of the four-asset economy.
///
/// All arithmetic is checked; a failed operation leaves the ledger
/// untouched. Gas is burned only when the whole transaction applies
/// (atomic rollback policy). The ledger is derived state: it can be
/// rebuilt at any time by replaying blocks from storage.
#[derive(Clone)]
pub struct TokenLedger {
    accounts: HashMap<Address, Account>,
    // total minted minus total burned, per asset
    supplies: [u64; ASSET_COUNT],
}

impl TokenLedger {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            supplies: [0; ASSET_COUNT],
        }
    }

    pub fn get_balance(&self, address: &Address, asset: AssetKind) -> u64 {
        self.accounts
            .get(address)
            .map(|account| account.get_balance(asset))
            .unwrap_or(0)
    }

    pub fn get_nonce(&self, address: &Address) -> u64 {
        self.accounts
            .get(address)
            .map(|account| account.get_nonce())
            .unwrap_or(0)
    }

    pub fn get_account(&self, address: &Address) -> Account {
        self.accounts.get(address).cloned().unwrap_or_default()
    }

    pub fn get_supply(&self, asset: AssetKind) -> u64 {
        self.supplies[asset.index()]
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    pub fn accounts_count(&self) -> usize {
        self.accounts.len()
    }

    /// Add to a balance without touching supply. Accounts are created
    /// lazily on first credit.
    pub fn credit(
        &mut self,
        address: &Address,
        asset: AssetKind,
        amount: u64,
    ) -> Result<(), BlockchainError> {
        let account = self.accounts.entry(*address).or_default();
        account
            .checked_credit(asset, amount)
            .ok_or(BlockchainError::Overflow(asset))?;
        Ok(())
    }

    /// Subtract from a balance without touching supply.
    pub fn debit(
        &mut self,
        address: &Address,
        asset: AssetKind,
        amount: u64,
    ) -> Result<(), BlockchainError> {
        if amount == 0 {
            return Ok(());
        }
        let have = self.get_balance(address, asset);
        let account = self
            .accounts
            .get_mut(address)
            .filter(|_| have >= amount)
            .ok_or_else(|| match asset {
                AssetKind::Gas => BlockchainError::InsufficientGasBalance { need: amount, have },
                _ => BlockchainError::InsufficientTokenBalance {
                    asset,
                    need: amount,
                    have,
                },
            })?;
        account
            .checked_debit(asset, amount)
            .ok_or(BlockchainError::Corruption(
                "balance changed under bounds check".into(),
            ))?;
        Ok(())
    }

    /// Atomic debit + credit between two accounts. Fails with the first
    /// applicable error; on failure no state changes.
    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        asset: AssetKind,
        amount: u64,
    ) -> Result<(), BlockchainError> {
        let have = self.get_balance(from, asset);
        if have < amount {
            return Err(match asset {
                AssetKind::Gas => BlockchainError::InsufficientGasBalance { need: amount, have },
                _ => BlockchainError::InsufficientTokenBalance {
                    asset,
                    need: amount,
                    have,
                },
            });
        }
        // check the credit side before mutating anything
        if self
            .get_balance(to, asset)
            .checked_add(amount)
            .is_none()
        {
            return Err(BlockchainError::Overflow(asset));
        }

        self.debit(from, asset, amount)?;
        self.credit(to, asset, amount)
    }

    /// Mint new supply onto an account. Only the genesis bootstrap and
    /// the protocol reward path call this; BRAND is hard-capped.
    pub fn mint(
        &mut self,
        address: &Address,
        asset: AssetKind,
        amount: u64,
    ) -> Result<(), BlockchainError> {
        let supply = self.supplies[asset.index()]
            .checked_add(amount)
            .ok_or(BlockchainError::Overflow(asset))?;
        if asset == AssetKind::Brand && supply > BRAND_SUPPLY_CAP {
            return Err(BlockchainError::SupplyCapExceeded(asset));
        }
        self.credit(address, asset, amount)?;
        self.supplies[asset.index()] = supply;
        Ok(())
    }

    /// Burn a gas fee: debits the account and reduces total GAS supply.
    pub fn burn_gas(&mut self, from: &Address, amount: u64) -> Result<(), BlockchainError> {
        self.debit(from, AssetKind::Gas, amount)?;
        self.supplies[AssetKind::Gas.index()] -= amount;
        Ok(())
    }

    /// Apply one transaction: burn the gas fee, transfer the asset and
    /// advance the sender nonce. All checks run before any mutation, so
    /// a failure leaves the ledger exactly as it was and no gas is
    /// burned.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), BlockchainError> {
        let from = tx.get_from();
        let asset = tx.get_asset();
        let amount = tx.get_amount();
        let gas_fee = tx.get_gas_fee();

        let expected = self.get_nonce(from);
        if tx.get_nonce() != expected {
            return Err(BlockchainError::InvalidNonce {
                expected,
                got: tx.get_nonce(),
            });
        }

        let gas_have = self.get_balance(from, AssetKind::Gas);
        let gas_need = if asset == AssetKind::Gas {
            gas_fee
                .checked_add(amount)
                .ok_or(BlockchainError::Overflow(AssetKind::Gas))?
        } else {
            gas_fee
        };
        if gas_have < gas_need {
            return Err(BlockchainError::InsufficientGasBalance {
                need: gas_need,
                have: gas_have,
            });
        }

        if asset != AssetKind::Gas && amount > 0 {
            let have = self.get_balance(from, asset);
            if have < amount {
                return Err(BlockchainError::InsufficientTokenBalance {
                    asset,
                    need: amount,
                    have,
                });
            }
        }

        if amount > 0
            && self
                .get_balance(tx.get_to(), asset)
                .checked_add(amount)
                .is_none()
        {
            return Err(BlockchainError::Overflow(asset));
        }

        // every check passed, mutate
        self.burn_gas(from, gas_fee)?;
        if amount > 0 {
            self.transfer(from, tx.get_to(), asset, amount)?;
        }
        self.accounts
            .entry(*from)
            .or_default()
            .increment_nonce();

        trace!(
            "applied tx {} from {} nonce {}",
            tx.hash(),
            from,
            expected
        );
        Ok(())
    }

    /// Apply every transaction of a block in order. On any failure the
    /// whole application is rolled back: a block containing an
    /// inapplicable transaction is invalid. The error names the failing
    /// position so the producer can evict the offender and retry.
    pub fn apply_block(
        &mut self,
        txs: &[std::sync::Arc<Transaction>],
    ) -> Result<(), BlockApplyError> {
        let snapshot = self.snapshot_for(txs.iter().flat_map(|tx| [*tx.get_from(), *tx.get_to()]));
        for (position, tx) in txs.iter().enumerate() {
            if let Err(error) = self.apply_transaction(tx) {
                self.restore(snapshot);
                return Err(BlockApplyError { position, error });
            }
        }
        Ok(())
    }

    // Copy of the accounts a block may touch, plus supplies, for rollback
    fn snapshot_for(
        &self,
        addresses: impl Iterator<Item = Address>,
    ) -> LedgerSnapshot {
        let mut accounts = HashMap::new();
        for address in addresses {
            accounts
                .entry(address)
                .or_insert_with(|| self.accounts.get(&address).cloned());
        }
        LedgerSnapshot {
            accounts,
            supplies: self.supplies,
        }
    }

    fn restore(&mut self, snapshot: LedgerSnapshot) {
        for (address, account) in snapshot.accounts {
            match account {
                Some(account) => {
                    self.accounts.insert(address, account);
                }
                None => {
                    self.accounts.remove(&address);
                }
            }
        }
        self.supplies = snapshot.supplies;
    }

    /// Overwrite an account record wholesale, used when restoring a
    /// ledger snapshot from the state KV.
    pub fn restore_account(&mut self, address: Address, account: Account) {
        if account.is_empty() {
            self.accounts.remove(&address);
        } else {
            self.accounts.insert(address, account);
        }
    }

    pub fn restore_supply(&mut self, asset: AssetKind, supply: u64) {
        self.supplies[asset.index()] = supply;
    }
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

struct LedgerSnapshot {
    // None marks an account that did not exist before the block
    accounts: HashMap<Address, Option<Account>>,
    supplies: [u64; ASSET_COUNT],
}

/// A block application failure: which transaction broke and why. The
/// ledger is already rolled back when this is returned.
#[derive(Debug)]
pub struct BlockApplyError {
    pub position: usize,
    pub error: BlockchainError,
}

impl std::fmt::Display for BlockApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transaction {} failed to apply: {}", self.position, self.error)
    }
}

impl std::error::Error for BlockApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostchain_common::crypto::KeyPair;
    use std::sync::Arc;

    fn funded(ledger: &mut TokenLedger, gas: u64) -> KeyPair {
        let keypair = KeyPair::new();
        ledger
            .mint(&keypair.get_address(), AssetKind::Gas, gas)
            .unwrap();
        keypair
    }

    #[test]
    fn test_transfer_is_atomic() {
        let mut ledger = TokenLedger::new();
        let keypair = funded(&mut ledger, 50);
        let from = keypair.get_address();
        let to = Address::from_public_key_bytes(&[1u8; 32]);

        let err = ledger.transfer(&from, &to, AssetKind::Gas, 100).unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::InsufficientGasBalance { need: 100, have: 50 }
        ));
        assert_eq!(ledger.get_balance(&from, AssetKind::Gas), 50);
        assert_eq!(ledger.get_balance(&to, AssetKind::Gas), 0);
    }

    #[test]
    fn test_burn_gas_reduces_supply() {
        let mut ledger = TokenLedger::new();
        let keypair = funded(&mut ledger, 1_000);
        assert_eq!(ledger.get_supply(AssetKind::Gas), 1_000);
        ledger.burn_gas(&keypair.get_address(), 10).unwrap();
        assert_eq!(ledger.get_supply(AssetKind::Gas), 990);
        assert_eq!(
            ledger.get_balance(&keypair.get_address(), AssetKind::Gas),
            990
        );
    }

    #[test]
    fn test_brand_cap_enforced() {
        let mut ledger = TokenLedger::new();
        let address = Address::from_public_key_bytes(&[2u8; 32]);
        ledger
            .mint(&address, AssetKind::Brand, BRAND_SUPPLY_CAP)
            .unwrap();
        let err = ledger.mint(&address, AssetKind::Brand, 1).unwrap_err();
        assert!(matches!(err, BlockchainError::SupplyCapExceeded(_)));
        assert_eq!(ledger.get_supply(AssetKind::Brand), BRAND_SUPPLY_CAP);
    }

    #[test]
    fn test_credit_overflow_rejected() {
        let mut ledger = TokenLedger::new();
        let address = Address::from_public_key_bytes(&[3u8; 32]);
        ledger.credit(&address, AssetKind::Utility, u64::MAX).unwrap();
        let err = ledger.credit(&address, AssetKind::Utility, 1).unwrap_err();
        assert!(matches!(err, BlockchainError::Overflow(_)));
        assert_eq!(ledger.get_balance(&address, AssetKind::Utility), u64::MAX);
    }

    #[test]
    fn test_apply_transaction_burns_gas_and_transfers() {
        let mut ledger = TokenLedger::new();
        let keypair = funded(&mut ledger, 1_000);
        let to = Address::from_public_key_bytes(&[4u8; 32]);
        let tx = Transaction::create(&keypair, to, AssetKind::Gas, 100, 10, 0);

        ledger.apply_transaction(&tx).unwrap();
        assert_eq!(
            ledger.get_balance(&keypair.get_address(), AssetKind::Gas),
            890
        );
        assert_eq!(ledger.get_balance(&to, AssetKind::Gas), 100);
        assert_eq!(ledger.get_supply(AssetKind::Gas), 990);
        assert_eq!(ledger.get_nonce(&keypair.get_address()), 1);
    }

    #[test]
    fn test_failed_transaction_burns_nothing() {
        let mut ledger = TokenLedger::new();
        let keypair = funded(&mut ledger, 15);
        let to = Address::from_public_key_bytes(&[5u8; 32]);
        // gas fee is coverable but the BRAND balance is not: the gas must
        // not be burned either
        let tx = Transaction::create(&keypair, to, AssetKind::Brand, 10, 10, 0);

        let err = ledger.apply_transaction(&tx).unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::InsufficientTokenBalance { .. }
        ));
        assert_eq!(ledger.get_balance(&keypair.get_address(), AssetKind::Gas), 15);
        assert_eq!(ledger.get_supply(AssetKind::Gas), 15);
        assert_eq!(ledger.get_nonce(&keypair.get_address()), 0);
    }

    #[test]
    fn test_nonce_gap_rejected() {
        let mut ledger = TokenLedger::new();
        let keypair = funded(&mut ledger, 100);
        let to = Address::from_public_key_bytes(&[6u8; 32]);
        let tx = Transaction::create(&keypair, to, AssetKind::Gas, 1, 1, 2);

        let err = ledger.apply_transaction(&tx).unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::InvalidNonce { expected: 0, got: 2 }
        ));
    }

    #[test]
    fn test_apply_block_rolls_back_fully() {
        let mut ledger = TokenLedger::new();
        let keypair = funded(&mut ledger, 100);
        let to = Address::from_public_key_bytes(&[7u8; 32]);

        let good = Arc::new(Transaction::create(&keypair, to, AssetKind::Gas, 10, 5, 0));
        // nonce 5 leaves a gap: the whole block must be rejected
        let bad = Arc::new(Transaction::create(&keypair, to, AssetKind::Gas, 10, 5, 5));

        let err = ledger.apply_block(&[good, bad]).unwrap_err();
        assert_eq!(err.position, 1);
        assert!(matches!(err.error, BlockchainError::InvalidNonce { .. }));
        assert_eq!(ledger.get_balance(&keypair.get_address(), AssetKind::Gas), 100);
        assert_eq!(ledger.get_balance(&to, AssetKind::Gas), 0);
        assert_eq!(ledger.get_nonce(&keypair.get_address()), 0);
        assert_eq!(ledger.get_supply(AssetKind::Gas), 100);
    }

    #[test]
    fn test_stake_supply_constant_across_transfers() {
        let mut ledger = TokenLedger::new();
        let keypair = funded(&mut ledger, 100);
        let from = keypair.get_address();
        ledger.mint(&from, AssetKind::Stake, 1_000_000).unwrap();
        let to = Address::from_public_key_bytes(&[8u8; 32]);

        let tx = Transaction::create(&keypair, to, AssetKind::Stake, 400_000, 10, 0);
        ledger.apply_transaction(&tx).unwrap();

        assert_eq!(ledger.get_supply(AssetKind::Stake), 1_000_000);
        assert_eq!(ledger.get_balance(&from, AssetKind::Stake), 600_000);
        assert_eq!(ledger.get_balance(&to, AssetKind::Stake), 400_000);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use ghostchain_common::crypto::KeyPair;
    use proptest::prelude::*;

    // For any admissible transfer sequence applied to a fresh ledger,
    // STAKE and BRAND supplies never move and the sender nonce counts
    // the applied transactions
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_fixed_supplies_survive_transfers(
            amounts in proptest::collection::vec(0u64..1_000, 1..16),
        ) {
            let mut ledger = TokenLedger::new();
            let keypair = KeyPair::new();
            let from = keypair.get_address();
            let to = Address::from_public_key_bytes(&[11u8; 32]);
            ledger.mint(&from, AssetKind::Gas, 1_000_000).unwrap();
            ledger.mint(&from, AssetKind::Stake, 1_000_000).unwrap();
            ledger.mint(&from, AssetKind::Brand, 100_000).unwrap();

            let mut applied = 0u64;
            for (i, amount) in amounts.iter().enumerate() {
                let asset = if i % 2 == 0 { AssetKind::Stake } else { AssetKind::Brand };
                let tx = Transaction::create(&keypair, to, asset, *amount, 1, applied);
                if ledger.apply_transaction(&tx).is_ok() {
                    applied += 1;
                }
            }

            prop_assert_eq!(ledger.get_supply(AssetKind::Stake), 1_000_000);
            prop_assert_eq!(ledger.get_supply(AssetKind::Brand), 100_000);
            prop_assert!(ledger.get_supply(AssetKind::Brand) <= ghostchain_common::config::BRAND_SUPPLY_CAP);
            prop_assert_eq!(ledger.get_nonce(&from), applied);
        }
    }
}
