use serde::{Deserialize, Serialize};

use crate::{
    asset::{AssetKind, ASSET_COUNT},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

/// Account nonce, incremented once per committed transaction.
pub type Nonce = u64;

/// Per-account state: one balance per asset kind and the next expected
/// nonce. Accounts are created lazily on first credit, default zero.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    balances: [u64; ASSET_COUNT],
    nonce: Nonce,
}

impl Account {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_balance(&self, asset: AssetKind) -> u64 {
        self.balances[asset.index()]
    }

    pub fn set_balance(&mut self, asset: AssetKind, amount: u64) {
        self.balances[asset.index()] = amount;
    }

    /// Add to a balance, failing on u64 overflow. Balances never wrap.
    pub fn checked_credit(&mut self, asset: AssetKind, amount: u64) -> Option<u64> {
        let updated = self.balances[asset.index()].checked_add(amount)?;
        self.balances[asset.index()] = updated;
        Some(updated)
    }

    /// Subtract from a balance, failing when funds are insufficient.
    pub fn checked_debit(&mut self, asset: AssetKind, amount: u64) -> Option<u64> {
        let updated = self.balances[asset.index()].checked_sub(amount)?;
        self.balances[asset.index()] = updated;
        Some(updated)
    }

    pub fn get_nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn set_nonce(&mut self, nonce: Nonce) {
        self.nonce = nonce;
    }

    pub fn increment_nonce(&mut self) {
        self.nonce += 1;
    }

    /// True when every balance is zero and no transaction was ever sent.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balances.iter().all(|balance| *balance == 0)
    }
}

impl Serializer for Account {
    fn write(&self, writer: &mut Writer) {
        for balance in &self.balances {
            writer.write_u64(*balance);
        }
        writer.write_u64(self.nonce);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut balances = [0u64; ASSET_COUNT];
        for balance in &mut balances {
            *balance = reader.read_u64()?;
        }
        let nonce = reader.read_u64()?;
        Ok(Account { balances, nonce })
    }

    fn size(&self) -> usize {
        ASSET_COUNT * 8 + 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zero() {
        let account = Account::new();
        for asset in AssetKind::ALL {
            assert_eq!(account.get_balance(asset), 0);
        }
        assert_eq!(account.get_nonce(), 0);
        assert!(account.is_empty());
    }

    #[test]
    fn test_credit_overflow_is_detected() {
        let mut account = Account::new();
        account.set_balance(AssetKind::Gas, u64::MAX);
        assert!(account.checked_credit(AssetKind::Gas, 1).is_none());
        // no partial update on failure
        assert_eq!(account.get_balance(AssetKind::Gas), u64::MAX);
    }

    #[test]
    fn test_debit_bounds_check() {
        let mut account = Account::new();
        account.set_balance(AssetKind::Brand, 10);
        assert!(account.checked_debit(AssetKind::Brand, 11).is_none());
        assert_eq!(account.checked_debit(AssetKind::Brand, 10), Some(0));
    }

    #[test]
    fn test_serializer_roundtrip() {
        let mut account = Account::new();
        account.set_balance(AssetKind::Stake, 1_000_000);
        account.set_nonce(42);
        let decoded = Account::from_bytes(&account.to_bytes()).unwrap();
        assert_eq!(account, decoded);
    }
}
