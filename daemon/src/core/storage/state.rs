use std::path::Path;

use log::trace;

use ghostchain_common::{
    account::Account,
    asset::AssetKind,
    block::Height,
    crypto::Address,
    serializer::Serializer,
};

use crate::core::{error::BlockchainError, validator::Validator};

const STATE_DIR: &str = "state";

// key prefixes of the derived-state namespaces
const ACCOUNT_PREFIX: &[u8] = b"account/";
const SUPPLY_PREFIX: &[u8] = b"supply/";
const VALIDATOR_PREFIX: &[u8] = b"validator/";
const SNAPSHOT_HEIGHT_KEY: &[u8] = b"snapshot_height";

/// Durable byte-keyed map for derived state: per-account balance
/// snapshots, asset supplies and validator records. Every write is
/// flushed before returning so it survives a crash.
pub struct StateStore {
    db: sled::Db,
}

impl StateStore {
    pub fn open(data_dir: &Path) -> Result<Self, BlockchainError> {
        let db = sled::open(data_dir.join(STATE_DIR))?;
        Ok(Self { db })
    }

    pub fn put_state(&self, key: &[u8], value: &[u8]) -> Result<(), BlockchainError> {
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_state(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockchainError> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    pub fn delete_state(&self, key: &[u8]) -> Result<(), BlockchainError> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    // Typed helpers over the raw KV

    fn account_key(address: &Address) -> Vec<u8> {
        let mut key = ACCOUNT_PREFIX.to_vec();
        key.extend_from_slice(address.as_bytes());
        key
    }

    pub fn put_account(&self, address: &Address, account: &Account) -> Result<(), BlockchainError> {
        trace!("snapshot account {}", address);
        self.db
            .insert(Self::account_key(address), account.to_bytes())?;
        Ok(())
    }

    pub fn delete_account(&self, address: &Address) -> Result<(), BlockchainError> {
        self.db.remove(Self::account_key(address))?;
        Ok(())
    }

    pub fn get_account(&self, address: &Address) -> Result<Option<Account>, BlockchainError> {
        match self.db.get(Self::account_key(address))? {
            Some(bytes) => Ok(Some(Account::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Iterate every account snapshot currently stored.
    pub fn accounts(&self) -> Result<Vec<(Address, Account)>, BlockchainError> {
        let mut accounts = Vec::new();
        for entry in self.db.scan_prefix(ACCOUNT_PREFIX) {
            let (key, value) = entry?;
            let address_bytes: [u8; 20] = key[ACCOUNT_PREFIX.len()..]
                .try_into()
                .map_err(|_| BlockchainError::Corruption("malformed account key".into()))?;
            accounts.push((Address::new(address_bytes), Account::from_bytes(&value)?));
        }
        Ok(accounts)
    }

    pub fn put_supply(&self, asset: AssetKind, supply: u64) -> Result<(), BlockchainError> {
        let mut key = SUPPLY_PREFIX.to_vec();
        key.push(asset.tag());
        self.db.insert(key, supply.to_le_bytes().to_vec())?;
        Ok(())
    }

    pub fn get_supply(&self, asset: AssetKind) -> Result<Option<u64>, BlockchainError> {
        let mut key = SUPPLY_PREFIX.to_vec();
        key.push(asset.tag());
        match self.db.get(key)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| BlockchainError::Corruption("malformed supply entry".into()))?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn put_validator(&self, validator: &Validator) -> Result<(), BlockchainError> {
        let mut key = VALIDATOR_PREFIX.to_vec();
        key.extend_from_slice(validator.address.as_bytes());
        self.db.insert(key, validator.to_bytes())?;
        Ok(())
    }

    pub fn delete_validator(&self, address: &Address) -> Result<(), BlockchainError> {
        let mut key = VALIDATOR_PREFIX.to_vec();
        key.extend_from_slice(address.as_bytes());
        self.db.remove(key)?;
        Ok(())
    }

    pub fn validators(&self) -> Result<Vec<Validator>, BlockchainError> {
        let mut validators = Vec::new();
        for entry in self.db.scan_prefix(VALIDATOR_PREFIX) {
            let (_, value) = entry?;
            validators.push(Validator::from_bytes(&value)?);
        }
        Ok(validators)
    }

    /// Height the stored account snapshot corresponds to, if any.
    pub fn get_snapshot_height(&self) -> Result<Option<Height>, BlockchainError> {
        match self.db.get(SNAPSHOT_HEIGHT_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| BlockchainError::Corruption("malformed snapshot height".into()))?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn set_snapshot_height(&self, height: Height) -> Result<(), BlockchainError> {
        self.db
            .insert(SNAPSHOT_HEIGHT_KEY, height.to_le_bytes().to_vec())?;
        Ok(())
    }

    /// One fsync for a batch of typed writes.
    pub fn flush(&self) -> Result<(), BlockchainError> {
        self.db.flush()?;
        Ok(())
    }

    /// Drop every snapshot entry, forcing the next startup to replay.
    pub fn clear(&self) -> Result<(), BlockchainError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}
