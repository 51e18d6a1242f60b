use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use ghostchain_common::{
    asset::AssetKind,
    block::{calculate_merkle_root, Block, BlockHeader},
    config::BRAND_SUPPLY_CAP,
    crypto::{Address, Hash},
    time::TimestampMillis,
};

use super::error::BlockchainError;

/// One genesis allocation: an asset minted onto an account before the
/// first block.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AllocEntry {
    pub address: Address,
    pub asset: AssetKind,
    pub amount: u64,
}

/// Bootstrap state of a chain, loaded from a JSON file so every node
/// starts from the same allocations and produces the same genesis hash.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GenesisState {
    /// Fixed genesis timestamp, part of the genesis block hash
    pub timestamp_ms: TimestampMillis,
    /// Validator activation threshold in STAKE base units
    pub minimum_stake: u64,
    pub alloc: Vec<AllocEntry>,
}

impl GenesisState {
    /// Ephemeral single-validator genesis for devnet runs without a file.
    pub fn devnet(validator: Address, minimum_stake: u64) -> Self {
        Self {
            timestamp_ms: 0,
            minimum_stake,
            alloc: vec![
                AllocEntry {
                    address: validator,
                    asset: AssetKind::Stake,
                    amount: minimum_stake,
                },
                AllocEntry {
                    address: validator,
                    asset: AssetKind::Gas,
                    amount: 1_000_000,
                },
            ],
        }
    }

    /// Caps that must hold before any allocation is minted.
    pub fn validate(&self) -> Result<(), BlockchainError> {
        let mut brand_total: u64 = 0;
        for entry in &self.alloc {
            if entry.asset == AssetKind::Brand {
                brand_total = brand_total
                    .checked_add(entry.amount)
                    .ok_or(BlockchainError::Overflow(AssetKind::Brand))?;
            }
        }
        if brand_total > BRAND_SUPPLY_CAP {
            return Err(BlockchainError::Genesis(format!(
                "BRAND allocation {} exceeds the cap of {}",
                brand_total, BRAND_SUPPLY_CAP
            )));
        }
        Ok(())
    }

    /// The deterministic genesis block: height 0, all-zero previous
    /// hash, no transactions.
    pub fn build_block(&self) -> Block {
        let header = BlockHeader::new(
            0,
            self.timestamp_ms,
            Hash::zero(),
            calculate_merkle_root(&[]),
            0,
        );
        Block::new(header, Vec::new())
    }
}

/// Load and validate a genesis state file.
pub fn load_genesis_state(path: &Path) -> Result<GenesisState, BlockchainError> {
    if !path.exists() {
        return Err(BlockchainError::Genesis(format!(
            "genesis file {} not found",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| BlockchainError::Genesis(format!("cannot read genesis file: {}", e)))?;
    let state: GenesisState = serde_json::from_str(&content)
        .map_err(|e| BlockchainError::Genesis(format!("invalid genesis file: {}", e)))?;
    state.validate()?;
    info!(
        "genesis state loaded: {} allocations, minimum stake {}",
        state.alloc.len(),
        state.minimum_stake
    );
    Ok(state)
}
