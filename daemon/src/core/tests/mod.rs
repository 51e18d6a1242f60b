// Integration tests over the chain core: full scenarios against a real
// storage engine in a temporary directory.

mod chain_tests;
mod fork_tests;

use std::path::Path;
use std::sync::Arc;

use ghostchain_common::{
    asset::AssetKind,
    crypto::KeyPair,
    network::Network,
};

use crate::core::{
    blockchain::{Blockchain, ChainParams},
    genesis::{AllocEntry, GenesisState},
    storage::ChainStorage,
};

pub fn test_params() -> ChainParams {
    ChainParams {
        network: Network::Devnet,
        minimum_stake: 1_000_000,
        block_time_ms: Network::Devnet.block_time_ms(),
        mempool_capacity: 10_000,
        max_block_txs: 100,
    }
}

/// Genesis with one validator holding enough STAKE to be active and
/// some GAS to pay fees (the Scenario A numbers).
pub fn single_validator_genesis(validator: &KeyPair) -> GenesisState {
    GenesisState {
        timestamp_ms: 1_700_000_000_000,
        minimum_stake: 1_000_000,
        alloc: vec![
            AllocEntry {
                address: validator.get_address(),
                asset: AssetKind::Stake,
                amount: 1_000_000,
            },
            AllocEntry {
                address: validator.get_address(),
                asset: AssetKind::Gas,
                amount: 1_000,
            },
        ],
    }
}

pub async fn open_chain(
    dir: &Path,
    validator: &KeyPair,
) -> Arc<Blockchain<ChainStorage>> {
    let storage = ChainStorage::open(dir).expect("storage opens");
    let chain = Blockchain::new(storage, single_validator_genesis(validator), test_params())
        .await
        .expect("chain opens");
    Arc::new(chain)
}
