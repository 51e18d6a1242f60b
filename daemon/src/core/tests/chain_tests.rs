use std::sync::Arc;

use tempdir::TempDir;

use ghostchain_common::{
    asset::AssetKind,
    block::{calculate_merkle_root, Block, BlockHeader},
    config::UTILITY_BLOCK_REWARD,
    crypto::{Address, Hashable, KeyPair},
    transaction::Transaction,
};

use crate::core::error::BlockchainError;

use super::open_chain;

#[tokio::test]
async fn test_genesis_bootstrap() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;

    let (height, hash) = chain.get_chain_head().await;
    assert_eq!(height, 0);
    let genesis = chain.get_block_at_height(0).await.unwrap();
    assert_eq!(genesis.get_hash(), &hash);
    assert_eq!(genesis.get_txs_count(), 0);

    assert_eq!(
        chain
            .get_balance(&validator.get_address(), AssetKind::Stake)
            .await,
        1_000_000
    );
    assert_eq!(
        chain
            .get_balance(&validator.get_address(), AssetKind::Gas)
            .await,
        1_000
    );
    assert_eq!(chain.get_validators().await.len(), 1);
}

// Scenario A: single transfer through admission, production and commit
#[tokio::test]
async fn test_single_transfer_block() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[2u8; 32]);

    let tx = Arc::new(Transaction::create(
        &validator,
        recipient,
        AssetKind::Gas,
        100,
        10,
        0,
    ));
    chain.submit_transaction(tx.clone()).await.unwrap();

    let block = chain
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .expect("the only validator must win the slot");
    assert_eq!(block.get_height(), 1);
    assert_eq!(block.get_txs_count(), 1);
    assert_eq!(block.get_transactions()[0].hash(), tx.hash());

    assert_eq!(
        chain
            .get_balance(&validator.get_address(), AssetKind::Gas)
            .await,
        890
    );
    assert_eq!(chain.get_balance(&recipient, AssetKind::Gas).await, 100);
    // the fee was burned out of the total supply
    assert_eq!(chain.get_supply(AssetKind::Gas).await, 990);

    // included transactions leave the mempool and get indexed
    assert_eq!(chain.get_mempool_stats().await.pending, 0);
    assert_eq!(chain.find_tx(&tx.hash()).await.unwrap(), Some((1, 0)));
}

// Scenario B: a nonce gap is rejected without touching the pool
#[tokio::test]
async fn test_nonce_gap_rejected() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[2u8; 32]);

    let gap = Arc::new(Transaction::create(
        &validator,
        recipient,
        AssetKind::Gas,
        1,
        1,
        2,
    ));
    let err = chain.submit_transaction(gap).await.unwrap_err();
    assert!(matches!(
        err,
        BlockchainError::InvalidNonce { expected: 0, got: 2 }
    ));
    assert_eq!(chain.get_mempool_stats().await.pending, 0);
}

// Scenario C: the gas fee must be coverable at admission time
#[tokio::test]
async fn test_insufficient_gas_rejected() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;

    let poor = KeyPair::new();
    let recipient = Address::from_public_key_bytes(&[2u8; 32]);
    // fund the sender with less than the fee
    let fund = Arc::new(Transaction::create(
        &validator,
        poor.get_address(),
        AssetKind::Gas,
        5,
        10,
        0,
    ));
    chain.submit_transaction(fund).await.unwrap();
    chain
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();

    let tx = Arc::new(Transaction::create(
        &poor,
        recipient,
        AssetKind::Gas,
        1,
        10,
        0,
    ));
    let err = chain.submit_transaction(tx).await.unwrap_err();
    assert!(matches!(
        err,
        BlockchainError::InsufficientGasBalance { need: 11, have: 5 }
    ));
    assert_eq!(chain.get_balance(&poor.get_address(), AssetKind::Gas).await, 5);
}

#[tokio::test]
async fn test_empty_block_is_produced() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;

    let block = chain
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(block.get_height(), 1);
    assert_eq!(block.get_txs_count(), 0);
    assert!(block.validate_structural().is_ok());
    assert_eq!(chain.get_chain_head().await.0, 1);
}

#[tokio::test]
async fn test_utility_reward_minted_to_leader() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;

    assert_eq!(chain.get_supply(AssetKind::Utility).await, 0);
    chain
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        chain
            .get_balance(&validator.get_address(), AssetKind::Utility)
            .await,
        UTILITY_BLOCK_REWARD
    );
    assert_eq!(chain.get_supply(AssetKind::Utility).await, UTILITY_BLOCK_REWARD);
}

#[tokio::test]
async fn test_stake_and_brand_supplies_constant_across_blocks() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[9u8; 32]);

    for nonce in 0..3 {
        let tx = Arc::new(Transaction::create(
            &validator,
            recipient,
            AssetKind::Gas,
            10,
            1,
            nonce,
        ));
        chain.submit_transaction(tx).await.unwrap();
        chain
            .produce_block(&validator.get_address())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(chain.get_supply(AssetKind::Stake).await, 1_000_000);
    assert_eq!(chain.get_supply(AssetKind::Brand).await, 0);
}

// A block containing any inapplicable transaction is rejected atomically
#[tokio::test]
async fn test_invalid_block_rejected_atomically() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[2u8; 32]);

    let (_, tip_hash) = chain.get_chain_head().await;
    let good = Arc::new(Transaction::create(
        &validator,
        recipient,
        AssetKind::Gas,
        10,
        1,
        0,
    ));
    // nonce 5 cannot apply after nonce 0
    let bad = Arc::new(Transaction::create(
        &validator,
        recipient,
        AssetKind::Gas,
        10,
        1,
        5,
    ));
    let txs = vec![good, bad];
    let header = BlockHeader::new(1, 1, tip_hash, calculate_merkle_root(&txs), 0);
    let block = Block::new(header, txs);

    let err = chain.add_new_block(block).await.unwrap_err();
    assert!(matches!(err, BlockchainError::InvalidNonce { .. }));
    assert_eq!(chain.get_chain_head().await.0, 0);
    assert_eq!(
        chain
            .get_balance(&validator.get_address(), AssetKind::Gas)
            .await,
        1_000
    );
}

// Scenario B continuation: committed nonces are strictly sequential
#[tokio::test]
async fn test_committed_nonces_are_sequential() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[2u8; 32]);

    for nonce in 0..5u64 {
        let tx = Arc::new(Transaction::create(
            &validator,
            recipient,
            AssetKind::Gas,
            1,
            1,
            nonce,
        ));
        chain.submit_transaction(tx).await.unwrap();
    }
    let block = chain
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(block.get_txs_count(), 5);
    let nonces: Vec<u64> = block
        .get_transactions()
        .iter()
        .map(|tx| tx.get_nonce())
        .collect();
    assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
    assert_eq!(chain.get_account(&validator.get_address()).await.get_nonce(), 5);
}

#[tokio::test]
async fn test_duplicate_block_rejected() {
    let dir = TempDir::new("chain").unwrap();
    let validator = KeyPair::new();
    let chain = open_chain(dir.path(), &validator).await;

    let block = chain
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();
    let err = chain.add_new_block((*block).clone()).await.unwrap_err();
    assert!(matches!(
        err,
        BlockchainError::InvalidBlockHeight { expected: 2, got: 1 }
    ));
}

// Two nodes fed the same genesis and transactions select the same leader
// and build the same block body
#[tokio::test]
async fn test_production_is_deterministic() {
    let dir_a = TempDir::new("chain-a").unwrap();
    let dir_b = TempDir::new("chain-b").unwrap();
    let validator = KeyPair::new();
    let chain_a = open_chain(dir_a.path(), &validator).await;
    let chain_b = open_chain(dir_b.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[7u8; 32]);

    let tx = Arc::new(Transaction::create(
        &validator,
        recipient,
        AssetKind::Gas,
        42,
        1,
        0,
    ));
    chain_a.submit_transaction(tx.clone()).await.unwrap();
    chain_b.submit_transaction(tx).await.unwrap();

    let block_a = chain_a
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();
    let block_b = chain_b
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(block_a.get_merkle_root(), block_b.get_merkle_root());
    assert_eq!(block_a.get_previous_hash(), block_b.get_previous_hash());
    assert_eq!(
        chain_a.get_balance(&recipient, AssetKind::Gas).await,
        chain_b.get_balance(&recipient, AssetKind::Gas).await
    );
}
