use std::sync::Arc;

use tempdir::TempDir;

use ghostchain_common::{
    asset::AssetKind,
    block::Block,
    crypto::{Address, Hashable, KeyPair},
    transaction::Transaction,
};

use super::open_chain;

async fn collect_suffix(
    chain: &crate::core::blockchain::Blockchain<crate::core::storage::ChainStorage>,
    from_height: u64,
) -> Vec<Block> {
    let (tip, _) = chain.get_chain_head().await;
    let mut blocks = Vec::new();
    for height in from_height..=tip {
        blocks.push(chain.get_block_at_height(height).await.unwrap());
    }
    blocks
}

// Scenario E: the longer chain carries more accumulated leader stake
// and replaces the local one from the common ancestor
#[tokio::test]
async fn test_heavier_remote_chain_is_adopted() {
    let dir_a = TempDir::new("fork-a").unwrap();
    let dir_b = TempDir::new("fork-b").unwrap();
    let validator = KeyPair::new();
    let chain_a = open_chain(dir_a.path(), &validator).await;
    let chain_b = open_chain(dir_b.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[3u8; 32]);

    // local chain: one empty block
    chain_a
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();

    // remote chain: a transfer block plus two empty ones, strictly heavier
    let tx = Arc::new(Transaction::create(
        &validator,
        recipient,
        AssetKind::Gas,
        100,
        10,
        0,
    ));
    chain_b.submit_transaction(tx.clone()).await.unwrap();
    for _ in 0..3 {
        chain_b
            .produce_block(&validator.get_address())
            .await
            .unwrap()
            .unwrap();
    }

    let remote = collect_suffix(&chain_b, 1).await;
    let verdict = chain_a.evaluate_fork(0, &remote).await.unwrap();
    assert!(verdict.adopt);
    assert!(verdict.remote_weight > verdict.local_weight);

    chain_a.resolve_fork(0, remote).await.unwrap();

    let (height_a, hash_a) = chain_a.get_chain_head().await;
    let (height_b, hash_b) = chain_b.get_chain_head().await;
    assert_eq!(height_a, height_b);
    assert_eq!(hash_a, hash_b);

    // the adopted chain's state replaced the local one
    assert_eq!(chain_a.get_balance(&recipient, AssetKind::Gas).await, 100);
    assert_eq!(chain_a.find_tx(&tx.hash()).await.unwrap(), Some((1, 0)));
    assert!(chain_a.verify_chain().await.unwrap());
}

#[tokio::test]
async fn test_lighter_remote_chain_is_kept_out() {
    let dir_a = TempDir::new("fork-a").unwrap();
    let dir_b = TempDir::new("fork-b").unwrap();
    let validator = KeyPair::new();
    let chain_a = open_chain(dir_a.path(), &validator).await;
    let chain_b = open_chain(dir_b.path(), &validator).await;

    // local is two blocks ahead of the remote fork
    for _ in 0..2 {
        chain_a
            .produce_block(&validator.get_address())
            .await
            .unwrap()
            .unwrap();
    }
    chain_b
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();

    let (local_height, local_hash) = chain_a.get_chain_head().await;
    let remote = collect_suffix(&chain_b, 1).await;
    let verdict = chain_a.evaluate_fork(0, &remote).await.unwrap();
    assert!(!verdict.adopt);
    assert!(verdict.local_weight > verdict.remote_weight);

    // the local chain is untouched
    assert_eq!(chain_a.get_chain_head().await, (local_height, local_hash));
}

// Equal weight: exactly one side adopts, decided by the lower tip hash
#[tokio::test]
async fn test_tie_broken_by_lower_hash() {
    let dir_a = TempDir::new("fork-a").unwrap();
    let dir_b = TempDir::new("fork-b").unwrap();
    let validator = KeyPair::new();
    let chain_a = open_chain(dir_a.path(), &validator).await;
    let chain_b = open_chain(dir_b.path(), &validator).await;
    let recipient = Address::from_public_key_bytes(&[3u8; 32]);

    // same height, different blocks: A stays empty, B carries a transfer
    chain_a
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();
    let tx = Arc::new(Transaction::create(
        &validator,
        recipient,
        AssetKind::Gas,
        1,
        1,
        0,
    ));
    chain_b.submit_transaction(tx).await.unwrap();
    chain_b
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();

    let suffix_a = collect_suffix(&chain_a, 1).await;
    let suffix_b = collect_suffix(&chain_b, 1).await;

    let verdict_on_a = chain_a.evaluate_fork(0, &suffix_b).await.unwrap();
    let verdict_on_b = chain_b.evaluate_fork(0, &suffix_a).await.unwrap();
    assert_eq!(verdict_on_a.local_weight, verdict_on_a.remote_weight);
    // both sides agree on the winner
    assert_ne!(verdict_on_a.adopt, verdict_on_b.adopt);
}

#[tokio::test]
async fn test_invalid_remote_suffix_is_rejected() {
    let dir_a = TempDir::new("fork-a").unwrap();
    let dir_b = TempDir::new("fork-b").unwrap();
    let validator = KeyPair::new();
    let chain_a = open_chain(dir_a.path(), &validator).await;
    let chain_b = open_chain(dir_b.path(), &validator).await;

    chain_a
        .produce_block(&validator.get_address())
        .await
        .unwrap()
        .unwrap();
    for _ in 0..2 {
        chain_b
            .produce_block(&validator.get_address())
            .await
            .unwrap()
            .unwrap();
    }

    // break the linkage of the remote suffix
    let mut remote = collect_suffix(&chain_b, 1).await;
    remote.remove(0);

    let (local_height, local_hash) = chain_a.get_chain_head().await;
    assert!(chain_a.evaluate_fork(0, &remote).await.is_err());
    assert!(chain_a.resolve_fork(0, remote).await.is_err());
    // a failed resolution leaves the local chain alone
    assert_eq!(chain_a.get_chain_head().await, (local_height, local_hash));
    assert!(chain_a.verify_chain().await.unwrap());
}
