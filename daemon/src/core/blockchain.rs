use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::{broadcast, Mutex, RwLock};

use ghostchain_common::{
    account::Account,
    asset::AssetKind,
    block::{calculate_merkle_root, Block, BlockHeader, Height},
    config::UTILITY_BLOCK_REWARD,
    crypto::{Address, Hash, Hashable},
    network::Network,
    time::get_current_time_in_millis,
    transaction::Transaction,
};

use super::{
    error::BlockchainError,
    executor::{ContractExecutor, NoopExecutor},
    genesis::GenesisState,
    ledger::TokenLedger,
    mempool::{Mempool, MempoolStats},
    storage::{BlockProvider, StateProvider, Storage, TxIndexProvider},
    validator::{Validator, ValidatorSet},
};

// Capacity of the block / transaction subscription channels
const EVENT_CHANNEL_SIZE: usize = 256;

/// Runtime parameters of the chain, fixed at startup.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub minimum_stake: u64,
    pub block_time_ms: u64,
    pub mempool_capacity: usize,
    pub max_block_txs: usize,
}

// Undo record of one block application, used when persistence fails
// after the ledger was already mutated
struct StateUndo {
    accounts: Vec<(Address, Account)>,
    supplies: [u64; 4],
}

// Result of applying a block onto a ledger: the rollback record and
// every address the block mutated, rewarded leader included
struct BlockApplied {
    undo: StateUndo,
    touched: Vec<Address>,
}

/// The chain state machine: owns the ledger, the mempool, the validator
/// view and the storage handle. Background tasks reach it through an
/// `Arc`; block application holds the writer locks for the whole
/// critical section so no reader ever observes a partial block.
pub struct Blockchain<S: Storage> {
    storage: RwLock<S>,
    ledger: RwLock<TokenLedger>,
    mempool: Mutex<Mempool>,
    validators: RwLock<ValidatorSet>,
    genesis: GenesisState,
    params: ChainParams,
    executor: Arc<dyn ContractExecutor>,
    blocks_channel: broadcast::Sender<Arc<Block>>,
    txs_channel: broadcast::Sender<Arc<Transaction>>,
}

impl<S: Storage> Blockchain<S> {
    /// Open the chain over a storage engine: bootstrap the genesis block
    /// on an empty store, otherwise verify integrity and rebuild the
    /// in-memory ledger from a snapshot or a full replay.
    pub async fn new(
        storage: S,
        genesis: GenesisState,
        params: ChainParams,
    ) -> Result<Self, BlockchainError> {
        Self::with_executor(storage, genesis, params, Arc::new(NoopExecutor)).await
    }

    pub async fn with_executor(
        mut storage: S,
        genesis: GenesisState,
        params: ChainParams,
        executor: Arc<dyn ContractExecutor>,
    ) -> Result<Self, BlockchainError> {
        genesis.validate()?;

        let (blocks_channel, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (txs_channel, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let (ledger, validators) = if storage.has_blocks().await {
            if !storage.verify_chain().await? {
                return Err(BlockchainError::Corruption(
                    "stored chain failed the integrity check".into(),
                ));
            }
            Self::restore_state(&storage, &genesis, params.minimum_stake).await?
        } else {
            Self::bootstrap(&mut storage, &genesis, params.minimum_stake).await?
        };

        info!(
            "chain ready on {} at height {} with {} accounts",
            params.network,
            storage.latest_height().await,
            ledger.accounts_count()
        );

        Ok(Self {
            storage: RwLock::new(storage),
            ledger: RwLock::new(ledger),
            mempool: Mutex::new(Mempool::new(params.mempool_capacity)),
            validators: RwLock::new(validators),
            genesis,
            params,
            executor,
            blocks_channel,
            txs_channel,
        })
    }

    pub fn get_params(&self) -> &ChainParams {
        &self.params
    }

    // Mint the genesis allocations and commit the genesis block
    async fn bootstrap(
        storage: &mut S,
        genesis: &GenesisState,
        minimum_stake: u64,
    ) -> Result<(TokenLedger, ValidatorSet), BlockchainError> {
        let mut ledger = TokenLedger::new();
        for entry in &genesis.alloc {
            ledger.mint(&entry.address, entry.asset, entry.amount)?;
        }
        let mut validators = ValidatorSet::new(minimum_stake);
        validators.rebuild(&ledger);

        let block = genesis.build_block();
        info!("bootstrapping genesis block {}", block.get_hash());
        storage.put_block(&block).await?;
        Self::persist_derived_state(storage, &ledger, &validators, 0).await?;
        Ok((ledger, validators))
    }

    // Restore the ledger from the state snapshot when it matches the
    // stored tip, otherwise replay the whole chain
    async fn restore_state(
        storage: &S,
        genesis: &GenesisState,
        minimum_stake: u64,
    ) -> Result<(TokenLedger, ValidatorSet), BlockchainError> {
        let latest = storage.latest_height().await;
        if storage.get_snapshot_height().await? == Some(latest) {
            debug!("restoring ledger from state snapshot at height {}", latest);
            let mut ledger = TokenLedger::new();
            for (address, account) in storage.get_account_snapshots().await? {
                ledger.restore_account(address, account);
            }
            for asset in AssetKind::ALL {
                if let Some(supply) = storage.get_supply(asset).await? {
                    ledger.restore_supply(asset, supply);
                }
            }
            let mut validators = ValidatorSet::new(minimum_stake);
            validators.rebuild(&ledger);
            return Ok((ledger, validators));
        }

        info!("state snapshot is stale, replaying {} blocks", latest);
        Self::replay_chain(storage, genesis, minimum_stake, latest).await
    }

    // Rebuild ledger and validator set by replaying blocks 1..=upto on
    // top of the genesis allocations
    async fn replay_chain(
        storage: &S,
        genesis: &GenesisState,
        minimum_stake: u64,
        upto: Height,
    ) -> Result<(TokenLedger, ValidatorSet), BlockchainError> {
        let mut ledger = TokenLedger::new();
        for entry in &genesis.alloc {
            ledger.mint(&entry.address, entry.asset, entry.amount)?;
        }
        let mut validators = ValidatorSet::new(minimum_stake);
        validators.rebuild(&ledger);

        let mut tip_hash = storage.get_block(0).await?.get_hash().clone();
        for height in 1..=upto {
            let block = storage.get_block(height).await?;
            let applied = apply_block_to_ledger(&mut ledger, &validators, &block, height, &tip_hash)
                .map_err(|(_, e)| e)?;
            validators.refresh(&ledger, applied.touched.into_iter());
            tip_hash = block.get_hash().clone();
        }
        Ok((ledger, validators))
    }

    // Snapshot every account plus supplies and validator records, then
    // mark which height the snapshot corresponds to
    async fn persist_derived_state(
        storage: &mut S,
        ledger: &TokenLedger,
        validators: &ValidatorSet,
        height: Height,
    ) -> Result<(), BlockchainError> {
        let accounts: Vec<(Address, Account)> = ledger
            .accounts()
            .map(|(address, account)| (*address, account.clone()))
            .collect();
        for (address, account) in accounts {
            storage.put_account_snapshot(&address, &account).await?;
        }
        for asset in AssetKind::ALL {
            storage.put_supply(asset, ledger.get_supply(asset)).await?;
        }
        for validator in validators.active_validators() {
            storage.put_validator(validator).await?;
        }
        storage.set_snapshot_height(height).await?;
        Ok(())
    }

    // Incremental variant of the above for one committed block
    async fn persist_touched_state(
        storage: &mut S,
        ledger: &TokenLedger,
        validators: &ValidatorSet,
        touched: &[Address],
        height: Height,
    ) -> Result<(), BlockchainError> {
        for address in touched {
            storage
                .put_account_snapshot(address, &ledger.get_account(address))
                .await?;
            match validators.get_validator(address) {
                Some(validator) => storage.put_validator(validator).await?,
                None => storage.delete_validator(address).await?,
            }
        }
        for asset in AssetKind::ALL {
            storage.put_supply(asset, ledger.get_supply(asset)).await?;
        }
        storage.set_snapshot_height(height).await?;
        Ok(())
    }

    /// Validate and admit a transaction into the mempool. An admitted
    /// transaction is announced to subscribers (the gossip layer among
    /// them).
    pub async fn submit_transaction(
        &self,
        tx: Arc<Transaction>,
    ) -> Result<Hash, BlockchainError> {
        let hash = {
            let ledger = self.ledger.read().await;
            let mut mempool = self.mempool.lock().await;
            mempool.add_tx(tx.clone(), &ledger)?
        };
        // subscribers may be absent, that is fine
        let _ = self.txs_channel.send(tx);
        Ok(hash)
    }

    /// Apply and commit a block coming from the network or from a test.
    /// Transactions are fully re-verified; the whole application is one
    /// critical section and is atomic.
    pub async fn add_new_block(&self, block: Block) -> Result<(), BlockchainError> {
        block.validate_structural()?;
        for tx in block.get_transactions() {
            tx.validate_structural()?;
            tx.validate_signature()?;
        }

        let mut storage = self.storage.write().await;
        let mut ledger = self.ledger.write().await;
        let mut validators = self.validators.write().await;

        let tip_height = storage.latest_height().await;
        let tip_hash = storage
            .get_block_metadata(tip_height)
            .await
            .map(|metadata| metadata.hash)
            .ok_or(BlockchainError::BlockNotFound(tip_height))?;

        let height = block.get_height();
        if height != tip_height + 1 {
            return Err(BlockchainError::InvalidBlockHeight {
                expected: tip_height + 1,
                got: height,
            });
        }

        let applied = apply_block_to_ledger(&mut ledger, &validators, &block, height, &tip_hash)
            .map_err(|(_, e)| e)?;

        if let Err(e) = Self::persist_block(&mut storage, &block).await {
            applied.undo.restore(&mut ledger);
            return Err(e);
        }

        validators.refresh(&ledger, applied.touched.iter().copied());
        Self::persist_touched_state(&mut storage, &ledger, &validators, &applied.touched, height)
            .await?;

        // the block is durable, now drop its transactions from the pool
        {
            let mut mempool = self.mempool.lock().await;
            for tx in block.get_transactions() {
                mempool.remove(&tx.hash());
            }
            mempool.cleanup(&ledger);
        }

        info!(
            "committed block {} at height {} with {} txs",
            block.get_hash(),
            height,
            block.get_txs_count()
        );
        let _ = self.blocks_channel.send(Arc::new(block));
        Ok(())
    }

    async fn persist_block(storage: &mut S, block: &Block) -> Result<(), BlockchainError> {
        storage.put_block(block).await?;
        for (position, tx) in block.get_transactions().iter().enumerate() {
            storage
                .index_tx(&tx.hash(), block.get_height(), position as u32)
                .await?;
        }
        Ok(())
    }

    /// One producer slot: determine the leader for the next height and,
    /// when this node wins the draw, drain the mempool, assemble the
    /// block, apply it and commit. Inapplicable transactions are evicted
    /// and the remaining set is retried; an empty block is valid.
    pub async fn produce_block(
        &self,
        miner: &Address,
    ) -> Result<Option<Arc<Block>>, BlockchainError> {
        let mut storage = self.storage.write().await;
        let mut ledger = self.ledger.write().await;
        let mut validators = self.validators.write().await;
        let mut mempool = self.mempool.lock().await;

        let tip_height = storage.latest_height().await;
        let tip_hash = storage
            .get_block_metadata(tip_height)
            .await
            .map(|metadata| metadata.hash)
            .ok_or(BlockchainError::BlockNotFound(tip_height))?;
        let height = tip_height + 1;

        let leader = match validators.select_leader(&tip_hash, height) {
            Ok(leader) => leader,
            Err(BlockchainError::NoLeader) => {
                debug!("no active validator, skipping slot at height {}", height);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if &leader != miner {
            trace!("leader for height {} is {}, not us", height, leader);
            return Ok(None);
        }

        let mut candidates = mempool.select(self.params.max_block_txs);
        let (block, applied) = loop {
            let header = BlockHeader::new(
                height,
                get_current_time_in_millis(),
                tip_hash.clone(),
                calculate_merkle_root(&candidates),
                0,
            );
            let block = Block::new(header, candidates.clone());
            match apply_block_to_ledger(&mut ledger, &validators, &block, height, &tip_hash) {
                Ok(applied) => break (block, applied),
                Err((Some(position), e)) => {
                    let failed = candidates[position].hash();
                    warn!("evicting inapplicable tx {} from candidate block: {}", failed, e);
                    mempool.evict(&failed);
                    // dependents of the evicted sender may be gone too
                    candidates.retain(|tx| mempool.contains(&tx.hash()));
                }
                Err((None, e)) => return Err(e),
            }
        };

        if let Err(e) = Self::persist_block(&mut storage, &block).await {
            applied.undo.restore(&mut ledger);
            return Err(e);
        }

        validators.refresh(&ledger, applied.touched.iter().copied());
        Self::persist_touched_state(&mut storage, &ledger, &validators, &applied.touched, height)
            .await?;

        for tx in block.get_transactions() {
            mempool.remove(&tx.hash());
        }

        info!(
            "produced block {} at height {} with {} txs",
            block.get_hash(),
            height,
            block.get_txs_count()
        );
        let block = Arc::new(block);
        let _ = self.blocks_channel.send(block.clone());
        Ok(Some(block))
    }

    /// Accumulated stake weight of the local chain over
    /// `common_height+1 ..= tip` and of a remote suffix starting at the
    /// same ancestor. Used by fork resolution to pick the heavier chain.
    pub async fn evaluate_fork(
        &self,
        common_height: Height,
        remote_blocks: &[Block],
    ) -> Result<ForkVerdict, BlockchainError> {
        let storage = self.storage.read().await;

        let local_tip = storage.latest_height().await;
        if common_height > local_tip {
            return Err(BlockchainError::BlockNotFound(common_height));
        }
        let mut local_blocks = Vec::with_capacity((local_tip - common_height) as usize);
        for height in common_height + 1..=local_tip {
            local_blocks.push(storage.get_block(height).await?);
        }

        let (base_ledger, base_validators) = Self::replay_chain(
            &*storage,
            &self.genesis,
            self.params.minimum_stake,
            common_height,
        )
        .await?;
        let base_hash = storage.get_block(common_height).await?.get_hash().clone();

        let local_weight = suffix_stake_weight(
            base_ledger.clone(),
            base_validators.clone(),
            &base_hash,
            common_height,
            &local_blocks,
        )?;
        let remote_weight = suffix_stake_weight(
            base_ledger,
            base_validators,
            &base_hash,
            common_height,
            remote_blocks,
        )?;

        let local_tip_hash = local_blocks
            .last()
            .map(|block| block.get_hash().clone())
            .unwrap_or_else(|| base_hash.clone());
        let remote_tip_hash = remote_blocks
            .last()
            .map(|block| block.get_hash().clone())
            .unwrap_or_else(|| base_hash.clone());

        // heavier chain wins, ties broken by the lower tip hash
        let adopt = remote_weight > local_weight
            || (remote_weight == local_weight && remote_tip_hash < local_tip_hash);
        Ok(ForkVerdict {
            adopt,
            local_weight,
            remote_weight,
        })
    }

    /// Rewind to `common_height` and apply a heavier remote suffix. The
    /// suffix is fully validated against a replayed ledger before any
    /// storage mutation, so a losing or invalid suffix never damages the
    /// local chain.
    pub async fn resolve_fork(
        &self,
        common_height: Height,
        remote_blocks: Vec<Block>,
    ) -> Result<(), BlockchainError> {
        for block in &remote_blocks {
            block.validate_structural()?;
            for tx in block.get_transactions() {
                tx.validate_structural()?;
                tx.validate_signature()?;
            }
        }

        let mut storage = self.storage.write().await;
        let mut ledger = self.ledger.write().await;
        let mut validators = self.validators.write().await;

        // rebuild the state as of the common ancestor
        let (mut new_ledger, mut new_validators) = Self::replay_chain(
            &*storage,
            &self.genesis,
            self.params.minimum_stake,
            common_height,
        )
        .await?;
        let mut tip_hash = storage.get_block(common_height).await?.get_hash().clone();

        // dry-run the whole suffix before touching storage
        let mut height = common_height;
        for block in &remote_blocks {
            height += 1;
            let applied =
                apply_block_to_ledger(&mut new_ledger, &new_validators, block, height, &tip_hash)
                    .map_err(|(_, e)| e)?;
            new_validators.refresh(&new_ledger, applied.touched.into_iter());
            tip_hash = block.get_hash().clone();
        }

        // the suffix is valid, swap storage over to it
        let removed = storage.pop_blocks_above(common_height).await.map_err(|e| {
            BlockchainError::RewindFailed(format!("cannot pop local blocks: {}", e))
        })?;
        for block in &removed {
            for tx in block.get_transactions() {
                storage.unindex_tx(&tx.hash()).await?;
            }
        }
        for block in &remote_blocks {
            Self::persist_block(&mut storage, block)
                .await
                .map_err(|e| BlockchainError::RewindFailed(e.to_string()))?;
        }

        *ledger = new_ledger;
        *validators = new_validators;
        let new_tip = common_height + remote_blocks.len() as u64;
        Self::persist_derived_state(&mut storage, &ledger, &validators, new_tip).await?;

        {
            let mut mempool = self.mempool.lock().await;
            mempool.cleanup(&ledger);
        }

        info!(
            "fork resolved: rewound to height {} and applied {} remote blocks",
            common_height,
            remote_blocks.len()
        );
        for block in remote_blocks {
            let _ = self.blocks_channel.send(Arc::new(block));
        }
        Ok(())
    }

    // Queries exposed to the gateway and the p2p layer

    pub async fn get_chain_head(&self) -> (Height, Hash) {
        let storage = self.storage.read().await;
        let height = storage.latest_height().await;
        let hash = storage
            .get_block_metadata(height)
            .await
            .map(|metadata| metadata.hash)
            .unwrap_or_else(Hash::zero);
        (height, hash)
    }

    pub async fn get_block_at_height(&self, height: Height) -> Result<Block, BlockchainError> {
        self.storage.read().await.get_block(height).await
    }

    pub async fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, BlockchainError> {
        self.storage.read().await.get_block_by_hash(hash).await
    }

    pub async fn get_height_for_hash(&self, hash: &Hash) -> Option<Height> {
        self.storage.read().await.get_height_for_hash(hash).await
    }

    pub async fn get_account(&self, address: &Address) -> Account {
        self.ledger.read().await.get_account(address)
    }

    pub async fn get_balance(&self, address: &Address, asset: AssetKind) -> u64 {
        self.ledger.read().await.get_balance(address, asset)
    }

    pub async fn get_supply(&self, asset: AssetKind) -> u64 {
        self.ledger.read().await.get_supply(asset)
    }

    pub async fn find_tx(&self, hash: &Hash) -> Result<Option<(Height, u32)>, BlockchainError> {
        self.storage.read().await.find_tx(hash).await
    }

    pub async fn get_validators(&self) -> Vec<Validator> {
        self.validators
            .read()
            .await
            .active_validators()
            .cloned()
            .collect()
    }

    pub async fn get_mempool_stats(&self) -> MempoolStats {
        self.mempool.lock().await.stats()
    }

    pub async fn mempool_contains(&self, hash: &Hash) -> bool {
        self.mempool.lock().await.contains(hash)
    }

    /// Periodic mempool maintenance, run by the orchestrator.
    pub async fn process_mempool(&self) {
        let ledger = self.ledger.read().await;
        let mut mempool = self.mempool.lock().await;
        mempool.cleanup(&ledger);
    }

    /// Forward a reserved contract call to the installed executor.
    pub async fn apply_contract_call(
        &self,
        sender: Address,
        target: Address,
        payload: &[u8],
        gas_limit: u64,
    ) -> Result<(), BlockchainError> {
        self.executor.execute(sender, target, payload, gas_limit).await
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<Arc<Block>> {
        self.blocks_channel.subscribe()
    }

    pub fn subscribe_transactions(&self) -> broadcast::Receiver<Arc<Transaction>> {
        self.txs_channel.subscribe()
    }

    pub async fn verify_chain(&self) -> Result<bool, BlockchainError> {
        self.storage.read().await.verify_chain().await
    }

    /// Fsync storage, called on shutdown after the tasks drained.
    pub async fn flush_storage(&self) -> Result<(), BlockchainError> {
        self.storage.write().await.flush().await
    }
}

/// Outcome of a fork weight comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkVerdict {
    pub adopt: bool,
    pub local_weight: u64,
    pub remote_weight: u64,
}

impl StateUndo {
    fn restore(&self, ledger: &mut TokenLedger) {
        for (address, account) in &self.accounts {
            ledger.restore_account(*address, account.clone());
        }
        for (index, asset) in AssetKind::ALL.iter().enumerate() {
            ledger.restore_supply(*asset, self.supplies[index]);
        }
    }
}

// Every address a block can mutate: transaction endpoints plus the
// rewarded leader (derived again from the previous hash)
fn touched_addresses(block: &Block) -> Vec<Address> {
    let mut touched: Vec<Address> = block
        .get_transactions()
        .iter()
        .flat_map(|tx| [*tx.get_from(), *tx.get_to()])
        .collect();
    touched.sort_unstable();
    touched.dedup();
    touched
}

// Apply one block's transactions and the leader reward onto a ledger.
// Checks height linkage and the leader draw; on any failure restores the
// ledger and reports the failing transaction position when there is one.
fn apply_block_to_ledger(
    ledger: &mut TokenLedger,
    validators: &ValidatorSet,
    block: &Block,
    expected_height: Height,
    tip_hash: &Hash,
) -> Result<BlockApplied, (Option<usize>, BlockchainError)> {
    if block.get_height() != expected_height {
        return Err((
            None,
            BlockchainError::InvalidBlockHeight {
                expected: expected_height,
                got: block.get_height(),
            },
        ));
    }
    if block.get_previous_hash() != tip_hash {
        return Err((
            None,
            BlockchainError::PreviousHashMismatch {
                height: block.get_height(),
            },
        ));
    }

    let leader = validators
        .select_leader(tip_hash, expected_height)
        .map_err(|e| (None, e))?;

    // commit-level rollback state: the ledger undoes a failed body on
    // its own, this additionally covers the leader reward and a failed
    // persistence after the body applied
    let mut touched = touched_addresses(block);
    touched.push(leader);
    touched.sort_unstable();
    touched.dedup();
    let undo = StateUndo {
        accounts: touched
            .iter()
            .map(|address| (*address, ledger.get_account(address)))
            .collect(),
        supplies: [
            ledger.get_supply(AssetKind::Gas),
            ledger.get_supply(AssetKind::Stake),
            ledger.get_supply(AssetKind::Utility),
            ledger.get_supply(AssetKind::Brand),
        ],
    };

    // the ledger owns the apply-or-rollback loop over the body
    if let Err(e) = ledger.apply_block(block.get_transactions()) {
        return Err((Some(e.position), e.error));
    }
    if let Err(e) = ledger.mint(&leader, AssetKind::Utility, UTILITY_BLOCK_REWARD) {
        undo.restore(ledger);
        return Err((None, e));
    }

    Ok(BlockApplied { undo, touched })
}

// Walk a chain suffix accumulating the stake of the deterministically
// recomputed leader at each height, applying blocks as it goes so the
// validator set evolves exactly as it would on commit
fn suffix_stake_weight(
    mut ledger: TokenLedger,
    mut validators: ValidatorSet,
    base_hash: &Hash,
    base_height: Height,
    blocks: &[Block],
) -> Result<u64, BlockchainError> {
    let mut weight: u64 = 0;
    let mut tip_hash = base_hash.clone();
    let mut height = base_height;
    for block in blocks {
        height += 1;
        let leader = validators.select_leader(&tip_hash, height)?;
        weight = weight.saturating_add(validators.get_stake(&leader));
        let applied = apply_block_to_ledger(&mut ledger, &validators, block, height, &tip_hash)
            .map_err(|(_, e)| e)?;
        validators.refresh(&ledger, applied.touched.into_iter());
        tip_hash = block.get_hash().clone();
    }
    Ok(weight)
}
