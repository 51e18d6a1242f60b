use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use tokio::{
    sync::{broadcast, RwLock},
    time::interval,
};

use ghostchain_common::{
    crypto::{Address, KeyPair, SecretKey},
    network::Network,
};

use crate::{
    config::{
        NodeConfig, BLOCK_MAX_TXS, CHAIN_SYNC_DELAY_SECS, DISCOVERY_DELAY_SECS,
        MEMPOOL_PROCESS_DELAY_SECS,
    },
    core::{
        blockchain::{Blockchain, ChainParams},
        error::BlockchainError,
        genesis::{load_genesis_state, GenesisState},
        storage::ChainStorage,
    },
    p2p::{discovery::DiscoveryService, P2pServer},
};

const NODE_KEY_FILE: &str = "node_key";

/// Lifecycle of the node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Initializing,
    Syncing,
    Ready,
    ShuttingDown,
}

/// The orchestrator: owns every subsystem, wires the background loops
/// and drives startup and shutdown. Tasks receive handles, never
/// ownership.
pub struct Node {
    config: NodeConfig,
    blockchain: Arc<Blockchain<ChainStorage>>,
    p2p: Arc<P2pServer<ChainStorage>>,
    discovery: Option<Arc<DiscoveryService<ChainStorage>>>,
    miner: Address,
    state: RwLock<NodeState>,
    exit: broadcast::Sender<()>,
}

impl Node {
    /// Startup sequence: open storage, verify and rebuild state, start
    /// the peer manager, then spawn the background loops.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, BlockchainError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            BlockchainError::Genesis(format!("cannot create data dir: {}", e))
        })?;

        let keypair = load_or_create_node_key(&config.data_dir)?;
        let miner = keypair.get_address();
        info!("node identity {} (account {})", keypair.get_public_key(), miner);

        let genesis = match (&config.genesis_file, config.network) {
            (Some(path), _) => load_genesis_state(path)?,
            (None, Network::Devnet) => GenesisState::devnet(miner, config.minimum_stake),
            (None, _) => {
                return Err(BlockchainError::Genesis(
                    "a genesis file is required outside devnet".into(),
                ))
            }
        };

        let storage = ChainStorage::open(&config.data_dir)?;
        let params = ChainParams {
            network: config.network,
            minimum_stake: config.minimum_stake,
            block_time_ms: config.block_time_ms(),
            mempool_capacity: config.mempool_capacity,
            max_block_txs: BLOCK_MAX_TXS,
        };
        let blockchain = Arc::new(Blockchain::new(storage, genesis, params).await?);

        let bind_addr = SocketAddr::new(config.bind_address, config.p2p_port);
        let p2p = P2pServer::start(
            blockchain.clone(),
            keypair.get_public_key().node_id(),
            bind_addr,
            config.max_peers,
            config.max_connections,
        )
        .map_err(|e| BlockchainError::Genesis(format!("p2p startup failed: {}", e)))?;
        info!(
            "gateway collaborator binding reserved at {}:{}",
            config.rpc_address, config.rpc_port
        );

        let discovery = match DiscoveryService::start(p2p.clone(), config.p2p_port).await {
            Ok(discovery) => Some(discovery),
            Err(e) => {
                warn!("peer discovery disabled: {}", e);
                None
            }
        };

        let (exit, _) = broadcast::channel(1);
        let node = Arc::new(Self {
            config,
            blockchain,
            p2p,
            discovery,
            miner,
            state: RwLock::new(NodeState::Initializing),
            exit,
        });

        node.dial_priority_nodes().await;
        node.set_state(NodeState::Syncing).await;
        node.clone().spawn_sync_loop();
        node.clone().spawn_producer_loop();
        node.clone().spawn_mempool_loop();
        node.clone().spawn_discovery_loop();
        Ok(node)
    }

    pub fn get_blockchain(&self) -> &Arc<Blockchain<ChainStorage>> {
        &self.blockchain
    }

    pub fn get_p2p(&self) -> &Arc<P2pServer<ChainStorage>> {
        &self.p2p
    }

    pub async fn get_state(&self) -> NodeState {
        *self.state.read().await
    }

    async fn set_state(&self, state: NodeState) {
        let mut current = self.state.write().await;
        if *current != state {
            info!("node state: {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    async fn dial_priority_nodes(self: &Arc<Self>) {
        for node in &self.config.priority_nodes {
            match node.parse::<SocketAddr>() {
                Ok(addr) => {
                    if let Err(e) = self.p2p.connect_to(addr).await {
                        warn!("cannot reach priority node {}: {}", addr, e);
                    }
                }
                Err(_) => warn!("invalid priority node address: {}", node),
            }
        }
    }

    // Sync round every CHAIN_SYNC_DELAY_SECS; the node turns Ready after
    // the first completed round (with or without peers ahead)
    fn spawn_sync_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(CHAIN_SYNC_DELAY_SECS));
            let mut exit = self.exit.subscribe();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    _ = ticker.tick() => {
                        self.p2p.sync_once().await;
                        if self.get_state().await == NodeState::Syncing {
                            self.set_state(NodeState::Ready).await;
                        }
                    }
                }
            }
            debug!("sync loop exited");
        });
    }

    // One producer slot per block_time_ms; production is paused until
    // the node is Ready and whenever there is no active validator
    fn spawn_producer_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(
                self.blockchain.get_params().block_time_ms,
            ));
            let mut exit = self.exit.subscribe();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    _ = ticker.tick() => {
                        if self.get_state().await != NodeState::Ready {
                            continue;
                        }
                        match self.blockchain.produce_block(&self.miner).await {
                            Ok(Some(block)) => {
                                debug!("slot won, produced {}", block.get_hash());
                            }
                            Ok(None) => {}
                            Err(e) => error!("block production failed: {}", e),
                        }
                    }
                }
            }
            debug!("producer loop exited");
        });
    }

    fn spawn_mempool_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(MEMPOOL_PROCESS_DELAY_SECS));
            let mut exit = self.exit.subscribe();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    _ = ticker.tick() => {
                        self.blockchain.process_mempool().await;
                    }
                }
            }
            debug!("mempool loop exited");
        });
    }

    fn spawn_discovery_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(DISCOVERY_DELAY_SECS));
            let mut exit = self.exit.subscribe();
            loop {
                tokio::select! {
                    _ = exit.recv() => break,
                    _ = ticker.tick() => {
                        if let Some(discovery) = &self.discovery {
                            discovery.announce().await;
                        }
                        self.p2p.maintain_peers().await;
                    }
                }
            }
            debug!("discovery loop exited");
        });
    }

    /// Block until a shutdown signal arrives, then stop everything in
    /// order: tasks first, then peers, then a final storage fsync.
    pub async fn run(self: &Arc<Self>) -> Result<(), BlockchainError> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| BlockchainError::Genesis(format!("signal handler failed: {}", e)))?;
        info!("shutdown signal received");
        self.shutdown().await
    }

    pub async fn shutdown(&self) -> Result<(), BlockchainError> {
        self.set_state(NodeState::ShuttingDown).await;
        let _ = self.exit.send(());
        self.p2p.stop().await;
        // in-flight block applications hold the storage writer lock;
        // flushing waits for them before the final fsync
        self.blockchain.flush_storage().await?;
        info!("node stopped cleanly");
        Ok(())
    }
}

// The node identity key lives under the data dir and is created on
// first run
fn load_or_create_node_key(data_dir: &Path) -> Result<KeyPair, BlockchainError> {
    let path = data_dir.join(NODE_KEY_FILE);
    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BlockchainError::Genesis(format!("cannot read node key: {}", e)))?;
        let bytes = hex::decode(content.trim())
            .map_err(|e| BlockchainError::Genesis(format!("malformed node key: {}", e)))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| BlockchainError::Genesis(format!("malformed node key: {}", e)))?;
        Ok(KeyPair::from_secret(&secret))
    } else {
        let keypair = KeyPair::new();
        std::fs::write(&path, keypair.get_secret_key().to_hex())
            .map_err(|e| BlockchainError::Genesis(format!("cannot write node key: {}", e)))?;
        info!("generated new node key at {}", path.display());
        Ok(keypair)
    }
}
