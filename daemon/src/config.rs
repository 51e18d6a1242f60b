use std::{net::IpAddr, path::PathBuf};

use clap::Parser;
use ghostchain_common::{config::DEFAULT_MINIMUM_STAKE, network::Network};

// In case of potential forks, have a unique network id to not connect to other compatible chains
pub const NETWORK_ID_SIZE: usize = 16;
pub const NETWORK_ID: [u8; NETWORK_ID_SIZE] = [
    0x67, 0x68, 0x6f, 0x73, 0x74, 0x63, 0x68, 0x61, 0x69, 0x6e, 0x2d, 0x6e, 0x6f, 0x64, 0x65, 0x31,
];

// ALPN identifier negotiated on every QUIC connection
pub const P2P_ALPN: &[u8] = b"ghostchain/1.0";

// bind addresses
pub const DEFAULT_P2P_PORT: u16 = 7777;
pub const DEFAULT_P2P_BIND_ADDRESS: &str = "::";

// Peer rules
// default number of maximum peers in the peer table
pub const P2P_DEFAULT_MAX_PEERS: usize = 50;
// default number of maximum concurrent connections
pub const P2P_DEFAULT_MAX_CONNECTIONS: usize = 64;
// millis until we give up an outgoing dial
pub const PEER_DIAL_TIMEOUT_MILLIS: u64 = 10_000;
// seconds without traffic before an idle connection is closed
pub const PEER_IDLE_TIMEOUT_SECS: u64 = 5 * 60;
// millis until we give up reading a single message from a stream
pub const PEER_STREAM_READ_TIMEOUT_MILLIS: u64 = 30_000;
// maximum announcement messages per peer per second, excess closes the stream
pub const PEER_RATE_LIMIT_PER_SEC: u32 = 1_000;
// exponential backoff for dial retries, seconds
pub const PEER_DIAL_BACKOFF_BASE_SECS: u64 = 1;
pub const PEER_DIAL_BACKOFF_CAP_SECS: u64 = 60;
// Maximum accepted message payload, announcements above this close the stream
pub const PEER_MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;

// Gossip rules
// seconds an announcement hash stays in the duplicate-suppression cache
pub const GOSSIP_SEEN_TTL_SECS: u64 = 60;
// entries kept in the duplicate-suppression cache
pub const GOSSIP_SEEN_CACHE_SIZE: usize = 16_384;

// Compile-time validation that the LRU cache sizing is non-zero
const _: () = assert!(
    GOSSIP_SEEN_CACHE_SIZE > 0,
    "GOSSIP_SEEN_CACHE_SIZE must be non-zero"
);

// Chain sync config
// seconds between sync rounds
pub const CHAIN_SYNC_DELAY_SECS: u64 = 5;
// seconds for a whole sync round before the peer is retried next round
pub const CHAIN_SYNC_TIMEOUT_SECS: u64 = 15;
// maximum block span a single BlockRequest may cover
pub const CHAIN_SYNC_REQUEST_MAX_BLOCKS: u64 = 100;

// Discovery config
// seconds between multicast discovery rounds
pub const DISCOVERY_DELAY_SECS: u64 = 30;
// IPv6 multicast group the discovery beacon is sent to
pub const DISCOVERY_MULTICAST_GROUP: &str = "ff12::7777";
pub const DISCOVERY_PORT: u16 = 7778;
// maximum peer addresses returned to one discovery query
pub const DISCOVERY_PEER_LIMIT: usize = 16;

// Mempool rules
pub const MEMPOOL_DEFAULT_CAPACITY: usize = 10_000;
// seconds between mempool maintenance runs
pub const MEMPOOL_PROCESS_DELAY_SECS: u64 = 1;

// Storage rules
// the block index snapshot is rewritten every N committed blocks
pub const BLOCK_INDEX_SNAPSHOT_INTERVAL: u64 = 64;
// default transactions drained from the mempool per produced block
pub const BLOCK_MAX_TXS: usize = 1_000;

/// Exit codes of the `ghostchaind` process.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const STORAGE_CORRUPTION: i32 = 2;
    pub const FATAL_ERROR: i32 = 3;
}

/// Command line surface of the node.
#[derive(Parser, Debug, Clone)]
#[command(name = "ghostchaind", version, about = "GhostChain node daemon")]
pub struct NodeConfig {
    /// Network to join
    #[arg(long, default_value = "mainnet")]
    pub network: Network,

    /// Address the QUIC listener binds to
    #[arg(long, default_value = DEFAULT_P2P_BIND_ADDRESS)]
    pub bind_address: IpAddr,

    /// Port of the QUIC listener
    #[arg(long, default_value_t = DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Address the JSON-RPC gateway collaborator binds to
    #[arg(long, default_value = "127.0.0.1")]
    pub rpc_address: IpAddr,

    /// Port of the JSON-RPC gateway collaborator
    #[arg(long, default_value_t = 8080)]
    pub rpc_port: u16,

    /// Storage root directory
    #[arg(long, default_value = "ghostchain-data")]
    pub data_dir: PathBuf,

    /// Genesis state file, required outside devnet
    #[arg(long)]
    pub genesis_file: Option<PathBuf>,

    /// Validator activation threshold in STAKE base units
    #[arg(long, default_value_t = DEFAULT_MINIMUM_STAKE)]
    pub minimum_stake: u64,

    /// Override the block production cadence in milliseconds
    #[arg(long)]
    pub block_time_ms: Option<u64>,

    /// Maximum peers kept in the peer table
    #[arg(long, default_value_t = P2P_DEFAULT_MAX_PEERS)]
    pub max_peers: usize,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = P2P_DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Maximum pending transactions in the mempool
    #[arg(long, default_value_t = MEMPOOL_DEFAULT_CAPACITY)]
    pub mempool_capacity: usize,

    /// Peers dialed at startup, host:port
    #[arg(long)]
    pub priority_nodes: Vec<String>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl NodeConfig {
    /// Effective block cadence: explicit override or the network default.
    pub fn block_time_ms(&self) -> u64 {
        self.block_time_ms
            .unwrap_or_else(|| self.network.block_time_ms())
    }
}
