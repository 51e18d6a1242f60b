pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Millis per second, it is used to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;

pub const BYTES_PER_KB: usize = 1024;

// Supply rules
// BRAND is hard-capped; bootstrapping past this cap is a genesis error
pub const BRAND_SUPPLY_CAP: u64 = 1_000_000;

// UTILITY minted to the producing leader on each committed block
pub const UTILITY_BLOCK_REWARD: u64 = 50;

// Default validator activation threshold in STAKE base units
pub const DEFAULT_MINIMUM_STAKE: u64 = 1_000_000;
