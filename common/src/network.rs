use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::config::MILLIS_PER_SECOND;

/// Which chain this node participates in. Selects block cadence and
/// default ports so test chains never mix with production.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl Network {
    /// Block production cadence in milliseconds.
    pub const fn block_time_ms(&self) -> u64 {
        match self {
            Network::Mainnet => 12 * MILLIS_PER_SECOND,
            Network::Testnet | Network::Devnet => 2 * MILLIS_PER_SECOND,
        }
    }

    pub const fn is_mainnet(&self) -> bool {
        matches!(self, Network::Mainnet)
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Devnet => write!(f, "devnet"),
        }
    }
}

impl FromStr for Network {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err("Invalid network"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_time_per_network() {
        assert_eq!(Network::Mainnet.block_time_ms(), 12_000);
        assert_eq!(Network::Testnet.block_time_ms(), 2_000);
        assert_eq!(Network::Devnet.block_time_ms(), 2_000);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(Network::from_str("Testnet").unwrap(), Network::Testnet);
        assert!(Network::from_str("other").is_err());
    }
}
