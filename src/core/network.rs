//! Network parameters
//!
//! The network only affects how keys and scripts are rendered at the
//! boundary (extended key versions, address prefixes); script logic is
//! network independent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bitcoin network a deployment runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Network::Main
    }
}

impl Network {
    /// Version bytes of an extended public key (`xpub` / `tpub`)
    pub fn xpub_version(&self) -> u32 {
        match self {
            Network::Main => 0x0488_b21e,
            Network::Test | Network::Regtest => 0x0435_87cf,
        }
    }

    /// Base58 version byte for pay-to-pubkey-hash addresses
    pub fn p2pkh_prefix(&self) -> u8 {
        match self {
            Network::Main => 0x00,
            Network::Test | Network::Regtest => 0x6f,
        }
    }

    /// Base58 version byte for pay-to-script-hash addresses
    pub fn p2sh_prefix(&self) -> u8 {
        match self {
            Network::Main => 0x05,
            Network::Test | Network::Regtest => 0xc4,
        }
    }

    /// Human readable part of segwit addresses
    pub fn bech32_hrp(&self) -> bech32::Hrp {
        match self {
            Network::Main => bech32::hrp::BC,
            Network::Test => bech32::hrp::TB,
            Network::Regtest => bech32::hrp::BCRT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}
