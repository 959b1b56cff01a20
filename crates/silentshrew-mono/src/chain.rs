//! Network selection.

use clap::ValueEnum;
use std::fmt;

/// Taproot activated at block 709632 on mainnet; testnet and regtest have it
/// from genesis as far as this indexer is concerned.
const MAINNET_TAPROOT_ACTIVATION_HEIGHT: i32 = 709_632;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// No block below this height can carry a silent payment.
    pub fn taproot_activation_height(&self) -> i32 {
        match self {
            Network::Mainnet => MAINNET_TAPROOT_ACTIVATION_HEIGHT,
            Network::Testnet | Network::Regtest => 0,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}
