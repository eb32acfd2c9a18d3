//! Chain-wide constants, network-upgrade eras and per-network parameters.

pub mod constants;
pub mod params;
pub mod upgrades;

pub use params::{chain_params, ConsensusParams, Network};
pub use upgrades::{current_branch_id, upgrade_active, NetworkUpgrade, UpgradeIndex};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];
