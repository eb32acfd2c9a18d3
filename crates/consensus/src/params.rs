use crate::upgrades::{NetworkUpgrade, UpgradeIndex, NO_ACTIVATION_HEIGHT};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    /// Expected genesis hash; `None` on regtest where tests mine their own.
    pub hash_genesis_block: Option<Hash256>,
    pub upgrades: [NetworkUpgrade; UpgradeIndex::COUNT],
}

pub fn chain_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => ConsensusParams {
            network,
            hash_genesis_block: Some(MAINNET_GENESIS_HASH),
            upgrades: [
                NetworkUpgrade {
                    activation_height: 0,
                    branch_id: 0,
                },
                NetworkUpgrade {
                    activation_height: 150_000,
                    branch_id: 0x7e0d_a3c1,
                },
                NetworkUpgrade {
                    activation_height: 610_000,
                    branch_id: 0x44cc_9f3a,
                },
            ],
        },
        Network::Testnet => ConsensusParams {
            network,
            hash_genesis_block: Some(TESTNET_GENESIS_HASH),
            upgrades: [
                NetworkUpgrade {
                    activation_height: 0,
                    branch_id: 0,
                },
                NetworkUpgrade {
                    activation_height: 2_000,
                    branch_id: 0x7e0d_a3c1,
                },
                NetworkUpgrade {
                    activation_height: 12_500,
                    branch_id: 0x44cc_9f3a,
                },
            ],
        },
        Network::Regtest => ConsensusParams {
            network,
            hash_genesis_block: None,
            upgrades: [
                NetworkUpgrade {
                    activation_height: 0,
                    branch_id: 0,
                },
                NetworkUpgrade {
                    activation_height: 0,
                    branch_id: 0x7e0d_a3c1,
                },
                NetworkUpgrade {
                    activation_height: NO_ACTIVATION_HEIGHT,
                    branch_id: 0x44cc_9f3a,
                },
            ],
        },
    }
}

const MAINNET_GENESIS_HASH: Hash256 = [
    0x00, 0x00, 0x03, 0x7c, 0x21, 0x8a, 0xe9, 0x5f, 0x60, 0x5b, 0x5f, 0x9e, 0x45, 0x1d, 0x2f,
    0xa1, 0x7e, 0x33, 0x5c, 0x08, 0x49, 0xb2, 0x6d, 0x12, 0x78, 0x90, 0xaf, 0x6b, 0x14, 0x53,
    0x02, 0x00,
];

const TESTNET_GENESIS_HASH: Hash256 = [
    0x00, 0x00, 0x5e, 0x90, 0x3b, 0xa2, 0x61, 0x74, 0x85, 0x4d, 0x4b, 0x4c, 0x1d, 0x2b, 0x83,
    0x7c, 0x5e, 0x26, 0xf0, 0xc1, 0x8e, 0x0d, 0xd4, 0x45, 0x5f, 0xae, 0x15, 0x7a, 0x09, 0x2c,
    0x06, 0x00,
];
