//! Network-upgrade schedule.
//!
//! Each upgrade activates at a fixed height and carries a consensus branch
//! id; transactions and cached index state are tagged with the branch id of
//! the era they were created in.

/// Height used for upgrades that never activate on a given network.
pub const NO_ACTIVATION_HEIGHT: i32 = i32::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetworkUpgrade {
    pub activation_height: i32,
    pub branch_id: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeIndex {
    /// Launch rules; no shielded pool accounting.
    Base,
    /// Activates the shielded pool and per-block value-pool tracking.
    Aurora,
    /// Tightens shielded rules; new transaction branch id.
    Umbra,
}

impl UpgradeIndex {
    pub const COUNT: usize = 3;

    pub const ALL: [UpgradeIndex; Self::COUNT] =
        [UpgradeIndex::Base, UpgradeIndex::Aurora, UpgradeIndex::Umbra];

    pub fn as_usize(self) -> usize {
        match self {
            UpgradeIndex::Base => 0,
            UpgradeIndex::Aurora => 1,
            UpgradeIndex::Umbra => 2,
        }
    }
}

pub fn upgrade_active(
    height: i32,
    upgrades: &[NetworkUpgrade; UpgradeIndex::COUNT],
    index: UpgradeIndex,
) -> bool {
    height >= upgrades[index.as_usize()].activation_height
}

/// Branch id of the era `height` falls in.
pub fn current_branch_id(height: i32, upgrades: &[NetworkUpgrade; UpgradeIndex::COUNT]) -> u32 {
    let mut branch_id = upgrades[UpgradeIndex::Base.as_usize()].branch_id;
    for upgrade in upgrades.iter() {
        if height >= upgrade.activation_height {
            branch_id = upgrade.branch_id;
        }
    }
    branch_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    #[test]
    fn branch_id_tracks_activation_order() {
        let params = chain_params(Network::Mainnet);
        let aurora = params.upgrades[UpgradeIndex::Aurora.as_usize()];
        let umbra = params.upgrades[UpgradeIndex::Umbra.as_usize()];

        assert_eq!(
            current_branch_id(aurora.activation_height - 1, &params.upgrades),
            params.upgrades[UpgradeIndex::Base.as_usize()].branch_id
        );
        assert_eq!(
            current_branch_id(aurora.activation_height, &params.upgrades),
            aurora.branch_id
        );
        assert_eq!(
            current_branch_id(umbra.activation_height, &params.upgrades),
            umbra.branch_id
        );
        assert!(!upgrade_active(
            aurora.activation_height - 1,
            &params.upgrades,
            UpgradeIndex::Aurora
        ));
    }
}
