//! Height-indexed projection of the current best branch.

use veild_consensus::Hash256;

use crate::blockindex::{BlockIndex, EntryId};

/// The active chain as a dense vector of entry handles; `entries[h]` is the
/// block at height `h`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ActiveChain {
    entries: Vec<EntryId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tip height, or -1 while the chain is empty.
    pub fn height(&self) -> i32 {
        self.entries.len() as i32 - 1
    }

    pub fn tip(&self) -> Option<EntryId> {
        self.entries.last().copied()
    }

    pub fn genesis(&self) -> Option<EntryId> {
        self.entries.first().copied()
    }

    pub fn at(&self, height: i32) -> Option<EntryId> {
        if height < 0 {
            return None;
        }
        self.entries.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: EntryId) -> bool {
        self.at(index.entry(id).height) == Some(id)
    }

    /// Successor of `id` on the active chain, if `id` is on it.
    pub fn next(&self, index: &BlockIndex, id: EntryId) -> Option<EntryId> {
        if !self.contains(index, id) {
            return None;
        }
        self.at(index.entry(id).height + 1)
    }

    /// Reprojects the chain onto the branch ending at `tip`. The shared
    /// prefix is located with ancestor jumps, so only the divergent tail is
    /// rewritten.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: EntryId) {
        let fork_height = match self.tip() {
            Some(current) => index
                .last_common_ancestor(current, tip)
                .map(|fork| index.entry(fork).height)
                .unwrap_or(-1),
            None => -1,
        };
        self.entries.truncate((fork_height + 1) as usize);

        let tip_height = index.entry(tip).height;
        let mut tail = Vec::with_capacity((tip_height - fork_height).max(0) as usize);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let entry = index.entry(id);
            if entry.height <= fork_height {
                break;
            }
            tail.push(id);
            cursor = entry.parent;
        }
        tail.reverse();
        self.entries.extend(tail);
    }

    /// Fork point between the active chain and `other`: equalize heights via
    /// ancestor jumps, then step both probes in lock-step.
    pub fn find_fork(&self, index: &BlockIndex, other: EntryId) -> Option<EntryId> {
        let tip = self.tip()?;
        index.last_common_ancestor(tip, other)
    }

    /// Block locator for peer synchronization: dense near the tip, then
    /// exponentially sparser, always ending at genesis.
    pub fn locator(&self, index: &BlockIndex) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let Some(tip) = self.tip() else {
            return hashes;
        };
        let mut step = 1i32;
        let mut id = tip;
        loop {
            hashes.push(index.entry(id).hash);
            let height = index.entry(id).height;
            if height == 0 {
                break;
            }
            if hashes.len() > 10 {
                step *= 2;
            }
            let next_height = (height - step).max(0);
            id = self
                .at(next_height)
                .expect("locator heights stay within the active chain");
        }
        hashes
    }
}
