//! Bounded per-note cache of historical authentication paths.
//!
//! Every retained note keeps at most `WITNESS_CACHE_SIZE` witnesses, one per
//! recently connected block with the newest at the front, so any reorg
//! within the supported depth can pop back to an older snapshot instead of
//! replaying the chain.

use std::collections::BTreeMap;

use veild_chainstate::commitment::TreeError;
use veild_consensus::constants::MAX_REORG_LENGTH;
use veild_consensus::Hash256;

use crate::notes::{NoteRecord, OutputId};

/// One witness per block up to the deepest reorg the node will follow, plus
/// the snapshot for the tip itself.
pub const WITNESS_CACHE_SIZE: usize = MAX_REORG_LENGTH as usize + 1;

/// Notes handed to each worker during a block's extension step.
const WITNESS_WORKER_BATCH: usize = 64;

#[derive(Default)]
pub struct WitnessCache {
    notes: BTreeMap<OutputId, NoteRecord>,
}

impl WitnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn get(&self, id: &OutputId) -> Option<&NoteRecord> {
        self.notes.get(id)
    }

    pub fn get_mut(&mut self, id: &OutputId) -> Option<&mut NoteRecord> {
        self.notes.get_mut(id)
    }

    pub fn insert(&mut self, record: NoteRecord) {
        self.notes.insert(record.id, record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &NoteRecord> {
        self.notes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NoteRecord> {
        self.notes.values_mut()
    }

    /// Whether a note's witness history is still being advanced at `height`.
    /// Notes spent for longer than the cache depth are outside any plausible
    /// rewind window and stop being maintained.
    pub fn tracks_witness(record: &NoteRecord, height: i32) -> bool {
        if record.position.is_none() || record.witnesses.is_empty() {
            return false;
        }
        match record.spent {
            Some(spend) => height - spend.height <= WITNESS_CACHE_SIZE as i32,
            None => true,
        }
    }

    /// Extends every retained note's front witness with the block's
    /// commitments and pushes the result as the new front snapshot.
    ///
    /// Independent notes are split into disjoint batches, one worker per
    /// batch; the scope join is the barrier required before the block can
    /// commit.
    pub fn extend_witnesses(
        &mut self,
        height: i32,
        commitments: &[Hash256],
    ) -> Result<(), TreeError> {
        let mut active: Vec<&mut NoteRecord> = self
            .notes
            .values_mut()
            .filter(|record| Self::tracks_witness(record, height))
            .collect();
        if active.is_empty() {
            return Ok(());
        }

        let (sender, receiver) = crossbeam_channel::unbounded();
        rayon::scope(|scope| {
            for batch in active.chunks_mut(WITNESS_WORKER_BATCH) {
                let sender = sender.clone();
                scope.spawn(move |_| {
                    for record in batch.iter_mut() {
                        let mut witness = record
                            .witnesses
                            .front()
                            .expect("tracked notes keep at least one witness")
                            .clone();
                        for commitment in commitments {
                            if let Err(err) = witness.append(*commitment) {
                                let _ = sender.send(err);
                                return;
                            }
                        }
                        record.witnesses.push_front(witness);
                        while record.witnesses.len() > WITNESS_CACHE_SIZE {
                            record.witnesses.pop_back();
                        }
                        record.witness_height = height;
                    }
                });
            }
        });
        drop(sender);

        match receiver.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// Drops the tip snapshot of every note that was advanced to `height`,
    /// never going below one retained witness.
    pub fn pop_witnesses(&mut self, height: i32) {
        for record in self.notes.values_mut() {
            if record.witness_height != height {
                continue;
            }
            if record.witnesses.len() > 1 {
                record.witnesses.pop_front();
            }
            record.witness_height = height - 1;
        }
    }

    /// Returns notes minted in the disconnected block at `height` to their
    /// unmined shape.
    pub fn demote_minted(&mut self, height: i32) {
        for record in self.notes.values_mut() {
            if record.confirmed_height == Some(height) {
                record.demote();
            }
        }
    }

    /// Clears the spend status of notes whose spending transaction is in
    /// `orphaned`.
    pub fn clear_spends_by(&mut self, orphaned: &[Hash256]) {
        for record in self.notes.values_mut() {
            if let Some(spend) = record.spent {
                if orphaned.contains(&spend.txid) {
                    record.spent = None;
                }
            }
        }
    }

    /// Truncates the witness history of long-spent notes to a single entry.
    pub fn decay_spent(&mut self, height: i32) {
        for record in self.notes.values_mut() {
            let Some(spend) = record.spent else {
                continue;
            };
            if height - spend.height > WITNESS_CACHE_SIZE as i32 {
                while record.witnesses.len() > 1 {
                    record.witnesses.pop_back();
                }
            }
        }
    }

    /// Lowest height any retained note's witness has been advanced to, over
    /// notes still being maintained at `height`.
    pub fn min_witness_height(&self, height: i32) -> Option<i32> {
        self.notes
            .values()
            .filter(|record| Self::tracks_witness(record, height))
            .map(|record| record.witness_height)
            .min()
    }

    /// Note owning `nullifier`, if any.
    pub fn find_by_nullifier(&mut self, nullifier: &Hash256) -> Option<&mut NoteRecord> {
        self.notes
            .values_mut()
            .find(|record| record.nullifier.as_ref() == Some(nullifier))
    }
}
