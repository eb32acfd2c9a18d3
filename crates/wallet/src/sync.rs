//! Chain-sync coordinator.
//!
//! One owner for the block index, the active chain, the commitment
//! accumulator and the witness cache. Every mutating entry point takes
//! `&mut self`, so the "one block at a time" critical section is enforced by
//! the type system rather than a lock: block N+1 cannot start until block
//! N's update has returned.

use std::collections::HashMap;
use std::time::Instant;

use veild_chainstate::blockindex::{BlockIndex, EntryId, IndexError};
use veild_chainstate::chain::ActiveChain;
use veild_chainstate::commitment::{
    AuthPath, CommitmentAccumulator, IncrementalTree, IncrementalWitness, TreeError,
};
use veild_consensus::constants::MAX_REORG_LENGTH;
use veild_consensus::{ConsensusParams, Hash256};
use veild_primitives::block::{Block, BlockHeader};
use veild_primitives::encoding::DecodeError;
use veild_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::metrics::{SyncMetrics, SyncMetricsSnapshot};
use crate::notes::{derive_nullifier, ConfirmedSpend, DecryptedNote, NoteRecord, NullifierIndex, OutputId};
use crate::witness::{WitnessCache, WITNESS_CACHE_SIZE};

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";
const WALLET_META_ACCUMULATOR_KEY: &[u8] = b"accumulator";
const REBUILD_PROGRESS_INTERVAL: u64 = 100_000;

#[derive(Debug)]
pub enum SyncError {
    Index(IndexError),
    Tree(TreeError),
    Store(StoreError),
    Decode(DecodeError),
    InvalidBlock(&'static str),
    ValueOutOfRange,
    /// The accumulator root disagrees with the chain's recorded root; the
    /// coordinator is halted.
    RootMismatch { height: i32 },
    /// The coordinator was halted by an earlier consistency violation.
    Corrupted(&'static str),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Index(err) => write!(f, "{err}"),
            SyncError::Tree(err) => write!(f, "{err}"),
            SyncError::Store(err) => write!(f, "{err}"),
            SyncError::Decode(err) => write!(f, "{err}"),
            SyncError::InvalidBlock(message) => write!(f, "{message}"),
            SyncError::ValueOutOfRange => write!(f, "value out of range"),
            SyncError::RootMismatch { height } => {
                write!(f, "commitment root mismatch at height {height}")
            }
            SyncError::Corrupted(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<IndexError> for SyncError {
    fn from(err: IndexError) -> Self {
        SyncError::Index(err)
    }
}

impl From<TreeError> for SyncError {
    fn from(err: TreeError) -> Self {
        SyncError::Tree(err)
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err)
    }
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::Decode(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncState {
    Idle,
    Connecting,
    Rewinding,
    Rebuilding,
}

/// A shielded output the decryption layer managed to open, keyed back to its
/// transaction and output slot.
#[derive(Clone, Debug)]
pub struct DecryptedOutput {
    pub txid: Hash256,
    pub index: u32,
    pub note: DecryptedNote,
}

/// Everything a balance or spend-proof consumer needs for one note.
#[derive(Clone, Debug)]
pub struct NoteSummary {
    pub confirmed_height: i32,
    pub nullifier: Option<Hash256>,
    pub anchor: Hash256,
    pub path: AuthPath,
}

pub struct ChainSync {
    params: ConsensusParams,
    index: BlockIndex,
    chain: ActiveChain,
    accumulator: CommitmentAccumulator,
    wallet: WitnessCache,
    nullifiers: NullifierIndex,
    state: SyncState,
    corrupt: Option<&'static str>,
    metrics: SyncMetrics,
}

impl ChainSync {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            index: BlockIndex::new(),
            chain: ActiveChain::new(),
            accumulator: CommitmentAccumulator::new(),
            wallet: WitnessCache::new(),
            nullifiers: NullifierIndex::new(),
            state: SyncState::Idle,
            corrupt: None,
            metrics: SyncMetrics::default(),
        }
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn accumulator(&self) -> &CommitmentAccumulator {
        &self.accumulator
    }

    pub fn wallet(&self) -> &WitnessCache {
        &self.wallet
    }

    pub fn nullifiers(&self) -> &NullifierIndex {
        &self.nullifiers
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt.is_some()
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Peer-sync surface.
    pub fn locator(&self) -> Vec<Hash256> {
        self.chain.locator(&self.index)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index
            .lookup(hash)
            .map(|id| self.chain.contains(&self.index, id))
            .unwrap_or(false)
    }

    pub fn find_fork(&self, hash: &Hash256) -> Option<Hash256> {
        let id = self.index.lookup(hash)?;
        let fork = self.chain.find_fork(&self.index, id)?;
        Some(self.index.entry(fork).hash)
    }

    pub fn ancestor(&self, hash: &Hash256, height: i32) -> Option<Hash256> {
        let id = self.index.lookup(hash)?;
        let ancestor = self.index.ancestor(id, height)?;
        Some(self.index.entry(ancestor).hash)
    }

    /// Registers a header without connecting it; used while headers race
    /// ahead of block download.
    pub fn add_header(&mut self, header: &BlockHeader) -> Result<EntryId, SyncError> {
        self.guard()?;
        Ok(self.index.insert_header(header, &self.params)?)
    }

    pub fn note_summary(&self, id: &OutputId) -> Option<NoteSummary> {
        let record = self.wallet.get(id)?;
        let witness = record.front_witness()?;
        Some(NoteSummary {
            confirmed_height: record.confirmed_height?,
            nullifier: record.nullifier,
            anchor: witness.root(),
            path: witness.path(),
        })
    }

    fn guard(&self) -> Result<(), SyncError> {
        match self.corrupt {
            Some(message) => Err(SyncError::Corrupted(message)),
            None => Ok(()),
        }
    }

    fn halt(&mut self, message: &'static str, height: i32) -> SyncError {
        self.corrupt = Some(message);
        self.metrics.record_corruption();
        tracing::error!(height, message, "halting chain sync");
        SyncError::RootMismatch { height }
    }

    fn chain_root_at(&self, height: i32) -> Option<Hash256> {
        let id = self.chain.at(height)?;
        Some(self.index.entry(id).commitment_root)
    }

    /// Applies one block on top of the active tip: append its commitments,
    /// extend witnesses, checkpoint, then cross-check the accumulator root
    /// against the header's claimed commitment root.
    pub fn connect_block(
        &mut self,
        block: &Block,
        decrypted: &[DecryptedOutput],
    ) -> Result<(), SyncError> {
        self.guard()?;
        let started = Instant::now();

        if self.accumulator.connected_height() != self.chain.height() {
            self.reconcile_accumulator()?;
        }
        if self.witnesses_stale() {
            self.rebuild_witnesses()?;
        }

        let id = self.index.insert_header(&block.header, &self.params)?;
        let (height, parent) = {
            let entry = self.index.entry(id);
            (entry.height, entry.parent)
        };
        match self.chain.tip() {
            Some(tip) => {
                if parent != Some(tip) {
                    return Err(SyncError::InvalidBlock("block does not extend the active tip"));
                }
            }
            None => {
                if height != 0 {
                    return Err(SyncError::InvalidBlock(
                        "missing active chain for non-genesis block",
                    ));
                }
            }
        }

        self.state = SyncState::Connecting;
        let result = self.connect_inner(block, decrypted, id, height);
        self.state = SyncState::Idle;
        if result.is_ok() {
            self.metrics.record_connect(started.elapsed());
        }
        result
    }

    fn connect_inner(
        &mut self,
        block: &Block,
        decrypted: &[DecryptedOutput],
        id: EntryId,
        height: i32,
    ) -> Result<(), SyncError> {
        let commitments: Vec<Hash256> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.shielded_outputs.iter().map(|output| output.commitment))
            .collect();

        let decrypted_by_slot: HashMap<(Hash256, u32), &DecryptedNote> = decrypted
            .iter()
            .map(|output| ((output.txid, output.index), &output.note))
            .collect();

        let mut pending: Vec<NoteRecord> = Vec::new();
        let mut shielded_delta = 0i64;
        for tx in &block.transactions {
            let txid = tx.txid();
            shielded_delta = shielded_delta
                .checked_sub(tx.value_balance)
                .ok_or(SyncError::ValueOutOfRange)?;
            for (output_index, output) in tx.shielded_outputs.iter().enumerate() {
                let commitment = output.commitment;
                let position = self.accumulator.append(commitment)?;
                // notes minted earlier in this block extend past this output
                for record in pending.iter_mut() {
                    if let Some(front) = record.witnesses.front_mut() {
                        front.append(commitment)?;
                    }
                }
                let slot = (txid, output_index as u32);
                if let Some(note) = decrypted_by_slot.get(&slot) {
                    let witness =
                        IncrementalWitness::from_tree(self.accumulator.frontier().clone())?;
                    let output_id = OutputId {
                        txid,
                        index: output_index as u32,
                    };
                    let mut record =
                        NoteRecord::unmined(output_id, commitment, (*note).clone());
                    record.confirmed_height = Some(height);
                    record.position = Some(position);
                    record.nullifier =
                        Some(derive_nullifier(&note.nullifier_key, &commitment, position));
                    record.witnesses.push_front(witness);
                    record.witness_height = height;
                    pending.push(record);
                }
            }
        }
        // every previously retained witness sees the whole block; the worker
        // pool joins before anything below runs
        self.wallet.extend_witnesses(height, &commitments)?;
        for record in pending {
            self.wallet.insert(record);
        }

        for tx in &block.transactions {
            let txid = tx.txid();
            for spend in &tx.shielded_spends {
                self.nullifiers.insert(spend.nullifier, txid);
                if let Some(record) = self.wallet.find_by_nullifier(&spend.nullifier) {
                    record.spent = Some(ConfirmedSpend { txid, height });
                }
            }
        }

        self.accumulator.checkpoint(height);
        let root = self.accumulator.root();
        if root != block.header.commitment_root {
            return Err(self.halt("accumulator root diverged from connected block", height));
        }

        self.wallet.decay_spent(height);
        self.accumulator.prune_checkpoints(height - MAX_REORG_LENGTH);
        self.index.record_connected(id, &self.params, shielded_delta);
        self.chain.set_tip(&self.index, id);
        Ok(())
    }

    /// Unwinds the active tip: restore the checkpoint below it, pop
    /// witnesses, and drop nullifier entries whose spending transaction was
    /// orphaned.
    pub fn disconnect_block(&mut self, block: &Block) -> Result<(), SyncError> {
        self.guard()?;
        let started = Instant::now();

        let tip = self
            .chain
            .tip()
            .ok_or(SyncError::InvalidBlock("no active tip to disconnect"))?;
        let tip_entry = self.index.entry(tip);
        if block.header.hash() != tip_entry.hash {
            return Err(SyncError::InvalidBlock("block does not match the active tip"));
        }
        let height = tip_entry.height;
        let parent = match tip_entry.parent {
            Some(parent) => parent,
            None => return Err(SyncError::InvalidBlock("cannot disconnect genesis")),
        };

        self.state = SyncState::Rewinding;
        let result = self.disconnect_inner(block, parent, height);
        self.state = SyncState::Idle;
        if result.is_ok() {
            self.metrics.record_disconnect(started.elapsed());
        }
        result
    }

    fn disconnect_inner(
        &mut self,
        block: &Block,
        parent: EntryId,
        height: i32,
    ) -> Result<(), SyncError> {
        let restored_root = self.accumulator.rewind(height - 1)?;
        let expected = self.index.entry(parent).commitment_root;
        if restored_root != expected {
            return Err(self.halt("accumulator root diverged from rewound chain", height - 1));
        }

        self.wallet.pop_witnesses(height);

        let orphaned: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
        for txid in &orphaned {
            self.nullifiers.remove_tx(txid);
        }
        self.wallet.clear_spends_by(&orphaned);
        self.wallet.demote_minted(height);

        self.chain.set_tip(&self.index, parent);
        Ok(())
    }

    /// An accumulator out of step with the chain is only recoverable by
    /// rewinding; anything else means the two diverged silently.
    fn reconcile_accumulator(&mut self) -> Result<(), SyncError> {
        let chain_height = self.chain.height();
        let connected = self.accumulator.connected_height();
        if connected > chain_height && self.accumulator.checkpoint_at(chain_height).is_some() {
            self.state = SyncState::Rewinding;
            let restored_root = self.accumulator.rewind(chain_height)?;
            self.state = SyncState::Idle;
            let expected = self
                .chain_root_at(chain_height)
                .ok_or(SyncError::Corrupted("active chain lost its tip entry"))?;
            if restored_root != expected {
                return Err(self.halt("accumulator root diverged from rewound chain", chain_height));
            }
            return Ok(());
        }
        self.corrupt = Some("accumulator out of step with the active chain");
        self.metrics.record_corruption();
        tracing::error!(
            connected,
            chain_height,
            "accumulator out of step with the active chain; halting"
        );
        Err(SyncError::Corrupted(
            "accumulator out of step with the active chain",
        ))
    }

    /// Whether any retained note still needs witnessing from behind the
    /// accumulator's connected height.
    fn witnesses_stale(&self) -> bool {
        let tip_height = self.accumulator.connected_height();
        match self.wallet.min_witness_height(tip_height) {
            Some(min) => min < tip_height,
            None => false,
        }
    }

    /// Replays the accumulator forward once from the deepest position any
    /// affected note requires, rebuilding every stale witness in the same
    /// pass. Notes are never rebuilt one at a time.
    pub fn rebuild_witnesses(&mut self) -> Result<(), SyncError> {
        self.guard()?;
        let started = Instant::now();
        let tip_height = self.accumulator.connected_height();

        let mut affected: Vec<(OutputId, u64)> = Vec::new();
        for record in self.wallet.iter() {
            let Some(position) = record.position else {
                continue;
            };
            let within_window = match record.spent {
                Some(spend) => tip_height - spend.height <= WITNESS_CACHE_SIZE as i32,
                None => true,
            };
            if !within_window {
                continue;
            }
            if record.witnesses.is_empty() || record.witness_height != tip_height {
                affected.push((record.id, position));
                continue;
            }
            let mismatched = match self.chain_root_at(record.witness_height) {
                Some(root) => record
                    .front_witness()
                    .map(|witness| witness.root() != root)
                    .unwrap_or(true),
                None => true,
            };
            if mismatched {
                tracing::warn!(
                    txid = ?record.id.txid,
                    output = record.id.index,
                    witness_height = record.witness_height,
                    "cached witness root does not match the chain; scheduling rebuild"
                );
                affected.push((record.id, position));
            }
        }
        if affected.is_empty() {
            return Ok(());
        }

        self.state = SyncState::Rebuilding;
        let result = self.rebuild_inner(&affected, tip_height);
        self.state = SyncState::Idle;
        if result.is_ok() {
            self.metrics.record_rebuild(started.elapsed());
        }
        result
    }

    fn rebuild_inner(
        &mut self,
        affected: &[(OutputId, u64)],
        tip_height: i32,
    ) -> Result<(), SyncError> {
        let min_position = affected
            .iter()
            .map(|(_, position)| *position)
            .min()
            .expect("affected is non-empty");
        let base = self.accumulator.replay_base(min_position);
        let (mut tree, start): (IncrementalTree, u64) = self.accumulator.replay_frontier(base);
        tracing::info!(
            notes = affected.len(),
            from_position = start,
            "witness rebuild started"
        );

        let wanted: HashMap<u64, OutputId> = affected
            .iter()
            .map(|(id, position)| (*position, *id))
            .collect();
        let leaves = self.accumulator.leaves_from(start);
        let total = leaves.len() as u64;
        let mut rebuilt: Vec<(OutputId, IncrementalWitness)> = Vec::with_capacity(affected.len());
        for (offset, leaf) in leaves.iter().enumerate() {
            let position = start + offset as u64;
            tree.append(*leaf)?;
            for (_, witness) in rebuilt.iter_mut() {
                witness.append(*leaf)?;
            }
            if let Some(id) = wanted.get(&position) {
                rebuilt.push((*id, IncrementalWitness::from_tree(tree.clone())?));
            }
            let replayed = offset as u64 + 1;
            if replayed % REBUILD_PROGRESS_INTERVAL == 0 {
                tracing::info!(replayed, total, "witness rebuild progress");
            }
        }

        if tree.root() != self.accumulator.root() {
            return Err(self.halt("witness rebuild diverged from the accumulator", tip_height));
        }
        if rebuilt.len() != affected.len() {
            return Err(SyncError::Corrupted(
                "note position beyond the accumulator; resync required",
            ));
        }

        for (id, witness) in rebuilt {
            if let Some(record) = self.wallet.get_mut(&id) {
                record.witnesses.clear();
                record.witnesses.push_front(witness);
                record.witness_height = tip_height;
            }
        }
        tracing::info!(notes = affected.len(), replayed = total, "witness rebuild completed");
        Ok(())
    }

    /// Persists the index, active chain, accumulator and note records in one
    /// batch; a crash between saves resumes from the previous batch, which
    /// is equivalent to re-entering a rebuild.
    pub fn save<S: KeyValueStore>(&self, store: &S) -> Result<(), SyncError> {
        let mut batch = WriteBatch::new();
        self.index.put_all(&mut batch);
        for height in 0..=self.chain.height() {
            let id = self
                .chain
                .at(height)
                .expect("projection is dense up to its tip");
            batch.put(
                Column::HeightIndex,
                (height as u32).to_be_bytes().to_vec(),
                self.index.entry(id).hash.to_vec(),
            );
        }
        if let Some(tip) = self.chain.tip() {
            batch.put(
                Column::Meta,
                META_BEST_BLOCK_KEY.to_vec(),
                self.index.entry(tip).hash.to_vec(),
            );
        }
        batch.put(
            Column::WalletMeta,
            WALLET_META_ACCUMULATOR_KEY.to_vec(),
            self.accumulator.encode(),
        );
        for record in self.wallet.iter() {
            batch.put(
                Column::WalletNote,
                record.id.key_bytes().to_vec(),
                record.encode(),
            );
        }
        store.write_batch(&batch)?;
        Ok(())
    }

    /// Restores persisted state and schedules a rebuild for any witness that
    /// no longer matches the chain's recorded roots.
    pub fn load<S: KeyValueStore>(
        store: &S,
        params: ConsensusParams,
    ) -> Result<Self, SyncError> {
        let index = BlockIndex::load(store, &params)?;
        let mut chain = ActiveChain::new();
        if let Some(bytes) = store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            if bytes.len() != 32 {
                return Err(SyncError::Corrupted("invalid best block record"));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            let tip = index
                .lookup(&hash)
                .ok_or(SyncError::Corrupted("best block missing from the index"))?;
            chain.set_tip(&index, tip);
        }

        let accumulator = match store.get(Column::WalletMeta, WALLET_META_ACCUMULATOR_KEY)? {
            Some(bytes) => CommitmentAccumulator::decode(&bytes)?,
            None => CommitmentAccumulator::new(),
        };

        let mut wallet = WitnessCache::new();
        let mut nullifiers = NullifierIndex::new();
        for (_, value) in store.scan_prefix(Column::WalletNote, &[])? {
            let record = NoteRecord::decode(&value)?;
            if let (Some(nullifier), Some(spend)) = (record.nullifier, record.spent) {
                nullifiers.insert(nullifier, spend.txid);
            }
            wallet.insert(record);
        }

        let mut sync = Self {
            params,
            index,
            chain,
            accumulator,
            wallet,
            nullifiers,
            state: SyncState::Idle,
            corrupt: None,
            metrics: SyncMetrics::default(),
        };
        if sync.accumulator.connected_height() != sync.chain.height() {
            sync.reconcile_accumulator()?;
        }
        sync.rebuild_witnesses()?;
        Ok(sync)
    }
}
