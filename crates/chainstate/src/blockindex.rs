//! Block index: every known header as a node of a tree.
//!
//! Entries live in a stable arena and address each other by handle, so the
//! parent and skip references are plain indices with no ownership hazards.
//! An entry is created on header receipt and never removed; only its status
//! bits (and, at connect time, its era-gated fields) change afterwards.

use std::collections::HashMap;

use primitive_types::U256;
use veild_consensus::constants::MEDIAN_TIME_SPAN;
use veild_consensus::upgrades::{current_branch_id, upgrade_active, UpgradeIndex};
use veild_consensus::{ConsensusParams, Hash256, ZERO_HASH};
use veild_primitives::block::BlockHeader;
use veild_primitives::encoding::{DecodeError, Decoder, Encoder};
use veild_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// Validity levels stored in the low bits of the status mask. Levels only
/// ever increase, except when a branch is marked failed.
pub const BLOCK_VALID_HEADER: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_SCRIPTS: u32 = 4;
const BLOCK_VALID_MASK: u32 = 0x07;

/// Full block data is stored for this entry.
pub const STATUS_HAVE_DATA: u32 = 0x08;
/// The block itself failed validation.
pub const STATUS_FAILED: u32 = 0x20;
/// The block descends from a failed block.
pub const STATUS_FAILED_CHILD: u32 = 0x40;

pub fn validity_level(status: u32) -> u32 {
    status & BLOCK_VALID_MASK
}

pub fn status_failed(status: u32) -> bool {
    status & (STATUS_FAILED | STATUS_FAILED_CHILD) != 0
}

#[derive(Debug)]
pub enum IndexError {
    MissingParent,
    GenesisMismatch,
    Decode(DecodeError),
    Store(StoreError),
    CorruptIndex(&'static str),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::MissingParent => write!(f, "missing parent header"),
            IndexError::GenesisMismatch => write!(f, "genesis hash mismatch"),
            IndexError::Decode(err) => write!(f, "{err}"),
            IndexError::Store(err) => write!(f, "{err}"),
            IndexError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<DecodeError> for IndexError {
    fn from(err: DecodeError) -> Self {
        IndexError::Decode(err)
    }
}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

/// Stable handle into the index arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EntryId(u32);

impl EntryId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Net movement into the shielded value pool caused by one block. Tracked
/// only from the era that activates the pool.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ValuePoolDeltas {
    pub shielded: i64,
}

#[derive(Clone, Debug)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub parent: Option<EntryId>,
    pub skip: Option<EntryId>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    pub time: u32,
    pub bits: u32,
    pub nonce: Hash256,
    pub solution: Vec<u8>,
    pub commitment_root: Hash256,
    pub branch_id: Option<u32>,
    pub pool_deltas: Option<ValuePoolDeltas>,
}

#[derive(Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, EntryId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, id: EntryId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<EntryId> {
        self.by_hash.get(hash).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        (0..self.entries.len() as u32).map(EntryId)
    }

    /// Inserts a header, linking it into the tree. Returns the existing
    /// handle when the header is already known.
    pub fn insert_header(
        &mut self,
        header: &BlockHeader,
        params: &ConsensusParams,
    ) -> Result<EntryId, IndexError> {
        let hash = header.hash();
        if let Some(existing) = self.lookup(&hash) {
            return Ok(existing);
        }

        let is_genesis = header.prev_block == ZERO_HASH;
        let (parent, height, prev_work) = if is_genesis {
            if let Some(expected) = params.hash_genesis_block {
                if hash != expected {
                    return Err(IndexError::GenesisMismatch);
                }
            }
            (None, 0, U256::zero())
        } else {
            let parent = self
                .lookup(&header.prev_block)
                .ok_or(IndexError::MissingParent)?;
            let parent_entry = self.entry(parent);
            (
                Some(parent),
                parent_entry.height + 1,
                parent_entry.chain_work,
            )
        };

        let skip = parent.and_then(|parent| self.ancestor(parent, skip_height(height)));
        let mut status = BLOCK_VALID_HEADER;
        if let Some(parent) = parent {
            if status_failed(self.entry(parent).status) {
                status |= STATUS_FAILED_CHILD;
            }
        }

        let id = EntryId(self.entries.len() as u32);
        self.entries.push(BlockIndexEntry {
            hash,
            parent,
            skip,
            height,
            chain_work: prev_work + work_from_bits(header.bits),
            status,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            solution: header.solution.clone(),
            commitment_root: header.commitment_root,
            branch_id: None,
            pool_deltas: None,
        });
        self.by_hash.insert(hash, id);
        Ok(id)
    }

    /// Raises the validity level; never lowers it, and never raises a failed
    /// entry. Returns whether the status changed.
    pub fn raise_validity(&mut self, id: EntryId, level: u32) -> bool {
        let entry = &mut self.entries[id.index()];
        if status_failed(entry.status) || validity_level(entry.status) >= level {
            return false;
        }
        entry.status = (entry.status & !BLOCK_VALID_MASK) | (level & BLOCK_VALID_MASK);
        true
    }

    pub fn set_have_data(&mut self, id: EntryId) {
        self.entries[id.index()].status |= STATUS_HAVE_DATA;
    }

    /// Marks the entry failed and flags every descendant.
    pub fn mark_failed(&mut self, id: EntryId) {
        self.entries[id.index()].status |= STATUS_FAILED;
        let failed_height = self.entries[id.index()].height;
        for candidate in 0..self.entries.len() as u32 {
            let candidate = EntryId(candidate);
            if candidate == id || self.entry(candidate).height <= failed_height {
                continue;
            }
            if self.ancestor(candidate, failed_height) == Some(id) {
                self.entries[candidate.index()].status |= STATUS_FAILED_CHILD;
            }
        }
    }

    /// Records the era-gated fields once the block body has been applied.
    pub fn record_connected(
        &mut self,
        id: EntryId,
        params: &ConsensusParams,
        shielded_delta: i64,
    ) {
        let height = self.entries[id.index()].height;
        if upgrade_active(height, &params.upgrades, UpgradeIndex::Aurora) {
            let entry = &mut self.entries[id.index()];
            entry.branch_id = Some(current_branch_id(height, &params.upgrades));
            entry.pool_deltas = Some(ValuePoolDeltas {
                shielded: shielded_delta,
            });
        }
        self.set_have_data(id);
        self.raise_validity(id, BLOCK_VALID_SCRIPTS);
    }

    /// Ancestor of `id` at exactly `height`, using the skip reference when it
    /// jumps closer without overshooting and the parent link otherwise. Always
    /// equivalent to a naive repeated-parent walk.
    pub fn ancestor(&self, id: EntryId, height: i32) -> Option<EntryId> {
        if height < 0 || height > self.entry(id).height {
            return None;
        }
        let mut walk = id;
        while self.entry(walk).height > height {
            let entry = self.entry(walk);
            let jump = skip_height(entry.height);
            walk = match entry.skip {
                Some(skip) if jump >= height => skip,
                _ => entry.parent?,
            };
        }
        Some(walk)
    }

    /// Least common ancestor of two entries; `None` only for disjoint trees.
    /// Symmetric in its arguments.
    pub fn last_common_ancestor(&self, a: EntryId, b: EntryId) -> Option<EntryId> {
        let (mut a, mut b) = (a, b);
        let height_a = self.entry(a).height;
        let height_b = self.entry(b).height;
        if height_a > height_b {
            a = self.ancestor(a, height_b)?;
        } else if height_b > height_a {
            b = self.ancestor(b, height_a)?;
        }
        while a != b {
            match (self.entry(a).parent, self.entry(b).parent) {
                (Some(parent_a), Some(parent_b)) => {
                    a = parent_a;
                    b = parent_b;
                }
                _ => return None,
            }
        }
        Some(a)
    }

    /// Median of the timestamps of up to the last `MEDIAN_TIME_SPAN` blocks
    /// ending at `id` (inclusive). Even-sized samples take the lower of the
    /// two middle values; the tie-break feeds consensus timestamp rules and
    /// must not drift.
    pub fn median_time_past(&self, id: EntryId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.entry(current);
            times.push(entry.time);
            cursor = entry.parent;
        }
        times.sort_unstable();
        times[(times.len() - 1) / 2]
    }

    /// Best header by cumulative work among entries not marked failed.
    pub fn best_header(&self) -> Option<EntryId> {
        let mut best: Option<EntryId> = None;
        for id in self.ids() {
            let entry = self.entry(id);
            if status_failed(entry.status) {
                continue;
            }
            match best {
                Some(current) if self.entry(current).chain_work >= entry.chain_work => {}
                _ => best = Some(id),
            }
        }
        best
    }

    pub fn put_entry(&self, batch: &mut WriteBatch, id: EntryId) {
        let entry = self.entry(id);
        let prev_hash = entry
            .parent
            .map(|parent| self.entry(parent).hash)
            .unwrap_or(ZERO_HASH);
        batch.put(
            Column::BlockIndex,
            entry.hash.to_vec(),
            encode_entry(entry, &prev_hash),
        );
    }

    pub fn put_all(&self, batch: &mut WriteBatch) {
        for id in self.ids() {
            self.put_entry(batch, id);
        }
    }

    /// Rebuilds the arena from persisted records, re-linking parents and
    /// recomputing skip references.
    pub fn load<S: KeyValueStore>(
        store: &S,
        params: &ConsensusParams,
    ) -> Result<Self, IndexError> {
        let mut records = Vec::new();
        for (key, value) in store.scan_prefix(Column::BlockIndex, &[])? {
            if key.len() != 32 {
                return Err(IndexError::CorruptIndex("invalid block index key"));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            records.push(decode_entry(&hash, &value)?);
        }
        records.sort_by_key(|record| record.height);

        let mut index = Self::new();
        for record in records {
            let parent = if record.prev_hash == ZERO_HASH {
                if let Some(expected) = params.hash_genesis_block {
                    if record.hash != expected {
                        return Err(IndexError::GenesisMismatch);
                    }
                }
                None
            } else {
                Some(
                    index
                        .lookup(&record.prev_hash)
                        .ok_or(IndexError::CorruptIndex("index record missing parent"))?,
                )
            };
            if let Some(parent) = parent {
                if index.entry(parent).height + 1 != record.height {
                    return Err(IndexError::CorruptIndex("index record height mismatch"));
                }
            } else if record.height != 0 {
                return Err(IndexError::CorruptIndex("non-genesis record without parent"));
            }
            let skip = parent.and_then(|parent| index.ancestor(parent, skip_height(record.height)));
            let id = EntryId(index.entries.len() as u32);
            index.by_hash.insert(record.hash, id);
            index.entries.push(BlockIndexEntry {
                hash: record.hash,
                parent,
                skip,
                height: record.height,
                chain_work: record.chain_work,
                status: record.status,
                time: record.time,
                bits: record.bits,
                nonce: record.nonce,
                solution: record.solution,
                commitment_root: record.commitment_root,
                branch_id: record.branch_id,
                pool_deltas: record.pool_deltas,
            });
        }
        Ok(index)
    }
}

/// Height the skip reference of an entry at `height` points at. Any
/// deterministic function reaching zero in O(log n) steps works; this uses
/// the invert-lowest-one construction.
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

/// Expected work for a compact difficulty target: `2^256 / (target + 1)`,
/// rounded the way every chain-work comparison expects.
pub fn work_from_bits(bits: u32) -> U256 {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 || bits & 0x0080_0000 != 0 {
        return U256::zero();
    }
    let target = if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        let shift = 8 * (exponent - 3);
        if shift >= 256 {
            return U256::zero();
        }
        let shifted = U256::from(mantissa) << shift;
        // targets that overflow back to a smaller value are invalid
        if (shifted >> shift) != U256::from(mantissa) {
            return U256::zero();
        }
        shifted
    };
    if target.is_zero() {
        return U256::zero();
    }
    (!target / (target + U256::one())) + U256::one()
}

const RECORD_VERSION_V1: u8 = 1;
const RECORD_VERSION_V2: u8 = 2;

struct DiskEntry {
    hash: Hash256,
    prev_hash: Hash256,
    height: i32,
    time: u32,
    bits: u32,
    nonce: Hash256,
    solution: Vec<u8>,
    commitment_root: Hash256,
    chain_work: U256,
    status: u32,
    branch_id: Option<u32>,
    pool_deltas: Option<ValuePoolDeltas>,
}

fn encode_entry(entry: &BlockIndexEntry, prev_hash: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(180 + entry.solution.len());
    // era-gated fields select the record variant
    let version = match (entry.branch_id, entry.pool_deltas) {
        (Some(_), Some(_)) => RECORD_VERSION_V2,
        _ => RECORD_VERSION_V1,
    };
    encoder.write_u8(version);
    encoder.write_hash(prev_hash);
    encoder.write_i32_le(entry.height);
    encoder.write_u32_le(entry.time);
    encoder.write_u32_le(entry.bits);
    encoder.write_hash(&entry.nonce);
    encoder.write_var_bytes(&entry.solution);
    encoder.write_hash(&entry.commitment_root);
    encoder.write_hash(&entry.chain_work.to_big_endian());
    encoder.write_u32_le(entry.status);
    if version == RECORD_VERSION_V2 {
        encoder.write_u32_le(entry.branch_id.unwrap_or_default());
        encoder.write_i64_le(entry.pool_deltas.unwrap_or_default().shielded);
    }
    encoder.into_inner()
}

fn decode_entry(hash: &Hash256, bytes: &[u8]) -> Result<DiskEntry, IndexError> {
    let mut decoder = Decoder::new(bytes);
    let version = decoder.read_u8()?;
    if version != RECORD_VERSION_V1 && version != RECORD_VERSION_V2 {
        return Err(IndexError::CorruptIndex("unknown index record version"));
    }
    let prev_hash = decoder.read_hash()?;
    let height = decoder.read_i32_le()?;
    let time = decoder.read_u32_le()?;
    let bits = decoder.read_u32_le()?;
    let nonce = decoder.read_hash()?;
    let solution = decoder.read_var_bytes()?;
    let commitment_root = decoder.read_hash()?;
    let chain_work = U256::from_big_endian(&decoder.read_hash()?);
    let status = decoder.read_u32_le()?;
    let (branch_id, pool_deltas) = if version == RECORD_VERSION_V2 {
        let branch_id = decoder.read_u32_le()?;
        let shielded = decoder.read_i64_le()?;
        (Some(branch_id), Some(ValuePoolDeltas { shielded }))
    } else {
        (None, None)
    };
    if !decoder.is_empty() {
        return Err(IndexError::Decode(DecodeError::TrailingBytes));
    }
    Ok(DiskEntry {
        hash: *hash,
        prev_hash,
        height,
        time,
        bits,
        nonce,
        solution,
        commitment_root,
        chain_work,
        status,
        branch_id,
        pool_deltas,
    })
}
