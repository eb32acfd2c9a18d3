//! Append-only note-commitment accumulator.
//!
//! The tree is a fixed-depth binary Merkle tree stored as an incremental
//! frontier: the filled left/right pair at the leaf layer plus one optional
//! left sibling per interior level. Appending is constant amortized work and
//! the root never needs a full recomputation. A witness is the same frontier
//! frozen at a leaf position, fed every later commitment to keep its
//! authentication path current.

use std::collections::{BTreeMap, VecDeque};
use std::sync::OnceLock;

use veild_consensus::Hash256;
use veild_primitives::encoding::{DecodeError, Decoder, Encoder};
use veild_primitives::hash::sha256d;

/// Depth of the commitment tree; positions are dense in `[0, 2^32)`.
pub const TREE_DEPTH: usize = 32;

#[derive(Debug, Eq, PartialEq)]
pub enum TreeError {
    TreeFull,
    EmptyTree,
    UnknownCheckpoint(i32),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::TreeFull => write!(f, "commitment tree is full"),
            TreeError::EmptyTree => write!(f, "commitment tree is empty"),
            TreeError::UnknownCheckpoint(height) => {
                write!(f, "no accumulator checkpoint at height {height}")
            }
        }
    }
}

impl std::error::Error for TreeError {}

fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(left);
    buf[32..64].copy_from_slice(right);
    sha256d(&buf)
}

/// Root of an all-empty subtree at `level` (level 0 is a leaf).
pub fn empty_root(level: usize) -> Hash256 {
    static ROOTS: OnceLock<[Hash256; TREE_DEPTH + 1]> = OnceLock::new();
    ROOTS.get_or_init(|| {
        let mut roots = [[0u8; 32]; TREE_DEPTH + 1];
        for level in 1..=TREE_DEPTH {
            roots[level] = node_hash(&roots[level - 1], &roots[level - 1]);
        }
        roots
    })[level]
}

/// Supplies right-hand siblings when hashing up a partially filled frontier:
/// known subtree roots first, empty-subtree roots beyond them.
struct PathFiller {
    queue: VecDeque<Hash256>,
}

impl PathFiller {
    fn empty() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    fn new(queue: VecDeque<Hash256>) -> Self {
        Self { queue }
    }

    fn next(&mut self, level: usize) -> Hash256 {
        self.queue.pop_front().unwrap_or_else(|| empty_root(level))
    }
}

/// Incremental Merkle frontier.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IncrementalTree {
    left: Option<Hash256>,
    right: Option<Hash256>,
    parents: Vec<Option<Hash256>>,
}

impl IncrementalTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_none() && self.right.is_none() && self.parents.is_empty()
    }

    /// Number of leaves appended so far.
    pub fn size(&self) -> u64 {
        let mut size = u64::from(self.left.is_some()) + u64::from(self.right.is_some());
        for (level, parent) in self.parents.iter().enumerate() {
            if parent.is_some() {
                size += 1 << (level + 1);
            }
        }
        size
    }

    pub fn append(&mut self, leaf: Hash256) -> Result<(), TreeError> {
        if self.left.is_none() {
            self.left = Some(leaf);
            return Ok(());
        }
        if self.right.is_none() {
            self.right = Some(leaf);
            return Ok(());
        }

        // leaf layer is full: carry the combined pair upward
        let mut carry = node_hash(
            &self.left.expect("checked above"),
            &self.right.expect("checked above"),
        );
        self.left = Some(leaf);
        self.right = None;
        for parent in self.parents.iter_mut() {
            match parent {
                Some(sibling) => {
                    carry = node_hash(sibling, &carry);
                    *parent = None;
                }
                None => {
                    *parent = Some(carry);
                    return Ok(());
                }
            }
        }
        if self.parents.len() < TREE_DEPTH - 1 {
            self.parents.push(Some(carry));
            Ok(())
        } else {
            Err(TreeError::TreeFull)
        }
    }

    pub fn root(&self) -> Hash256 {
        self.root_at_depth(TREE_DEPTH, &mut PathFiller::empty())
    }

    fn root_at_depth(&self, depth: usize, filler: &mut PathFiller) -> Hash256 {
        let left = self.left.unwrap_or_else(|| filler.next(0));
        let right = self.right.unwrap_or_else(|| filler.next(0));
        let mut root = node_hash(&left, &right);
        for level in 1..depth {
            root = match self.parents.get(level - 1) {
                Some(Some(parent)) => node_hash(parent, &root),
                _ => node_hash(&root, &filler.next(level)),
            };
        }
        root
    }

    /// A subtree of `depth` levels is complete when every slot is filled.
    fn is_complete(&self, depth: usize) -> bool {
        if self.left.is_none() || self.right.is_none() {
            return false;
        }
        if self.parents.len() != depth.saturating_sub(1) {
            return false;
        }
        self.parents.iter().all(|parent| parent.is_some())
    }

    /// Depth of the next uncle subtree a witness has to assemble, after
    /// skipping `skip` already-filled ones.
    fn next_depth(&self, mut skip: usize) -> usize {
        if self.left.is_none() {
            if skip > 0 {
                skip -= 1;
            } else {
                return 0;
            }
        }
        if self.right.is_none() {
            if skip > 0 {
                skip -= 1;
            } else {
                return 0;
            }
        }
        let mut depth = 1;
        for parent in &self.parents {
            if parent.is_none() {
                if skip > 0 {
                    skip -= 1;
                } else {
                    return depth;
                }
            }
            depth += 1;
        }
        depth + skip
    }

    pub fn encode_to(&self, encoder: &mut Encoder) {
        write_optional_hash(encoder, &self.left);
        write_optional_hash(encoder, &self.right);
        encoder.write_var_int(self.parents.len() as u64);
        for parent in &self.parents {
            write_optional_hash(encoder, parent);
        }
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let left = read_optional_hash(decoder)?;
        let right = read_optional_hash(decoder)?;
        let parent_count = decoder.read_var_int()?;
        if parent_count >= TREE_DEPTH as u64 {
            return Err(DecodeError::InvalidValue("frontier deeper than the tree"));
        }
        let mut parents = Vec::with_capacity(parent_count as usize);
        for _ in 0..parent_count {
            parents.push(read_optional_hash(decoder)?);
        }
        Ok(Self {
            left,
            right,
            parents,
        })
    }
}

fn write_optional_hash(encoder: &mut Encoder, hash: &Option<Hash256>) {
    match hash {
        Some(hash) => {
            encoder.write_u8(1);
            encoder.write_hash(hash);
        }
        None => encoder.write_u8(0),
    }
}

fn read_optional_hash(decoder: &mut Decoder<'_>) -> Result<Option<Hash256>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(decoder.read_hash()?)),
        _ => Err(DecodeError::InvalidValue("invalid option tag")),
    }
}

/// Authentication path from a leaf to the root: one sibling per level plus
/// the leaf position, whose bits select the hashing order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthPath {
    pub siblings: Vec<Hash256>,
    pub position: u64,
}

impl AuthPath {
    /// Root obtained by hashing `leaf` up the path.
    pub fn root(&self, leaf: Hash256) -> Hash256 {
        let mut node = leaf;
        let mut index = self.position;
        for sibling in &self.siblings {
            node = if index & 1 == 1 {
                node_hash(sibling, &node)
            } else {
                node_hash(&node, sibling)
            };
            index >>= 1;
        }
        node
    }
}

/// Witness to a single leaf: the frontier frozen just after that leaf was
/// appended, plus the uncle subtrees assembled from later appends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IncrementalWitness {
    tree: IncrementalTree,
    filled: Vec<Hash256>,
    cursor_depth: usize,
    cursor: Option<IncrementalTree>,
}

impl IncrementalWitness {
    /// Witness for the most recently appended leaf of `tree`.
    pub fn from_tree(tree: IncrementalTree) -> Result<Self, TreeError> {
        if tree.is_empty() {
            return Err(TreeError::EmptyTree);
        }
        Ok(Self {
            tree,
            filled: Vec::new(),
            cursor_depth: 0,
            cursor: None,
        })
    }

    pub fn position(&self) -> u64 {
        self.tree.size() - 1
    }

    /// Leaf commitment this witness authenticates.
    pub fn leaf(&self) -> Hash256 {
        self.tree
            .right
            .or(self.tree.left)
            .expect("witness trees are never empty")
    }

    pub fn append(&mut self, leaf: Hash256) -> Result<(), TreeError> {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.append(leaf)?;
            if cursor.is_complete(self.cursor_depth) {
                let root = cursor.root_at_depth(self.cursor_depth, &mut PathFiller::empty());
                self.filled.push(root);
                self.cursor = None;
            }
            return Ok(());
        }

        self.cursor_depth = self.tree.next_depth(self.filled.len());
        if self.cursor_depth >= TREE_DEPTH {
            return Err(TreeError::TreeFull);
        }
        if self.cursor_depth == 0 {
            self.filled.push(leaf);
        } else {
            let mut cursor = IncrementalTree::new();
            cursor.append(leaf)?;
            self.cursor = Some(cursor);
        }
        Ok(())
    }

    fn filler(&self) -> PathFiller {
        let mut uncles: VecDeque<Hash256> = self.filled.iter().copied().collect();
        if let Some(cursor) = &self.cursor {
            uncles.push_back(cursor.root_at_depth(self.cursor_depth, &mut PathFiller::empty()));
        }
        PathFiller::new(uncles)
    }

    /// Root of the whole tree as this witness currently sees it.
    pub fn root(&self) -> Hash256 {
        self.tree.root_at_depth(TREE_DEPTH, &mut self.filler())
    }

    pub fn path(&self) -> AuthPath {
        let mut filler = self.filler();
        let mut siblings = Vec::with_capacity(TREE_DEPTH);
        if self.tree.right.is_some() {
            // witnessed leaf sits in the right slot; its sibling is the left
            siblings.push(self.tree.left.expect("left fills before right"));
        } else {
            siblings.push(filler.next(0));
        }
        for level in 1..TREE_DEPTH {
            siblings.push(match self.tree.parents.get(level - 1) {
                Some(Some(parent)) => *parent,
                _ => filler.next(level),
            });
        }
        AuthPath {
            siblings,
            position: self.position(),
        }
    }

    pub fn encode_to(&self, encoder: &mut Encoder) {
        self.tree.encode_to(encoder);
        encoder.write_var_int(self.filled.len() as u64);
        for hash in &self.filled {
            encoder.write_hash(hash);
        }
        encoder.write_var_int(self.cursor_depth as u64);
        match &self.cursor {
            Some(cursor) => {
                encoder.write_u8(1);
                cursor.encode_to(encoder);
            }
            None => encoder.write_u8(0),
        }
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let tree = IncrementalTree::decode_from(decoder)?;
        let filled_count = decoder.read_var_int()?;
        if filled_count > TREE_DEPTH as u64 {
            return Err(DecodeError::InvalidValue("too many filled subtrees"));
        }
        let mut filled = Vec::with_capacity(filled_count as usize);
        for _ in 0..filled_count {
            filled.push(decoder.read_hash()?);
        }
        let cursor_depth = decoder.read_var_int()? as usize;
        let cursor = match decoder.read_u8()? {
            0 => None,
            1 => Some(IncrementalTree::decode_from(decoder)?),
            _ => return Err(DecodeError::InvalidValue("invalid option tag")),
        };
        Ok(Self {
            tree,
            filled,
            cursor_depth,
            cursor,
        })
    }
}

/// Accumulator snapshot pinned to a block height.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeCheckpoint {
    tree: IncrementalTree,
    root: Hash256,
    size: u64,
}

impl TreeCheckpoint {
    pub fn root(&self) -> Hash256 {
        self.root
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// The chain-facing accumulator: the live frontier, every appended leaf, and
/// one checkpoint per connected block for exact rewind and replay.
#[derive(Clone, Debug)]
pub struct CommitmentAccumulator {
    tree: IncrementalTree,
    leaves: Vec<Hash256>,
    checkpoints: BTreeMap<i32, TreeCheckpoint>,
    connected_height: i32,
}

impl CommitmentAccumulator {
    pub fn new() -> Self {
        Self {
            tree: IncrementalTree::new(),
            leaves: Vec::new(),
            checkpoints: BTreeMap::new(),
            connected_height: -1,
        }
    }

    pub fn root(&self) -> Hash256 {
        self.tree.root()
    }

    pub fn size(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn frontier(&self) -> &IncrementalTree {
        &self.tree
    }

    /// Height of the last block whose commitments are fully applied; -1
    /// before any block connects.
    pub fn connected_height(&self) -> i32 {
        self.connected_height
    }

    /// Appends a commitment and returns its position.
    pub fn append(&mut self, commitment: Hash256) -> Result<u64, TreeError> {
        self.tree.append(commitment)?;
        self.leaves.push(commitment);
        Ok(self.leaves.len() as u64 - 1)
    }

    /// Records the per-block snapshot; called exactly once per connected
    /// block, immediately after its commitments are appended.
    pub fn checkpoint(&mut self, height: i32) {
        self.checkpoints.insert(
            height,
            TreeCheckpoint {
                tree: self.tree.clone(),
                root: self.tree.root(),
                size: self.leaves.len() as u64,
            },
        );
        self.connected_height = height;
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&TreeCheckpoint> {
        self.checkpoints.get(&height)
    }

    /// Restores the exact snapshot at `height`, discarding every leaf and
    /// checkpoint above it. Returns the restored root for the caller's
    /// cross-check against the chain's recorded root.
    pub fn rewind(&mut self, height: i32) -> Result<Hash256, TreeError> {
        let checkpoint = self
            .checkpoints
            .get(&height)
            .ok_or(TreeError::UnknownCheckpoint(height))?
            .clone();
        self.tree = checkpoint.tree.clone();
        self.leaves.truncate(checkpoint.size as usize);
        self.checkpoints.split_off(&(height + 1));
        self.connected_height = height;
        Ok(checkpoint.root)
    }

    /// Drops checkpoints below `keep_from`; they are beyond the supported
    /// reorg depth.
    pub fn prune_checkpoints(&mut self, keep_from: i32) {
        self.checkpoints.retain(|height, _| *height >= keep_from);
    }

    /// Leaves appended at or after `position`, for witness replay.
    pub fn leaves_from(&self, position: u64) -> &[Hash256] {
        let start = (position as usize).min(self.leaves.len());
        &self.leaves[start..]
    }

    /// Latest checkpointed frontier covering no more than `position` leaves;
    /// the replay base for a witness rebuild. `None` means cold-start from
    /// the empty tree.
    pub fn replay_base(&self, position: u64) -> Option<&TreeCheckpoint> {
        self.checkpoints
            .values()
            .rev()
            .find(|checkpoint| checkpoint.size <= position)
    }

    pub fn replay_frontier(&self, base: Option<&TreeCheckpoint>) -> (IncrementalTree, u64) {
        match base {
            Some(checkpoint) => (checkpoint.tree.clone(), checkpoint.size),
            None => (IncrementalTree::new(), 0),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(64 + self.leaves.len() * 32);
        self.tree.encode_to(&mut encoder);
        encoder.write_i32_le(self.connected_height);
        encoder.write_var_int(self.leaves.len() as u64);
        for leaf in &self.leaves {
            encoder.write_hash(leaf);
        }
        encoder.write_var_int(self.checkpoints.len() as u64);
        for (height, checkpoint) in &self.checkpoints {
            encoder.write_i32_le(*height);
            checkpoint.tree.encode_to(&mut encoder);
            encoder.write_hash(&checkpoint.root);
            encoder.write_u64_le(checkpoint.size);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tree = IncrementalTree::decode_from(&mut decoder)?;
        let connected_height = decoder.read_i32_le()?;
        let leaf_count = decoder.read_var_int()?;
        let mut leaves = Vec::with_capacity(leaf_count.min(1 << 20) as usize);
        for _ in 0..leaf_count {
            leaves.push(decoder.read_hash()?);
        }
        let checkpoint_count = decoder.read_var_int()?;
        let mut checkpoints = BTreeMap::new();
        for _ in 0..checkpoint_count {
            let height = decoder.read_i32_le()?;
            let checkpoint_tree = IncrementalTree::decode_from(&mut decoder)?;
            let root = decoder.read_hash()?;
            let size = decoder.read_u64_le()?;
            checkpoints.insert(
                height,
                TreeCheckpoint {
                    tree: checkpoint_tree,
                    root,
                    size,
                },
            );
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            tree,
            leaves,
            checkpoints,
            connected_height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(seed: u8) -> Hash256 {
        [seed; 32]
    }

    /// Reference root: build the full leaf layer and hash every level.
    fn naive_root(leaves: &[Hash256]) -> Hash256 {
        let mut layer: Vec<Hash256> = leaves.to_vec();
        for level in 0..TREE_DEPTH {
            if layer.len() % 2 == 1 {
                layer.push(empty_root(level));
            }
            layer = layer
                .chunks(2)
                .map(|pair| node_hash(&pair[0], &pair[1]))
                .collect();
            if layer.is_empty() {
                layer.push(empty_root(level + 1));
            }
        }
        layer[0]
    }

    #[test]
    fn incremental_root_matches_naive_root() {
        let mut tree = IncrementalTree::new();
        let mut leaves = Vec::new();
        assert_eq!(tree.root(), naive_root(&leaves));
        for seed in 1..=9u8 {
            tree.append(leaf(seed)).expect("append");
            leaves.push(leaf(seed));
            assert_eq!(tree.root(), naive_root(&leaves), "after {seed} leaves");
            assert_eq!(tree.size(), leaves.len() as u64);
        }
    }

    #[test]
    fn witness_root_tracks_tree_root() {
        let mut tree = IncrementalTree::new();
        // witness the third of eleven leaves
        for seed in 1..=3u8 {
            tree.append(leaf(seed)).expect("append");
        }
        let mut witness = IncrementalWitness::from_tree(tree.clone()).expect("witness");
        assert_eq!(witness.position(), 2);
        assert_eq!(witness.leaf(), leaf(3));

        for seed in 4..=11u8 {
            tree.append(leaf(seed)).expect("append");
            witness.append(leaf(seed)).expect("witness append");
            assert_eq!(witness.root(), tree.root(), "after {seed} leaves");
        }
    }

    #[test]
    fn auth_path_recomputes_the_root() {
        let mut tree = IncrementalTree::new();
        for seed in 1..=5u8 {
            tree.append(leaf(seed)).expect("append");
        }
        let mut witness = IncrementalWitness::from_tree(tree.clone()).expect("witness");
        for seed in 6..=13u8 {
            tree.append(leaf(seed)).expect("append");
            witness.append(leaf(seed)).expect("witness append");
        }
        let path = witness.path();
        assert_eq!(path.position, 4);
        assert_eq!(path.siblings.len(), TREE_DEPTH);
        assert_eq!(path.root(witness.leaf()), witness.root());
        assert_eq!(path.root(witness.leaf()), tree.root());
    }

    #[test]
    fn witness_of_latest_leaf_has_no_uncles_yet() {
        let mut tree = IncrementalTree::new();
        tree.append(leaf(1)).expect("append");
        let witness = IncrementalWitness::from_tree(tree.clone()).expect("witness");
        assert_eq!(witness.root(), tree.root());
        assert_eq!(witness.path().root(leaf(1)), tree.root());
    }

    #[test]
    fn checkpoint_rewind_roundtrip() {
        let mut accumulator = CommitmentAccumulator::new();
        for seed in 1..=4u8 {
            accumulator.append(leaf(seed)).expect("append");
        }
        accumulator.checkpoint(0);
        let snapshot_root = accumulator.root();
        let snapshot_size = accumulator.size();

        for seed in 5..=9u8 {
            accumulator.append(leaf(seed)).expect("append");
        }
        accumulator.checkpoint(1);
        assert_ne!(accumulator.root(), snapshot_root);

        let restored_root = accumulator.rewind(0).expect("rewind");
        assert_eq!(restored_root, snapshot_root);
        assert_eq!(accumulator.root(), snapshot_root);
        assert_eq!(accumulator.size(), snapshot_size);
        assert_eq!(accumulator.connected_height(), 0);
        assert!(accumulator.checkpoint_at(1).is_none());

        // appends after the rewind behave as if the discarded leaves never
        // existed
        accumulator.append(leaf(40)).expect("append");
        let mut reference = IncrementalTree::new();
        for seed in [1, 2, 3, 4, 40] {
            reference.append(leaf(seed)).expect("append");
        }
        assert_eq!(accumulator.root(), reference.root());
    }

    #[test]
    fn rewind_to_pruned_checkpoint_fails() {
        let mut accumulator = CommitmentAccumulator::new();
        accumulator.append(leaf(1)).expect("append");
        accumulator.checkpoint(0);
        accumulator.append(leaf(2)).expect("append");
        accumulator.checkpoint(1);
        accumulator.prune_checkpoints(1);
        assert_eq!(
            accumulator.rewind(0),
            Err(TreeError::UnknownCheckpoint(0))
        );
    }

    #[test]
    fn replay_base_picks_the_latest_usable_checkpoint() {
        let mut accumulator = CommitmentAccumulator::new();
        accumulator.append(leaf(1)).expect("append");
        accumulator.append(leaf(2)).expect("append");
        accumulator.checkpoint(0);
        accumulator.append(leaf(3)).expect("append");
        accumulator.checkpoint(1);

        // replay for position 2 may start at the height-0 checkpoint
        let base = accumulator.replay_base(2).expect("base");
        assert_eq!(base.size(), 2);
        // replay for position 1 has to cold-start
        assert!(accumulator.replay_base(1).is_none());
        assert_eq!(accumulator.leaves_from(2), &[leaf(3)]);
    }

    #[test]
    fn accumulator_roundtrips_through_bytes() {
        let mut accumulator = CommitmentAccumulator::new();
        for seed in 1..=6u8 {
            accumulator.append(leaf(seed)).expect("append");
            accumulator.checkpoint(seed as i32 - 1);
        }
        let bytes = accumulator.encode();
        let decoded = CommitmentAccumulator::decode(&bytes).expect("decode");
        assert_eq!(decoded.root(), accumulator.root());
        assert_eq!(decoded.size(), accumulator.size());
        assert_eq!(decoded.connected_height(), accumulator.connected_height());
        assert_eq!(
            decoded.checkpoint_at(3).map(TreeCheckpoint::root),
            accumulator.checkpoint_at(3).map(TreeCheckpoint::root)
        );
    }

    #[test]
    fn witness_roundtrips_through_bytes() {
        let mut tree = IncrementalTree::new();
        for seed in 1..=3u8 {
            tree.append(leaf(seed)).expect("append");
        }
        let mut witness = IncrementalWitness::from_tree(tree).expect("witness");
        for seed in 4..=8u8 {
            witness.append(leaf(seed)).expect("append");
        }
        let mut encoder = Encoder::new();
        witness.encode_to(&mut encoder);
        let bytes = encoder.into_inner();
        let decoded =
            IncrementalWitness::decode_from(&mut Decoder::new(&bytes)).expect("decode");
        assert_eq!(decoded, witness);
        assert_eq!(decoded.root(), witness.root());
    }
}
