use veild_chainstate::commitment::IncrementalTree;
use veild_consensus::params::{chain_params, Network};
use veild_consensus::{Hash256, ZERO_HASH};
use veild_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use veild_primitives::hash::sha256;
use veild_primitives::transaction::{OutputDescription, SpendDescription, Transaction};
use veild_storage::memory::MemoryStore;
use veild_storage::{Column, KeyValueStore};
use veild_wallet::notes::{derive_nullifier, DecryptedNote};
use veild_wallet::sync::{ChainSync, DecryptedOutput, SyncError, SyncState};
use veild_wallet::OutputId;

fn cm(branch: u8, height: u8, index: u8) -> Hash256 {
    sha256(&[branch, height, index])
}

fn make_tx(spends: Vec<Hash256>, outputs: Vec<Hash256>) -> Transaction {
    Transaction {
        version: 4,
        value_balance: 1_000 * spends.len() as i64 - 1_000 * outputs.len() as i64,
        shielded_spends: spends
            .into_iter()
            .map(|nullifier| SpendDescription { nullifier })
            .collect(),
        shielded_outputs: outputs
            .into_iter()
            .map(|commitment| OutputDescription { commitment })
            .collect(),
        expiry_height: 0,
    }
}

/// Builds a block on `prev_hash`, appending its outputs to the miner's view
/// of the commitment tree so the header carries the correct root.
fn make_block(
    prev_hash: Hash256,
    height: u32,
    tree: &mut IncrementalTree,
    transactions: Vec<Transaction>,
    salt: u8,
) -> Block {
    for tx in &transactions {
        for output in &tx.shielded_outputs {
            tree.append(output.commitment).expect("miner tree append");
        }
    }
    Block {
        header: BlockHeader {
            version: CURRENT_VERSION,
            prev_block: prev_hash,
            merkle_root: ZERO_HASH,
            commitment_root: tree.root(),
            time: 1_000 + height * 60,
            bits: 0x1f07_ffff,
            nonce: [salt; 32],
            solution: Vec::new(),
        },
        transactions,
    }
}

fn sample_note(seed: u8) -> DecryptedNote {
    DecryptedNote {
        value: 70_000,
        recipient: vec![seed; 43],
        memo: b"gift".to_vec(),
        nullifier_key: [seed; 32],
    }
}

/// Chain fixture: blocks plus per-height miner tree snapshots so tests can
/// fork from any height.
struct Fixture {
    sync: ChainSync,
    blocks: Vec<Block>,
    snapshots: Vec<IncrementalTree>,
}

impl Fixture {
    fn new() -> Self {
        let params = chain_params(Network::Regtest);
        let mut sync = ChainSync::new(params);
        let mut tree = IncrementalTree::new();
        let genesis = make_block(ZERO_HASH, 0, &mut tree, Vec::new(), 1);
        sync.connect_block(&genesis, &[]).expect("connect genesis");
        Self {
            sync,
            blocks: vec![genesis],
            snapshots: vec![tree],
        }
    }

    fn connect(&mut self, transactions: Vec<Transaction>, decrypted: &[DecryptedOutput]) {
        let height = self.blocks.len() as u32;
        let mut tree = self.snapshots.last().expect("snapshot").clone();
        let prev_hash = self.blocks.last().expect("block").header.hash();
        let block = make_block(prev_hash, height, &mut tree, transactions, 1);
        self.sync.connect_block(&block, decrypted).expect("connect");
        self.blocks.push(block);
        self.snapshots.push(tree);
    }

    fn connect_filler(&mut self) {
        let height = self.blocks.len() as u8;
        self.connect(
            vec![make_tx(vec![], vec![cm(1, height, 0), cm(1, height, 1)])],
            &[],
        );
    }

    fn disconnect_to(&mut self, height: usize) {
        while self.blocks.len() - 1 > height {
            let block = self.blocks.pop().expect("block");
            self.snapshots.pop();
            self.sync.disconnect_block(&block).expect("disconnect");
        }
    }

    fn tip_root(&self) -> Hash256 {
        self.blocks.last().expect("block").header.commitment_root
    }

    fn assert_in_step(&self) {
        assert_eq!(self.sync.state(), SyncState::Idle);
        assert_eq!(
            self.sync.accumulator().connected_height(),
            self.sync.chain().height()
        );
    }
}

/// Mints a note at the fixture's next height and returns its id, commitment
/// and decrypted plaintext.
fn mint_note(fixture: &mut Fixture, seed: u8) -> (OutputId, Hash256) {
    let height = fixture.blocks.len() as u8;
    let commitment = cm(9, height, seed);
    let tx = make_tx(vec![], vec![cm(1, height, 0), commitment]);
    let id = OutputId {
        txid: tx.txid(),
        index: 1,
    };
    let decrypted = vec![DecryptedOutput {
        txid: id.txid,
        index: id.index,
        note: sample_note(seed),
    }];
    fixture.connect(vec![tx], &decrypted);
    (id, commitment)
}

#[test]
fn note_minted_at_five_survives_a_five_block_reorg() {
    let mut fixture = Fixture::new();
    for _ in 1..=4 {
        fixture.connect_filler();
    }
    let (note_id, commitment) = mint_note(&mut fixture, 0x55);
    for _ in 6..=20 {
        fixture.connect_filler();
    }
    assert_eq!(fixture.sync.chain().height(), 20);
    fixture.assert_in_step();

    // two filler commitments per block before the mint, note is the second
    // output of its own block
    let expected_position = 2 * 4 + 1;
    let expected_nullifier = derive_nullifier(&[0x55; 32], &commitment, expected_position);
    let record = fixture.sync.wallet().get(&note_id).expect("note record");
    assert_eq!(record.position, Some(expected_position));
    assert_eq!(record.nullifier, Some(expected_nullifier));

    let summary = fixture.sync.note_summary(&note_id).expect("summary");
    assert_eq!(summary.anchor, fixture.tip_root());
    assert_eq!(summary.path.root(commitment), summary.anchor);

    // every retained snapshot matches the chain-recorded root at its height
    for (age, witness) in record.witnesses.iter().enumerate() {
        let snapshot_height = 20 - age;
        assert_eq!(
            witness.root(),
            fixture.blocks[snapshot_height].header.commitment_root,
            "witness snapshot at height {snapshot_height}"
        );
    }

    // reorg: drop heights 20 down to 16, then grow a different branch back
    let old_tip = fixture.blocks.last().expect("block").header.hash();
    fixture.disconnect_to(15);
    assert_eq!(fixture.sync.chain().height(), 15);
    fixture.assert_in_step();

    let mut fork_tree = fixture.snapshots[15].clone();
    let mut prev_hash = fixture.blocks[15].header.hash();
    for height in 16..=20u32 {
        let block = make_block(
            prev_hash,
            height,
            &mut fork_tree,
            vec![make_tx(vec![], vec![cm(2, height as u8, 0)])],
            2,
        );
        prev_hash = block.header.hash();
        fixture.sync.connect_block(&block, &[]).expect("connect fork");
        fixture.blocks.push(block);
        fixture.snapshots.push(fork_tree.clone());
    }
    assert_eq!(fixture.sync.chain().height(), 20);
    assert_ne!(fixture.blocks.last().expect("block").header.hash(), old_tip);
    fixture.assert_in_step();

    // the note kept its place in the tree and its witness follows the new tip
    let record = fixture.sync.wallet().get(&note_id).expect("note record");
    assert_eq!(record.position, Some(expected_position));
    assert_eq!(record.nullifier, Some(expected_nullifier));
    let summary = fixture.sync.note_summary(&note_id).expect("summary");
    assert_eq!(summary.anchor, fixture.tip_root());
    assert_eq!(summary.path.root(commitment), summary.anchor);
}

#[test]
fn disconnect_then_reconnect_is_a_net_no_op() {
    let mut fixture = Fixture::new();
    for _ in 1..=2 {
        fixture.connect_filler();
    }
    let (note_id, commitment) = mint_note(&mut fixture, 0x31);
    let nullifier = fixture
        .sync
        .wallet()
        .get(&note_id)
        .and_then(|record| record.nullifier)
        .expect("nullifier");
    for _ in 4..=8 {
        fixture.connect_filler();
    }
    // spend the note at height 9
    fixture.connect(vec![make_tx(vec![nullifier], vec![cm(1, 9, 0)])], &[]);
    fixture.connect_filler();

    let tip_hash = fixture.blocks.last().expect("block").header.hash();
    let accumulator_root = fixture.sync.accumulator().root();
    let anchor = fixture.sync.note_summary(&note_id).expect("summary").anchor;
    let witness_count = fixture
        .sync
        .wallet()
        .get(&note_id)
        .expect("record")
        .witnesses
        .len();
    assert!(fixture.sync.wallet().get(&note_id).expect("record").spent.is_some());
    assert!(fixture.sync.nullifiers().is_spent(&nullifier));

    // unwind through the spend and replay the identical blocks
    let replay: Vec<Block> = fixture.blocks[8..].to_vec();
    fixture.disconnect_to(7);
    assert!(fixture.sync.wallet().get(&note_id).expect("record").spent.is_none());
    assert!(!fixture.sync.nullifiers().is_spent(&nullifier));

    for block in &replay {
        fixture.sync.connect_block(block, &[]).expect("reconnect");
        fixture.blocks.push(block.clone());
    }
    fixture.assert_in_step();

    assert_eq!(fixture.blocks.last().expect("block").header.hash(), tip_hash);
    assert_eq!(fixture.sync.accumulator().root(), accumulator_root);
    let record = fixture.sync.wallet().get(&note_id).expect("record");
    assert!(record.spent.is_some());
    assert!(fixture.sync.nullifiers().is_spent(&nullifier));
    assert_eq!(record.witnesses.len(), witness_count);
    let summary = fixture.sync.note_summary(&note_id).expect("summary");
    assert_eq!(summary.anchor, anchor);
    assert_eq!(summary.path.root(commitment), anchor);
}

#[test]
fn root_mismatch_halts_the_coordinator() {
    let mut fixture = Fixture::new();
    fixture.connect_filler();

    // a block whose header claims a root the accumulator cannot reach
    let prev_hash = fixture.blocks.last().expect("block").header.hash();
    let mut bad = make_block(
        prev_hash,
        2,
        &mut fixture.snapshots.last().expect("snapshot").clone(),
        vec![make_tx(vec![], vec![cm(1, 2, 0)])],
        7,
    );
    bad.header.commitment_root = [0xde; 32];

    match fixture.sync.connect_block(&bad, &[]) {
        Err(SyncError::RootMismatch { height }) => assert_eq!(height, 2),
        other => panic!("expected root mismatch, got {other:?}"),
    }
    assert!(fixture.sync.is_corrupt());
    assert_eq!(fixture.sync.metrics().corruption_events, 1);

    // every further tip operation is refused
    let good_prev = fixture.blocks.last().expect("block").header.hash();
    let good = make_block(
        good_prev,
        2,
        &mut fixture.snapshots.last().expect("snapshot").clone(),
        vec![],
        8,
    );
    assert!(matches!(
        fixture.sync.connect_block(&good, &[]),
        Err(SyncError::Corrupted(_))
    ));
    let tip_block = fixture.blocks.last().expect("block").clone();
    assert!(matches!(
        fixture.sync.disconnect_block(&tip_block),
        Err(SyncError::Corrupted(_))
    ));
}

#[test]
fn save_load_roundtrip_and_crash_resume_rebuild() {
    let mut fixture = Fixture::new();
    fixture.connect_filler();
    let (note_id, commitment) = mint_note(&mut fixture, 0x42);
    for _ in 3..=5 {
        fixture.connect_filler();
    }

    let early_store = MemoryStore::new();
    fixture.sync.save(&early_store).expect("save");

    for _ in 6..=8 {
        fixture.connect_filler();
    }
    let store = MemoryStore::new();
    fixture.sync.save(&store).expect("save");

    // plain reload: everything matches without a rebuild
    let reloaded = ChainSync::load(&store, chain_params(Network::Regtest)).expect("load");
    assert_eq!(reloaded.chain().height(), 8);
    assert_eq!(reloaded.accumulator().root(), fixture.sync.accumulator().root());
    let summary = reloaded.note_summary(&note_id).expect("summary");
    assert_eq!(summary.anchor, fixture.tip_root());
    assert_eq!(reloaded.metrics().rebuilds, 0);

    // crash resume: the note record on disk lags the accumulator by three
    // blocks, as if the process died between the two batch writes
    let key = note_id.key_bytes();
    let stale = early_store
        .get(Column::WalletNote, &key)
        .expect("get")
        .expect("stale record");
    store.put(Column::WalletNote, &key, &stale).expect("put");

    let recovered = ChainSync::load(&store, chain_params(Network::Regtest)).expect("load");
    assert_eq!(recovered.metrics().rebuilds, 1);
    let summary = recovered.note_summary(&note_id).expect("summary");
    assert_eq!(summary.anchor, fixture.tip_root());
    assert_eq!(summary.path.root(commitment), summary.anchor);
}

#[test]
fn peer_sync_surface_answers_from_the_projection() {
    let mut fixture = Fixture::new();
    for _ in 1..=6 {
        fixture.connect_filler();
    }

    // a competing branch known only by its headers
    let fork_parent = fixture.blocks[4].header.hash();
    let mut side_tree = fixture.snapshots[4].clone();
    let side = make_block(fork_parent, 5, &mut side_tree, Vec::new(), 9);
    fixture.sync.add_header(&side.header).expect("add header");

    let side_hash = side.header.hash();
    assert!(!fixture.sync.contains(&side_hash));
    assert!(fixture.sync.contains(&fixture.blocks[3].header.hash()));
    assert_eq!(fixture.sync.find_fork(&side_hash), Some(fork_parent));
    assert_eq!(
        fixture.sync.ancestor(&side_hash, 4),
        Some(fork_parent)
    );

    let locator = fixture.sync.locator();
    assert_eq!(locator.first(), Some(&fixture.blocks[6].header.hash()));
    assert_eq!(locator.last(), Some(&fixture.blocks[0].header.hash()));
}

#[test]
fn worker_pool_extends_every_note_batch() {
    let mut fixture = Fixture::new();

    // enough notes to span several worker batches
    let height = fixture.blocks.len() as u8;
    let outputs: Vec<Hash256> = (0..150u8).map(|index| cm(9, height, index)).collect();
    let tx = make_tx(vec![], outputs.clone());
    let txid = tx.txid();
    let decrypted: Vec<DecryptedOutput> = (0..150u32)
        .map(|index| DecryptedOutput {
            txid,
            index,
            note: sample_note(index as u8),
        })
        .collect();
    fixture.connect(vec![tx], &decrypted);
    fixture.connect_filler();
    fixture.connect_filler();

    assert_eq!(fixture.sync.wallet().len(), 150);
    let tip_root = fixture.tip_root();
    for (index, commitment) in outputs.iter().enumerate() {
        let id = OutputId {
            txid,
            index: index as u32,
        };
        let summary = fixture.sync.note_summary(&id).expect("summary");
        assert_eq!(summary.anchor, tip_root, "note {index}");
        assert_eq!(summary.path.root(*commitment), tip_root, "note {index}");
    }
}
