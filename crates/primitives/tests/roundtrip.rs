use veild_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use veild_primitives::transaction::{OutputDescription, SpendDescription, Transaction};

fn make_tx(spends: Vec<[u8; 32]>, outputs: Vec<[u8; 32]>) -> Transaction {
    Transaction {
        version: 4,
        value_balance: -5_000,
        shielded_spends: spends
            .into_iter()
            .map(|nullifier| SpendDescription { nullifier })
            .collect(),
        shielded_outputs: outputs
            .into_iter()
            .map(|commitment| OutputDescription { commitment })
            .collect(),
        expiry_height: 120,
    }
}

#[test]
fn transaction_roundtrip() {
    let tx = make_tx(vec![[0x11; 32], [0x22; 32]], vec![[0x33; 32]]);
    let bytes = tx.encode();
    let decoded = Transaction::decode(&bytes).expect("decode");
    assert_eq!(decoded, tx);
    assert_eq!(decoded.txid(), tx.txid());
}

#[test]
fn transaction_decode_rejects_trailing_bytes() {
    let tx = make_tx(vec![], vec![[0x44; 32]]);
    let mut bytes = tx.encode();
    bytes.push(0);
    assert!(Transaction::decode(&bytes).is_err());
}

#[test]
fn header_hash_commits_to_every_field() {
    let header = BlockHeader {
        version: CURRENT_VERSION,
        prev_block: [0x01; 32],
        merkle_root: [0x02; 32],
        commitment_root: [0x03; 32],
        time: 1_700_000_000,
        bits: 0x1f07_ffff,
        nonce: [0x04; 32],
        solution: vec![0xaa, 0xbb],
    };
    let base_hash = header.hash();

    let mut tweaked = header.clone();
    tweaked.commitment_root = [0x05; 32];
    assert_ne!(tweaked.hash(), base_hash);

    let mut tweaked = header.clone();
    tweaked.solution = vec![0xaa];
    assert_ne!(tweaked.hash(), base_hash);

    let bytes = header.consensus_encode();
    let decoded = BlockHeader::consensus_decode(&bytes).expect("decode");
    assert_eq!(decoded, header);
    assert_eq!(decoded.hash(), base_hash);
}

#[test]
fn block_roundtrip() {
    let header = BlockHeader {
        version: CURRENT_VERSION,
        prev_block: [0u8; 32],
        merkle_root: [0u8; 32],
        commitment_root: [0x07; 32],
        time: 1_700_000_100,
        bits: 0x1f07_ffff,
        nonce: [0x09; 32],
        solution: Vec::new(),
    };
    let block = Block {
        header,
        transactions: vec![
            make_tx(vec![], vec![[0x10; 32], [0x11; 32]]),
            make_tx(vec![[0x12; 32]], vec![]),
        ],
    };
    let bytes = block.consensus_encode();
    let decoded = Block::consensus_decode(&bytes).expect("decode");
    assert_eq!(decoded, block);
}
