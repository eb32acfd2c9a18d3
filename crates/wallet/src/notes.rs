//! Note records and the nullifier index.

use std::collections::{HashMap, VecDeque};

use veild_chainstate::commitment::IncrementalWitness;
use veild_consensus::Hash256;
use veild_primitives::encoding::{DecodeError, Decoder, Encoder};
use veild_primitives::hash::sha256d;

/// Identifies one shielded output: the transaction plus its output slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutputId {
    pub txid: Hash256,
    pub index: u32,
}

impl OutputId {
    pub fn key_bytes(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[0..32].copy_from_slice(&self.txid);
        key[32..36].copy_from_slice(&self.index.to_le_bytes());
        key
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[0..32]);
        let index = u32::from_le_bytes(bytes[32..36].try_into().ok()?);
        Some(Self { txid, index })
    }
}

/// Plaintext of a note the owner managed to decrypt. The deriving key is
/// handed over by the decryption layer so the nullifier can be computed once
/// the commitment's position is known.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecryptedNote {
    pub value: i64,
    pub recipient: Vec<u8>,
    pub memo: Vec<u8>,
    pub nullifier_key: Hash256,
}

/// Position-dependent nullifier; the same note mined at a different position
/// yields a different nullifier.
pub fn derive_nullifier(nullifier_key: &Hash256, commitment: &Hash256, position: u64) -> Hash256 {
    let mut buf = [0u8; 72];
    buf[0..32].copy_from_slice(nullifier_key);
    buf[32..64].copy_from_slice(commitment);
    buf[64..72].copy_from_slice(&position.to_le_bytes());
    sha256d(&buf)
}

/// A confirmed spend of one of the wallet's notes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConfirmedSpend {
    pub txid: Hash256,
    pub height: i32,
}

#[derive(Clone, Debug)]
pub struct NoteRecord {
    pub id: OutputId,
    pub commitment: Hash256,
    pub note: DecryptedNote,
    pub confirmed_height: Option<i32>,
    pub position: Option<u64>,
    pub nullifier: Option<Hash256>,
    /// One witness per recently connected block, newest first.
    pub witnesses: VecDeque<IncrementalWitness>,
    /// Height the front witness was last advanced to; -1 while unmined.
    pub witness_height: i32,
    pub spent: Option<ConfirmedSpend>,
}

impl NoteRecord {
    /// A decrypted note not (or no longer) mined into the active chain.
    pub fn unmined(id: OutputId, commitment: Hash256, note: DecryptedNote) -> Self {
        Self {
            id,
            commitment,
            note,
            confirmed_height: None,
            position: None,
            nullifier: None,
            witnesses: VecDeque::new(),
            witness_height: -1,
            spent: None,
        }
    }

    pub fn front_witness(&self) -> Option<&IncrementalWitness> {
        self.witnesses.front()
    }

    /// Drops all chain placement, returning the record to its unmined shape
    /// after the confirming block was disconnected.
    pub fn demote(&mut self) {
        self.confirmed_height = None;
        self.position = None;
        self.nullifier = None;
        self.witnesses.clear();
        self.witness_height = -1;
        self.spent = None;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.id.key_bytes());
        encoder.write_hash(&self.commitment);
        encoder.write_i64_le(self.note.value);
        encoder.write_var_bytes(&self.note.recipient);
        encoder.write_var_bytes(&self.note.memo);
        encoder.write_hash(&self.note.nullifier_key);
        write_optional_i32(&mut encoder, self.confirmed_height);
        match self.position {
            Some(position) => {
                encoder.write_u8(1);
                encoder.write_u64_le(position);
            }
            None => encoder.write_u8(0),
        }
        match &self.nullifier {
            Some(nullifier) => {
                encoder.write_u8(1);
                encoder.write_hash(nullifier);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_var_int(self.witnesses.len() as u64);
        for witness in &self.witnesses {
            witness.encode_to(&mut encoder);
        }
        encoder.write_i32_le(self.witness_height);
        match &self.spent {
            Some(spend) => {
                encoder.write_u8(1);
                encoder.write_hash(&spend.txid);
                encoder.write_i32_le(spend.height);
            }
            None => encoder.write_u8(0),
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let id = OutputId::from_key_bytes(decoder.read_bytes(36)?)
            .ok_or(DecodeError::InvalidValue("invalid output id"))?;
        let commitment = decoder.read_hash()?;
        let value = decoder.read_i64_le()?;
        let recipient = decoder.read_var_bytes()?;
        let memo = decoder.read_var_bytes()?;
        let nullifier_key = decoder.read_hash()?;
        let confirmed_height = read_optional_i32(&mut decoder)?;
        let position = match decoder.read_u8()? {
            0 => None,
            1 => Some(decoder.read_u64_le()?),
            _ => return Err(DecodeError::InvalidValue("invalid option tag")),
        };
        let nullifier = match decoder.read_u8()? {
            0 => None,
            1 => Some(decoder.read_hash()?),
            _ => return Err(DecodeError::InvalidValue("invalid option tag")),
        };
        let witness_count = decoder.read_var_int()?;
        let mut witnesses = VecDeque::with_capacity(witness_count.min(256) as usize);
        for _ in 0..witness_count {
            witnesses.push_back(IncrementalWitness::decode_from(&mut decoder)?);
        }
        let witness_height = decoder.read_i32_le()?;
        let spent = match decoder.read_u8()? {
            0 => None,
            1 => Some(ConfirmedSpend {
                txid: decoder.read_hash()?,
                height: decoder.read_i32_le()?,
            }),
            _ => return Err(DecodeError::InvalidValue("invalid option tag")),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            id,
            commitment,
            note: DecryptedNote {
                value,
                recipient,
                memo,
                nullifier_key,
            },
            confirmed_height,
            position,
            nullifier,
            witnesses,
            witness_height,
            spent,
        })
    }
}

fn write_optional_i32(encoder: &mut Encoder, value: Option<i32>) {
    match value {
        Some(value) => {
            encoder.write_u8(1);
            encoder.write_i32_le(value);
        }
        None => encoder.write_u8(0),
    }
}

fn read_optional_i32(decoder: &mut Decoder<'_>) -> Result<Option<i32>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(decoder.read_i32_le()?)),
        _ => Err(DecodeError::InvalidValue("invalid option tag")),
    }
}

/// Nullifier to spending-transaction multimap. One entry means a confirmed
/// spend; more than one means conflicting transactions claim the same note.
#[derive(Clone, Debug, Default)]
pub struct NullifierIndex {
    map: HashMap<Hash256, Vec<Hash256>>,
}

impl NullifierIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nullifier: Hash256, txid: Hash256) {
        let spenders = self.map.entry(nullifier).or_default();
        if !spenders.contains(&txid) {
            spenders.push(txid);
        }
    }

    /// Removes every entry claimed by `txid`; used when the spending
    /// transaction is orphaned by a rewind.
    pub fn remove_tx(&mut self, txid: &Hash256) {
        self.map.retain(|_, spenders| {
            spenders.retain(|spender| spender != txid);
            !spenders.is_empty()
        });
    }

    pub fn spenders(&self, nullifier: &Hash256) -> &[Hash256] {
        self.map
            .get(nullifier)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_spent(&self, nullifier: &Hash256) -> bool {
        !self.spenders(nullifier).is_empty()
    }

    pub fn has_conflict(&self, nullifier: &Hash256) -> bool {
        self.spenders(nullifier).len() > 1
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_note() -> DecryptedNote {
        DecryptedNote {
            value: 50_000,
            recipient: vec![0xab; 43],
            memo: b"rent".to_vec(),
            nullifier_key: [0x77; 32],
        }
    }

    #[test]
    fn note_record_roundtrip() {
        let id = OutputId {
            txid: [0x21; 32],
            index: 1,
        };
        let mut record = NoteRecord::unmined(id, [0x42; 32], sample_note());
        record.confirmed_height = Some(7);
        record.position = Some(12);
        record.nullifier = Some(derive_nullifier(&[0x77; 32], &[0x42; 32], 12));
        record.witness_height = 9;
        record.spent = Some(ConfirmedSpend {
            txid: [0x99; 32],
            height: 9,
        });

        let bytes = record.encode();
        let decoded = NoteRecord::decode(&bytes).expect("decode");
        assert_eq!(decoded.id, record.id);
        assert_eq!(decoded.note, record.note);
        assert_eq!(decoded.confirmed_height, record.confirmed_height);
        assert_eq!(decoded.position, record.position);
        assert_eq!(decoded.nullifier, record.nullifier);
        assert_eq!(decoded.witness_height, record.witness_height);
        assert_eq!(decoded.spent, record.spent);
    }

    #[test]
    fn nullifier_depends_on_position() {
        let nullifier_key = [0x11; 32];
        let commitment = [0x22; 32];
        assert_ne!(
            derive_nullifier(&nullifier_key, &commitment, 3),
            derive_nullifier(&nullifier_key, &commitment, 4)
        );
    }

    #[test]
    fn nullifier_index_tracks_conflicts_and_orphans() {
        let mut index = NullifierIndex::new();
        let nullifier = [0x01; 32];
        index.insert(nullifier, [0xaa; 32]);
        index.insert(nullifier, [0xaa; 32]);
        assert!(index.is_spent(&nullifier));
        assert!(!index.has_conflict(&nullifier));

        index.insert(nullifier, [0xbb; 32]);
        assert!(index.has_conflict(&nullifier));

        index.remove_tx(&[0xaa; 32]);
        assert!(!index.has_conflict(&nullifier));
        assert!(index.is_spent(&nullifier));
        index.remove_tx(&[0xbb; 32]);
        assert!(!index.is_spent(&nullifier));
        assert!(index.is_empty());
    }
}
