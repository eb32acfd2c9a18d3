//! Shielded transaction surface consumed by the state-sync core.
//!
//! Script and proof validation happen upstream; by the time a transaction
//! reaches this crate it is already valid and only its shielded effects
//! (nullifiers revealed, commitments created, pool value balance) matter.

use veild_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

/// A spend of a shielded note, revealing only its nullifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpendDescription {
    pub nullifier: Hash256,
}

/// A newly created shielded note, visible on chain only as its commitment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutputDescription {
    pub commitment: Hash256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    /// Net value flowing out of the shielded pool (negative values shield).
    pub value_balance: i64,
    pub shielded_spends: Vec<SpendDescription>,
    pub shielded_outputs: Vec<OutputDescription>,
    pub expiry_height: u32,
}

impl Transaction {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(
            24 + 32 * (self.shielded_spends.len() + self.shielded_outputs.len()),
        );
        encoder.write_i32_le(self.version);
        encoder.write_i64_le(self.value_balance);
        encoder.write_var_int(self.shielded_spends.len() as u64);
        for spend in &self.shielded_spends {
            encoder.write_hash(&spend.nullifier);
        }
        encoder.write_var_int(self.shielded_outputs.len() as u64);
        for output in &self.shielded_outputs {
            encoder.write_hash(&output.commitment);
        }
        encoder.write_u32_le(self.expiry_height);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub(crate) fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let value_balance = decoder.read_i64_le()?;
        let spend_count = decoder.read_var_int()?;
        let mut shielded_spends = Vec::with_capacity(spend_count.min(1024) as usize);
        for _ in 0..spend_count {
            shielded_spends.push(SpendDescription {
                nullifier: decoder.read_hash()?,
            });
        }
        let output_count = decoder.read_var_int()?;
        let mut shielded_outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            shielded_outputs.push(OutputDescription {
                commitment: decoder.read_hash()?,
            });
        }
        let expiry_height = decoder.read_u32_le()?;
        Ok(Self {
            version,
            value_balance,
            shielded_spends,
            shielded_outputs,
            expiry_height,
        })
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode())
    }
}
