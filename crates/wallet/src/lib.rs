//! Wallet-side chain synchronization: note records, the witness cache and
//! the coordinator that keeps them in lock-step with the active chain.

pub mod metrics;
pub mod notes;
pub mod sync;
pub mod witness;

pub use notes::{DecryptedNote, NoteRecord, NullifierIndex, OutputId};
pub use sync::{ChainSync, DecryptedOutput, NoteSummary, SyncError, SyncState};
pub use witness::{WitnessCache, WITNESS_CACHE_SIZE};
