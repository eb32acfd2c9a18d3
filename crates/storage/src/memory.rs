//! In-memory store used by tests and cold-start tooling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryStore {
    columns: Mutex<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(_: impl std::fmt::Debug) -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.lock().map_err(poisoned)?;
        Ok(columns
            .get(&column)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(poisoned)?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(poisoned)?;
        if let Some(entries) = columns.get_mut(&column) {
            entries.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let columns = self.columns.lock().map_err(poisoned)?;
        let Some(entries) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        let mut results = Vec::new();
        for (key, value) in entries.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(poisoned)?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(column) {
                        entries.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"key".to_vec(), b"first".to_vec());
        batch.put(Column::Meta, b"key".to_vec(), b"second".to_vec());
        batch.delete(Column::Meta, b"other".to_vec());
        store.write_batch(&batch).expect("commit");

        assert_eq!(
            store.get(Column::Meta, b"key").expect("get"),
            Some(b"second".to_vec())
        );
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put(Column::HeightIndex, b"aa1", b"1").expect("put");
        store.put(Column::HeightIndex, b"aa2", b"2").expect("put");
        store.put(Column::HeightIndex, b"ab1", b"3").expect("put");

        let results = store.scan_prefix(Column::HeightIndex, b"aa").expect("scan");
        assert_eq!(
            results,
            vec![
                (b"aa1".to_vec(), b"1".to_vec()),
                (b"aa2".to_vec(), b"2".to_vec()),
            ]
        );
    }
}
