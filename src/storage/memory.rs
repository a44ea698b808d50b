//! In-process storage backend.
//!
//! Keys live in ordered maps; each column family is its own partition.
//! Nothing is persisted and transactions are not supported, which makes this
//! backend useful for tests and throwaway namespaces.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use super::traits::{BatchOp, KvPair, Storage};
use crate::error::{Error, Result};

type Keyspace = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
struct MemoryState {
    default: Keyspace,
    families: BTreeMap<String, Keyspace>,
    closed: bool,
}

/// Volatile [`Storage`] implementation.
pub struct MemoryStorage {
    name: String,
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn closed(&self) -> Error {
        Error::StorageClosed(self.name.clone())
    }
}

impl MemoryState {
    fn keyspace(&self, cf: Option<&str>) -> Result<&Keyspace> {
        match cf {
            None => Ok(&self.default),
            Some(name) => self
                .families
                .get(name)
                .ok_or_else(|| Error::ColumnFamilyNotFound(name.to_string())),
        }
    }

    fn keyspace_mut(&mut self, cf: Option<&str>) -> Result<&mut Keyspace> {
        match cf {
            None => Ok(&mut self.default),
            Some(name) => self
                .families
                .get_mut(name)
                .ok_or_else(|| Error::ColumnFamilyNotFound(name.to_string())),
        }
    }
}

impl Storage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        if state.closed {
            return Err(self.closed());
        }
        Ok(state.default.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(self.closed());
        }
        state.default.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(self.closed());
        }
        state.default.remove(key);
        Ok(())
    }

    fn scan_page(
        &self,
        cf: Option<&str>,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvPair>> {
        let state = self.state.read();
        if state.closed {
            return Err(self.closed());
        }
        let keyspace = state.keyspace(cf)?;
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Unbounded,
        };
        Ok(keyspace
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: &[BatchOp]) -> Result<()> {
        // A single write lock makes the batch atomic for readers.
        let mut state = self.state.write();
        if state.closed {
            return Err(self.closed());
        }
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    state.default.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    state.default.remove(key);
                }
            }
        }
        Ok(())
    }

    fn create_column_family(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("column family name must not be empty"));
        }
        let mut state = self.state.write();
        if state.closed {
            return Err(self.closed());
        }
        state.families.entry(name.to_string()).or_default();
        Ok(())
    }

    fn drop_column_family(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(self.closed());
        }
        state
            .families
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::ColumnFamilyNotFound(name.to_string()))
    }

    fn list_column_families(&self) -> Result<BTreeSet<String>> {
        let state = self.state.read();
        if state.closed {
            return Err(self.closed());
        }
        Ok(state.families.keys().cloned().collect())
    }

    fn get_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        if state.closed {
            return Err(self.closed());
        }
        Ok(state.keyspace(Some(cf))?.get(key).cloned())
    }

    fn put_cf(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(self.closed());
        }
        state
            .keyspace_mut(Some(cf))?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete_cf(&self, cf: &str, key: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(self.closed());
        }
        state.keyspace_mut(Some(cf))?.remove(key);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.closed {
            state.closed = true;
            state.default.clear();
            state.families.clear();
            tracing::debug!(storage = %self.name, "Closed memory storage");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStorage")
            .field("name", &self.name)
            .field("keys", &state.default.len())
            .field("column_families", &state.families.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactions_are_unsupported() {
        let storage = MemoryStorage::new("t");
        assert!(!storage.supports_transactions());
        let err = match storage.transaction() {
            Ok(_) => panic!("memory backend must not open transactions"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::TransactionUnsupported(ref b) if b == "memory"));
    }

    #[test]
    fn maintenance_hints_are_noops() {
        let storage = MemoryStorage::new("t");
        storage.compact_range(None, None).unwrap();
        storage.compact_range(Some(b"a"), Some(b"z")).unwrap();
        storage.flush().unwrap();
    }

    #[test]
    fn operations_after_close_fail() {
        let storage = MemoryStorage::new("t");
        storage.put(b"k", b"v").unwrap();
        storage.close().unwrap();
        storage.close().unwrap();
        assert!(matches!(storage.get(b"k"), Err(Error::StorageClosed(_))));
    }

    #[test]
    fn dropping_a_family_discards_its_keys() {
        let storage = MemoryStorage::new("t");
        storage.create_column_family("cf1").unwrap();
        storage.put_cf("cf1", b"k", b"v").unwrap();
        storage.drop_column_family("cf1").unwrap();
        storage.create_column_family("cf1").unwrap();
        assert_eq!(storage.get_cf("cf1", b"k").unwrap(), None);
    }
}
