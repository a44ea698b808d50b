//! The storage capability contract.
//!
//! Namespaces, the auth store and every capability program against
//! [`Storage`] only. Backends are swapped through configuration and never
//! special-cased by callers.

use std::collections::{BTreeSet, VecDeque};

use crate::error::{Error, Result};

/// A raw key/value pair as stored by a backend.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Entries fetched per round-trip by [`KvIter`].
pub const SCAN_PAGE_SIZE: usize = 256;

/// One operation of a write batch. Batches apply in listed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// An open transaction on a backend that supports them.
///
/// Dropping a transaction without calling `commit` rolls it back.
pub trait Transaction: Send {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Key-value storage backend.
pub trait Storage: Send + Sync {
    /// Short backend identifier, e.g. `"sqlite"`.
    fn backend_name(&self) -> &'static str;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Up to `limit` entries in key order, strictly after `after` when given.
    ///
    /// `cf = None` addresses the default keyspace. This is the primitive
    /// behind [`KvIter`]; callers normally use `iterate`/`iterate_cf`.
    fn scan_page(&self, cf: Option<&str>, after: Option<&[u8]>, limit: usize)
        -> Result<Vec<KvPair>>;

    /// Apply all operations atomically, in order.
    fn write_batch(&self, ops: &[BatchOp]) -> Result<()>;

    /// Create a column family. Creating an existing one is a no-op.
    fn create_column_family(&self, name: &str) -> Result<()>;
    fn drop_column_family(&self, name: &str) -> Result<()>;
    fn list_column_families(&self) -> Result<BTreeSet<String>>;

    fn get_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put_cf(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete_cf(&self, cf: &str, key: &[u8]) -> Result<()>;

    /// Maintenance hint. Backends without native compaction do nothing.
    fn compact_range(&self, _begin: Option<&[u8]>, _end: Option<&[u8]>) -> Result<()> {
        Ok(())
    }

    /// Maintenance hint. Backends without a write buffer do nothing.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    /// Open a transaction. Callers check `supports_transactions` or
    /// handle `TransactionUnsupported`.
    fn transaction(&self) -> Result<Box<dyn Transaction>> {
        Err(Error::TransactionUnsupported(self.backend_name().into()))
    }

    /// Release underlying resources. Idempotent.
    fn close(&self) -> Result<()>;
}

impl dyn Storage {
    /// Lazy iteration over the default keyspace.
    ///
    /// Each call starts a fresh pass. Writers running concurrently may or may
    /// not be observed.
    pub fn iterate(&self) -> KvIter<'_> {
        KvIter::new(self, None)
    }

    /// Lazy iteration over one column family.
    pub fn iterate_cf(&self, cf: &str) -> KvIter<'_> {
        KvIter::new(self, Some(cf.to_string()))
    }
}

/// Paged iterator over a keyspace, driven by [`Storage::scan_page`].
pub struct KvIter<'a> {
    storage: &'a dyn Storage,
    cf: Option<String>,
    buffer: VecDeque<KvPair>,
    cursor: Option<Vec<u8>>,
    exhausted: bool,
}

impl<'a> KvIter<'a> {
    fn new(storage: &'a dyn Storage, cf: Option<String>) -> Self {
        Self {
            storage,
            cf,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let page = self.storage.scan_page(
            self.cf.as_deref(),
            self.cursor.as_deref(),
            SCAN_PAGE_SIZE,
        )?;
        if page.len() < SCAN_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.cursor = Some(last.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for KvIter<'_> {
    type Item = Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl std::fmt::Debug for KvIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvIter")
            .field("backend", &self.storage.backend_name())
            .field("cf", &self.cf)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
