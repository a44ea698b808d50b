//! SQLite storage backend.
//!
//! One database file per store. Every keyspace shares a single `kv` table
//! keyed by `(cf, key)`; the default keyspace uses the empty family name.
//! Column families are recorded in their own table, so they survive restarts.
//!
//! Transactions are native: `BEGIN IMMEDIATE` stays open on the connection
//! until the handle commits or rolls back. While it is open, every write made
//! through the store lands inside it.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::traits::{BatchOp, KvPair, Storage, Transaction};
use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Family name used for the default keyspace.
const DEFAULT_CF: &str = "";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS column_families (
        name TEXT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS kv (
        cf    TEXT NOT NULL,
        key   BLOB NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (cf, key)
    ) WITHOUT ROWID;
";

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// Durable [`Storage`] implementation on top of `rusqlite`.
pub struct SqliteStorage {
    path: PathBuf,
    conn: SharedConnection,
}

impl SqliteStorage {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            &config.journal_mode,
            |row| row.get(0),
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(
            path = %path.display(),
            journal_mode = %mode,
            "Opened sqlite storage"
        );

        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the live connection.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        with_shared(&self.conn, &self.path, f)
    }
}

fn with_shared<T>(
    conn: &SharedConnection,
    path: &Path,
    f: impl FnOnce(&mut Connection) -> Result<T>,
) -> Result<T> {
    let mut guard = conn.lock();
    match guard.as_mut() {
        Some(conn) => f(conn),
        None => Err(Error::StorageClosed(path.display().to_string())),
    }
}

fn family_exists(conn: &Connection, cf: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM column_families WHERE name = ?1",
            params![cf],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn require_family(conn: &Connection, cf: &str) -> Result<()> {
    if family_exists(conn, cf)? {
        Ok(())
    } else {
        Err(Error::ColumnFamilyNotFound(cf.to_string()))
    }
}

fn kv_get(conn: &Connection, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT value FROM kv WHERE cf = ?1 AND key = ?2",
            params![cf, key],
            |row| row.get(0),
        )
        .optional()?)
}

fn kv_put(conn: &Connection, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO kv (cf, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT (cf, key) DO UPDATE SET value = excluded.value",
        params![cf, key, value],
    )?;
    Ok(())
}

fn kv_delete(conn: &Connection, cf: &str, key: &[u8]) -> Result<()> {
    conn.execute(
        "DELETE FROM kv WHERE cf = ?1 AND key = ?2",
        params![cf, key],
    )?;
    Ok(())
}

impl Storage for SqliteStorage {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| kv_get(conn, DEFAULT_CF, key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_conn(|conn| kv_put(conn, DEFAULT_CF, key, value))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_conn(|conn| kv_delete(conn, DEFAULT_CF, key))
    }

    fn scan_page(
        &self,
        cf: Option<&str>,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvPair>> {
        self.with_conn(|conn| {
            let family = match cf {
                Some(name) => {
                    require_family(conn, name)?;
                    name
                }
                None => DEFAULT_CF,
            };
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<KvPair> {
                Ok((row.get(0)?, row.get(1)?))
            };
            let rows = match after {
                Some(cursor) => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT key, value FROM kv WHERE cf = ?1 AND key > ?2
                         ORDER BY key LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![family, cursor, limit], map_row)?
                        .collect::<rusqlite::Result<Vec<KvPair>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare_cached(
                        "SELECT key, value FROM kv WHERE cf = ?1 ORDER BY key LIMIT ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![family, limit], map_row)?
                        .collect::<rusqlite::Result<Vec<KvPair>>>()?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    fn write_batch(&self, ops: &[BatchOp]) -> Result<()> {
        self.with_conn(|conn| {
            // A savepoint nests inside an open transaction and acts as a
            // plain transaction otherwise.
            let sp = conn.savepoint()?;
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => kv_put(&sp, DEFAULT_CF, key, value)?,
                    BatchOp::Delete { key } => kv_delete(&sp, DEFAULT_CF, key)?,
                }
            }
            sp.commit()?;
            Ok(())
        })
    }

    fn create_column_family(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("column family name must not be empty"));
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO column_families (name) VALUES (?1)",
                params![name],
            )?;
            Ok(())
        })
    }

    fn drop_column_family(&self, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            require_family(conn, name)?;
            let sp = conn.savepoint()?;
            sp.execute("DELETE FROM kv WHERE cf = ?1", params![name])?;
            sp.execute("DELETE FROM column_families WHERE name = ?1", params![name])?;
            sp.commit()?;
            Ok(())
        })
    }

    fn list_column_families(&self) -> Result<BTreeSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT name FROM column_families")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<BTreeSet<String>>>()?;
            Ok(names)
        })
    }

    fn get_cf(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            require_family(conn, cf)?;
            kv_get(conn, cf, key)
        })
    }

    fn put_cf(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            require_family(conn, cf)?;
            kv_put(conn, cf, key, value)
        })
    }

    fn delete_cf(&self, cf: &str, key: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            require_family(conn, cf)?;
            kv_delete(conn, cf, key)
        })
    }

    fn compact_range(&self, _begin: Option<&[u8]>, _end: Option<&[u8]>) -> Result<()> {
        // SQLite has no ranged compaction; let the planner refresh statistics
        // and reclaim pages when no transaction is open.
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA optimize;")?;
            if conn.is_autocommit() {
                conn.execute_batch("VACUUM;")?;
            }
            Ok(())
        })
    }

    fn flush(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn transaction(&self) -> Result<Box<dyn Transaction>> {
        self.with_conn(|conn| {
            if !conn.is_autocommit() {
                return Err(Error::TransactionAlreadyActive(self.path.display().to_string()));
            }
            conn.execute_batch("BEGIN IMMEDIATE;")?;
            Ok(())
        })?;
        tracing::debug!(path = %self.path.display(), "Began sqlite transaction");
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            path: self.path.clone(),
            finished: false,
        }))
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| Error::Sqlite(e))?;
            tracing::debug!(path = %self.path.display(), "Closed sqlite storage");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .field("open", &self.conn.lock().is_some())
            .finish()
    }
}

/// Transaction held open on the store's connection.
struct SqliteTransaction {
    conn: SharedConnection,
    path: PathBuf,
    finished: bool,
}

impl SqliteTransaction {
    fn finish(&mut self, statement: &str) -> Result<()> {
        self.finished = true;
        with_shared(&self.conn, &self.path, |conn| {
            conn.execute_batch(statement)?;
            Ok(())
        })
    }
}

impl Transaction for SqliteTransaction {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        with_shared(&self.conn, &self.path, |conn| kv_get(conn, DEFAULT_CF, key))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        with_shared(&self.conn, &self.path, |conn| kv_put(conn, DEFAULT_CF, key, value))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        with_shared(&self.conn, &self.path, |conn| kv_delete(conn, DEFAULT_CF, key))
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT;")?;
        tracing::debug!(path = %self.path.display(), "Committed sqlite transaction");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK;")?;
        tracing::debug!(path = %self.path.display(), "Rolled back sqlite transaction");
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let result = with_shared(&self.conn, &self.path, |conn| {
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK;")?;
            }
            Ok(())
        });
        match result {
            Ok(()) => tracing::warn!(
                path = %self.path.display(),
                "Unfinished transaction dropped, rolled back"
            ),
            // A closed store already discarded the transaction.
            Err(Error::StorageClosed(_)) => {}
            Err(e) => tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to roll back dropped transaction"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(&tmp.path().join("t.db"), &StorageConfig::default())
            .unwrap();
        (tmp, storage)
    }

    #[test]
    fn column_families_persist_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.db");
        {
            let storage = SqliteStorage::open(&path, &StorageConfig::default()).unwrap();
            storage.create_column_family("cf1").unwrap();
            storage.put_cf("cf1", b"k", b"v").unwrap();
            storage.close().unwrap();
        }
        let storage = SqliteStorage::open(&path, &StorageConfig::default()).unwrap();
        assert!(storage.list_column_families().unwrap().contains("cf1"));
        assert_eq!(storage.get_cf("cf1", b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn default_keyspace_is_not_a_listed_family() {
        let (_tmp, storage) = open_temp();
        storage.put(b"k", b"v").unwrap();
        assert!(storage.list_column_families().unwrap().is_empty());
    }

    #[test]
    fn second_transaction_is_rejected_while_one_is_open() {
        let (_tmp, storage) = open_temp();
        let txn = storage.transaction().unwrap();
        assert!(matches!(
            storage.transaction(),
            Err(Error::TransactionAlreadyActive(_))
        ));
        txn.rollback().unwrap();
        storage.transaction().unwrap().commit().unwrap();
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (_tmp, storage) = open_temp();
        {
            let mut txn = storage.transaction().unwrap();
            txn.put(b"k", b"v").unwrap();
        }
        assert_eq!(storage.get(b"k").unwrap(), None);
    }

    #[test]
    fn batch_inside_transaction_is_undone_by_rollback() {
        let (_tmp, storage) = open_temp();
        let txn = storage.transaction().unwrap();
        storage
            .write_batch(&[BatchOp::put("a", "1"), BatchOp::put("b", "2")])
            .unwrap();
        txn.rollback().unwrap();
        assert_eq!(storage.get(b"a").unwrap(), None);
        assert_eq!(storage.get(b"b").unwrap(), None);
    }

    #[test]
    fn close_is_idempotent_and_fails_later_calls() {
        let (_tmp, storage) = open_temp();
        storage.close().unwrap();
        storage.close().unwrap();
        assert!(matches!(storage.get(b"k"), Err(Error::StorageClosed(_))));
    }

    #[test]
    fn maintenance_hints_succeed() {
        let (_tmp, storage) = open_temp();
        storage.put(b"k", b"v").unwrap();
        storage.flush().unwrap();
        storage.compact_range(None, None).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
