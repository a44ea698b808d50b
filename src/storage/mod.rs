//! Pluggable key-value storage.
//!
//! Two interchangeable backends implement [`Storage`]:
//!
//! - [`SqliteStorage`]: durable, one file per store, native transactions
//! - [`MemoryStorage`]: volatile, no transactions
//!
//! New backends only need to implement the trait and add a branch to
//! [`create_storage`].

pub mod factory;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use factory::{create_storage, storage_path};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::{BatchOp, KvIter, KvPair, Storage, Transaction};

#[cfg(test)]
mod contract_tests {
    //! Behaviour every backend must share.

    use super::*;
    use crate::config::StorageConfig;
    use crate::error::Error;
    use std::sync::Arc;

    fn backends() -> (tempfile::TempDir, Vec<Arc<dyn Storage>>) {
        let tmp = tempfile::tempdir().unwrap();
        let sqlite = SqliteStorage::open(&tmp.path().join("c.db"), &StorageConfig::default())
            .unwrap();
        let stores: Vec<Arc<dyn Storage>> =
            vec![Arc::new(sqlite), Arc::new(MemoryStorage::new("c"))];
        (tmp, stores)
    }

    #[test]
    fn put_get_delete() {
        let (_tmp, stores) = backends();
        for store in stores {
            store.put(b"k", b"v").unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
            store.put(b"k", b"v2").unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
            store.delete(b"k").unwrap();
            assert_eq!(store.get(b"k").unwrap(), None, "{}", store.backend_name());
            // Deleting a missing key is fine.
            store.delete(b"missing").unwrap();
        }
    }

    #[test]
    fn batch_applies_in_listed_order() {
        let (_tmp, stores) = backends();
        for store in stores {
            store
                .write_batch(&[BatchOp::put("a", "1"), BatchOp::put("a", "2"), BatchOp::delete("a")])
                .unwrap();
            assert_eq!(store.get(b"a").unwrap(), None);

            store
                .write_batch(&[BatchOp::put("a", "1"), BatchOp::delete("b"), BatchOp::put("b", "2")])
                .unwrap();
            assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
            assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        }
    }

    #[test]
    fn iteration_is_ordered_and_restartable() {
        let (_tmp, stores) = backends();
        for store in stores {
            for i in 0..600u32 {
                store.put(format!("key{i:04}").as_bytes(), b"v").unwrap();
            }
            let first: Vec<_> = store.iterate().collect::<crate::Result<_>>().unwrap();
            assert_eq!(first.len(), 600);
            assert!(first.windows(2).all(|w| w[0].0 < w[1].0));

            let second = store.iterate().count();
            assert_eq!(second, 600);
        }
    }

    #[test]
    fn column_families_are_scoped() {
        let (_tmp, stores) = backends();
        for store in stores {
            store.create_column_family("cf1").unwrap();
            store.create_column_family("cf1").unwrap();
            store.put_cf("cf1", b"k", b"v").unwrap();
            assert_eq!(store.get_cf("cf1", b"k").unwrap(), Some(b"v".to_vec()));
            assert_eq!(store.get(b"k").unwrap(), None);

            assert!(matches!(
                store.get_cf("cf2", b"k"),
                Err(Error::ColumnFamilyNotFound(ref cf)) if cf == "cf2"
            ));
            assert!(matches!(
                store.put_cf("cf2", b"k", b"v"),
                Err(Error::ColumnFamilyNotFound(_))
            ));
            assert!(matches!(
                store.drop_column_family("cf2"),
                Err(Error::ColumnFamilyNotFound(_))
            ));

            let cf_entries: Vec<_> = store.iterate_cf("cf1").collect::<crate::Result<_>>().unwrap();
            assert_eq!(cf_entries, vec![(b"k".to_vec(), b"v".to_vec())]);
            assert!(store.iterate_cf("cf2").next().unwrap().is_err());

            store.delete_cf("cf1", b"k").unwrap();
            assert_eq!(store.get_cf("cf1", b"k").unwrap(), None);

            assert!(store.list_column_families().unwrap().contains("cf1"));
            store.drop_column_family("cf1").unwrap();
            assert!(!store.list_column_families().unwrap().contains("cf1"));
        }
    }

    #[test]
    fn transactions_commit_or_roll_back_when_supported() {
        let (_tmp, stores) = backends();
        for store in stores {
            if !store.supports_transactions() {
                assert!(matches!(store.transaction(), Err(Error::TransactionUnsupported(_))));
                continue;
            }
            store.put(b"k", b"before").unwrap();

            let mut txn = store.transaction().unwrap();
            txn.put(b"k", b"during").unwrap();
            assert_eq!(txn.get(b"k").unwrap(), Some(b"during".to_vec()));
            txn.rollback().unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"before".to_vec()));

            let mut txn = store.transaction().unwrap();
            txn.put(b"k", b"after").unwrap();
            txn.delete(b"other").unwrap();
            txn.commit().unwrap();
            assert_eq!(store.get(b"k").unwrap(), Some(b"after".to_vec()));
        }
    }
}
