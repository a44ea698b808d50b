//! Storage factory.
//!
//! Maps the configured backend kind to a concrete [`Storage`]. Every store
//! (one per namespace plus the auth store) goes through here, so callers
//! never name a backend type.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::memory::MemoryStorage;
use super::sqlite::SqliteStorage;
use super::traits::Storage;
use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::Result;

/// Deterministic on-disk location for a store name.
pub fn storage_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{name}.db"))
}

/// Factory: open the store called `name` under `data_dir`.
///
/// # Arguments
///
/// * `config` - Storage section of the configuration
/// * `data_dir` - Root data directory
/// * `name` - Store name (namespace name, or `auth`)
pub fn create_storage(
    config: &StorageConfig,
    data_dir: &Path,
    name: &str,
) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackendKind::Sqlite => {
            let path = storage_path(data_dir, name);
            tracing::info!(
                store = %name,
                path = %path.display(),
                "Opening sqlite store"
            );
            Ok(Arc::new(SqliteStorage::open(&path, config)?))
        }
        StorageBackendKind::Memory => {
            tracing::info!(store = %name, "Opening memory store");
            Ok(Arc::new(MemoryStorage::new(name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_derived_from_name() {
        assert_eq!(
            storage_path(Path::new("/data"), "tenant_a"),
            PathBuf::from("/data/tenant_a.db")
        );
    }

    #[test]
    fn factory_picks_configured_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::default();

        let sqlite = create_storage(&config, tmp.path(), "ns").unwrap();
        assert_eq!(sqlite.backend_name(), "sqlite");
        assert!(storage_path(tmp.path(), "ns").exists());

        config.backend = StorageBackendKind::Memory;
        let memory = create_storage(&config, tmp.path(), "other").unwrap();
        assert_eq!(memory.backend_name(), "memory");
        assert!(!storage_path(tmp.path(), "other").exists());
    }
}
