//! Namespace registry.
//!
//! A namespace is an isolated logical database: its own store, its own
//! exclusion lock, its own package set and at most one in-flight
//! transaction. The set of namespaces and their packages is persisted as a
//! JSON snapshot:
//!
//! ```json
//! { "default": { "packages": [] }, "tenant_a": { "packages": ["numpy"] } }
//! ```
//!
//! The snapshot is replayed at startup and rewritten atomically after every
//! change. A failed rewrite fails the change that caused it.

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::plugins::{QueryContext, TransactionSlot};
use crate::storage::{create_storage, Storage};

/// Namespace created when no snapshot exists.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Store name reserved for the auth store.
pub const RESERVED_NAMES: &[&str] = &["auth"];

/// Names become file names, so they are restricted to a safe alphabet.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !RESERVED_NAMES.contains(&name);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidNamespaceName(name.to_string()))
    }
}

/// One isolated logical database.
pub struct Namespace {
    name: String,
    storage: Arc<dyn Storage>,
    exclusion: Mutex<()>,
    packages: RwLock<BTreeSet<String>>,
    transaction: TransactionSlot,
    transaction_epoch: Arc<AtomicU64>,
}

impl Namespace {
    fn new(name: String, storage: Arc<dyn Storage>, packages: BTreeSet<String>) -> Self {
        Self {
            name,
            storage,
            exclusion: Mutex::new(()),
            packages: RwLock::new(packages),
            transaction: Arc::new(Mutex::new(None)),
            transaction_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn packages(&self) -> BTreeSet<String> {
        self.packages.read().clone()
    }

    pub fn transaction_active(&self) -> bool {
        self.transaction.lock().is_some()
    }

    /// Serialize work on this namespace. Released when the guard drops,
    /// including on error paths.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.exclusion.lock()
    }

    /// Per-call view handed to capabilities.
    pub fn context(&self) -> QueryContext {
        QueryContext {
            namespace: self.name.clone(),
            storage: Arc::clone(&self.storage),
            packages: self.packages(),
            transaction: Arc::clone(&self.transaction),
            transaction_epoch: Arc::clone(&self.transaction_epoch),
        }
    }

    /// Roll back a dangling transaction and close the store.
    fn shutdown(&self) -> Result<()> {
        let _guard = self.lock();
        if let Some(txn) = self.transaction.lock().take() {
            tracing::warn!(namespace = %self.name, "Rolling back unfinished transaction on close");
            if let Err(e) = txn.rollback() {
                tracing::warn!(namespace = %self.name, error = %e, "Rollback on close failed");
            }
        }
        self.storage.close()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("backend", &self.storage.backend_name())
            .field("packages", &*self.packages.read())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceMeta {
    #[serde(default)]
    packages: Vec<String>,
}

type Metadata = BTreeMap<String, NamespaceMeta>;

/// All namespaces known to this process.
pub struct NamespaceRegistry {
    data_dir: PathBuf,
    storage_config: StorageConfig,
    metadata_path: PathBuf,
    namespaces: RwLock<BTreeMap<String, Arc<Namespace>>>,
    /// Serializes snapshot rewrites.
    save_lock: Mutex<()>,
}

impl NamespaceRegistry {
    /// Open the registry, replaying the snapshot at `metadata_path` or
    /// creating the `default` namespace when there is none.
    pub fn open(
        data_dir: &Path,
        storage_config: &StorageConfig,
        metadata_path: &Path,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let registry = Self {
            data_dir: data_dir.to_path_buf(),
            storage_config: storage_config.clone(),
            metadata_path: metadata_path.to_path_buf(),
            namespaces: RwLock::new(BTreeMap::new()),
            save_lock: Mutex::new(()),
        };

        match registry.read_metadata()? {
            Some(metadata) => {
                for (name, meta) in metadata {
                    registry.create_namespace(&name, meta.packages)?;
                }
                tracing::info!(
                    path = %registry.metadata_path.display(),
                    namespaces = registry.namespaces.read().len(),
                    "Loaded namespace metadata"
                );
            }
            None => {
                registry.create_namespace(DEFAULT_NAMESPACE, Vec::<String>::new())?;
            }
        }
        Ok(registry)
    }

    fn read_metadata(&self) -> Result<Option<Metadata>> {
        if !self.metadata_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&self.metadata_path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Rewrite the snapshot via a temp file and rename.
    fn save(&self, namespaces: &BTreeMap<String, Arc<Namespace>>) -> Result<()> {
        let _guard = self.save_lock.lock();
        let metadata: Metadata = namespaces
            .iter()
            .map(|(name, ns)| {
                let meta = NamespaceMeta {
                    packages: ns.packages.read().iter().cloned().collect(),
                };
                (name.clone(), meta)
            })
            .collect();

        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.metadata_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&metadata)?)?;
        std::fs::rename(&tmp, &self.metadata_path)?;
        Ok(())
    }

    /// Create a namespace. A no-op returning the existing namespace if the
    /// name is already registered.
    pub fn create_namespace<I, S>(&self, name: &str, packages: I) -> Result<Arc<Namespace>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_name(name)?;
        let mut namespaces = self.namespaces.write();
        if let Some(existing) = namespaces.get(name) {
            return Ok(Arc::clone(existing));
        }

        let storage = create_storage(&self.storage_config, &self.data_dir, name)?;
        let packages: BTreeSet<String> = packages.into_iter().map(Into::into).collect();
        let namespace = Arc::new(Namespace::new(name.to_string(), storage, packages));
        namespaces.insert(name.to_string(), Arc::clone(&namespace));

        if let Err(e) = self.save(&namespaces) {
            namespaces.remove(name);
            let _ = namespace.storage.close();
            tracing::error!(namespace = %name, error = %e, "Failed to persist namespace metadata");
            return Err(e);
        }

        tracing::info!(
            namespace = %name,
            backend = namespace.storage.backend_name(),
            "Created namespace"
        );
        Ok(namespace)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Namespace>> {
        self.namespaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.namespaces.read().contains_key(name)
    }

    /// Registered namespace names, sorted.
    pub fn list_namespaces(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// Record `package` for `namespace`. Returns whether it was newly added.
    ///
    /// Only the record is kept; nothing is downloaded.
    pub fn install_package(&self, namespace: &str, package: &str) -> Result<bool> {
        let package = package.trim();
        if package.is_empty() {
            return Err(Error::invalid_argument("package name must not be empty"));
        }
        let ns = self.get(namespace)?;
        let _guard = ns.lock();
        if !ns.packages.write().insert(package.to_string()) {
            return Ok(false);
        }

        if let Err(e) = self.save(&self.namespaces.read()) {
            ns.packages.write().remove(package);
            return Err(e);
        }
        tracing::info!(namespace = %namespace, package = %package, "Installed package");
        Ok(true)
    }

    /// Remove a namespace from the registry and close its store. The store's
    /// files are left on disk.
    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        let namespace = {
            let mut namespaces = self.namespaces.write();
            let namespace = namespaces
                .remove(name)
                .ok_or_else(|| Error::NamespaceNotFound(name.to_string()))?;
            if let Err(e) = self.save(&namespaces) {
                namespaces.insert(name.to_string(), namespace);
                return Err(e);
            }
            namespace
        };

        // Waits for a running query on this namespace to finish.
        namespace.shutdown()?;
        tracing::info!(namespace = %name, "Dropped namespace");
        Ok(())
    }

    /// Close every store. Errors are logged, the first one is returned.
    pub fn close_all(&self) -> Result<()> {
        let namespaces: Vec<Arc<Namespace>> = self.namespaces.read().values().cloned().collect();
        let mut first_error = None;
        for ns in namespaces {
            if let Err(e) = ns.shutdown() {
                tracing::warn!(namespace = %ns.name, error = %e, "Failed to close namespace store");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl std::fmt::Debug for NamespaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceRegistry")
            .field("data_dir", &self.data_dir)
            .field("backend", &self.storage_config.backend)
            .field("namespaces", &self.namespaces.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackendKind;
    use tempfile::TempDir;

    fn memory() -> StorageConfig {
        StorageConfig {
            backend: StorageBackendKind::Memory,
            ..StorageConfig::default()
        }
    }

    fn open(dir: &TempDir, config: &StorageConfig) -> NamespaceRegistry {
        NamespaceRegistry::open(dir.path(), config, &dir.path().join("metadata.json")).unwrap()
    }

    #[test]
    fn fresh_registry_has_default_namespace() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir, &memory());
        assert_eq!(registry.list_namespaces(), vec![DEFAULT_NAMESPACE]);
        assert!(dir.path().join("metadata.json").exists());
    }

    #[test]
    fn create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir, &memory());
        let first = registry.create_namespace("tenant_a", ["numpy"]).unwrap();
        let second = registry.create_namespace("tenant_a", Vec::<String>::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.packages(), BTreeSet::from(["numpy".to_string()]));
        assert_eq!(registry.list_namespaces(), vec!["default", "tenant_a"]);
    }

    #[test]
    fn snapshot_is_replayed_on_open() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::default();
        {
            let registry = open(&dir, &config);
            registry.create_namespace("tenant_a", Vec::<String>::new()).unwrap();
            assert!(registry.install_package("tenant_a", "requests").unwrap());
            assert!(!registry.install_package("tenant_a", "requests").unwrap());
            registry
                .get("tenant_a")
                .unwrap()
                .storage()
                .put(b"k", b"v")
                .unwrap();
            registry.close_all().unwrap();
        }

        let registry = open(&dir, &config);
        assert_eq!(registry.list_namespaces(), vec!["default", "tenant_a"]);
        let ns = registry.get("tenant_a").unwrap();
        assert_eq!(ns.packages(), BTreeSet::from(["requests".to_string()]));
        assert_eq!(ns.storage().get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn unknown_namespace_is_an_error() {
        let dir = TempDir::new().unwrap();
        let registry = open(&dir, &memory());
        assert!(matches!(registry.get("nope"), Err(Error::NamespaceNotFound(_))));
        assert!(matches!(
            registry.install_package("nope", "x"),
            Err(Error::NamespaceNotFound(_))
        ));
    }

    #[test]
    fn names_are_validated() {
        for bad in ["", "../etc", "a b", "auth", "x/y"] {
            assert!(matches!(validate_name(bad), Err(Error::InvalidNamespaceName(_))), "{bad}");
        }
        for good in ["default", "tenant-a", "Tenant_2"] {
            assert!(validate_name(good).is_ok());
        }
    }

    #[test]
    fn drop_removes_from_registry_and_snapshot() {
        let dir = TempDir::new().unwrap();
        let config = memory();
        let registry = open(&dir, &config);
        registry.create_namespace("gone", Vec::<String>::new()).unwrap();
        registry.drop_namespace("gone").unwrap();
        assert!(!registry.contains("gone"));
        assert!(matches!(registry.drop_namespace("gone"), Err(Error::NamespaceNotFound(_))));

        let reopened = open(&dir, &config);
        assert_eq!(reopened.list_namespaces(), vec!["default"]);
    }

    #[test]
    fn failed_snapshot_write_rolls_back_creation() {
        let dir = TempDir::new().unwrap();
        // The metadata path is a directory, so the rename fails.
        let metadata = dir.path().join("meta");
        std::fs::create_dir_all(metadata.join("blocker")).unwrap();
        let registry = NamespaceRegistry {
            data_dir: dir.path().to_path_buf(),
            storage_config: memory(),
            metadata_path: metadata,
            namespaces: RwLock::new(BTreeMap::new()),
            save_lock: Mutex::new(()),
        };
        assert!(registry.create_namespace("tenant", Vec::<String>::new()).is_err());
        assert!(!registry.contains("tenant"));
    }
}
