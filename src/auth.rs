//! User credentials.
//!
//! Usernames map to passwords in a dedicated store named `auth`, separate
//! from every namespace. Passwords are stored and compared as plain bytes:
//! anyone who can read the store can read every password. Put the data
//! directory somewhere only the service account can reach.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::storage::{create_storage, Storage};

/// Store name of the auth store.
pub const AUTH_STORE: &str = "auth";

pub struct AuthStore {
    storage: Arc<dyn Storage>,
    /// Makes check-then-insert in `create_user` atomic.
    create_lock: Mutex<()>,
}

impl AuthStore {
    pub fn open(config: &StorageConfig, data_dir: &Path) -> Result<Self> {
        Ok(Self::with_storage(create_storage(config, data_dir, AUTH_STORE)?))
    }

    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            create_lock: Mutex::new(()),
        }
    }

    /// True iff `username` exists and its stored password equals `password`.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        let stored = self.storage.get(username.as_bytes())?;
        let ok = stored.as_deref() == Some(password.as_bytes());
        if !ok {
            tracing::info!(username = %username, "Authentication failed");
        }
        Ok(ok)
    }

    /// Like [`authenticate`](Self::authenticate), but a mismatch is
    /// `InvalidCredentials`.
    pub fn require(&self, username: &str, password: &str) -> Result<()> {
        if self.authenticate(username, password)? {
            Ok(())
        } else {
            Err(Error::InvalidCredentials)
        }
    }

    pub fn create_user(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() {
            return Err(Error::invalid_argument("username must not be empty"));
        }
        let _guard = self.create_lock.lock();
        if self.storage.get(username.as_bytes())?.is_some() {
            return Err(Error::UserAlreadyExists);
        }
        self.storage.put(username.as_bytes(), password.as_bytes())?;
        tracing::info!(username = %username, "Created user");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("backend", &self.storage.backend_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> AuthStore {
        AuthStore::with_storage(Arc::new(MemoryStorage::new(AUTH_STORE)))
    }

    #[test]
    fn duplicate_user_is_rejected() {
        let auth = store();
        auth.create_user("a", "p").unwrap();
        assert!(matches!(auth.create_user("a", "p2"), Err(Error::UserAlreadyExists)));
        assert!(auth.authenticate("a", "p").unwrap());
    }

    #[test]
    fn authenticate_compares_exact_bytes() {
        let auth = store();
        auth.create_user("a", "p").unwrap();
        assert!(!auth.authenticate("a", "wrong").unwrap());
        assert!(!auth.authenticate("a", "P").unwrap());
        assert!(!auth.authenticate("nobody", "p").unwrap());
    }

    #[test]
    fn require_maps_mismatch_to_invalid_credentials() {
        let auth = store();
        auth.create_user("a", "p").unwrap();
        assert!(auth.require("a", "p").is_ok());
        assert!(matches!(auth.require("a", "x"), Err(Error::InvalidCredentials)));
    }

    #[test]
    fn sqlite_store_persists_users() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::default();
        {
            let auth = AuthStore::open(&config, dir.path()).unwrap();
            auth.create_user("alice", "secret").unwrap();
            auth.close().unwrap();
        }
        let auth = AuthStore::open(&config, dir.path()).unwrap();
        assert!(auth.authenticate("alice", "secret").unwrap());
        assert!(dir.path().join("auth.db").exists());
    }
}
