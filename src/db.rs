//! The `Liath` handle: everything a front-end needs behind one type.

use std::sync::Arc;

use crate::auth::AuthStore;
use crate::config::Config;
use crate::engine::{OutputFormat, QueryEngine, QueryOutput};
use crate::error::Result;
use crate::namespace::{Namespace, NamespaceRegistry};
use crate::plugins::{CapabilityInfo, PluginRegistry};

pub struct Liath {
    config: Config,
    namespaces: Arc<NamespaceRegistry>,
    plugins: Arc<PluginRegistry>,
    engine: QueryEngine,
    auth: AuthStore,
}

impl Liath {
    /// Open with the built-in capabilities enabled in `config`.
    pub fn open(config: Config) -> Result<Self> {
        let plugins = PluginRegistry::from_config(&config.plugins)?;
        Self::open_with_plugins(config, plugins)
    }

    /// Open with a prepared plugin registry, e.g. one with extra
    /// capabilities registered.
    pub fn open_with_plugins(config: Config, plugins: PluginRegistry) -> Result<Self> {
        let namespaces = Arc::new(NamespaceRegistry::open(
            &config.data_dir,
            &config.storage,
            &config.metadata_path(),
        )?);
        let auth = AuthStore::open(&config.storage, &config.data_dir)?;
        let plugins = Arc::new(plugins);
        let engine = QueryEngine::new(
            Arc::clone(&namespaces),
            Arc::clone(&plugins),
            config.engine.clone(),
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            backend = %config.storage.backend,
            namespaces = namespaces.list_namespaces().len(),
            capabilities = plugins.len(),
            "Liath ready"
        );
        Ok(Self {
            config,
            namespaces,
            plugins,
            engine,
            auth,
        })
    }

    /// Run `query` in `namespace`. `format` is one of `dict`, `json`,
    /// `yaml`, `markdown`; it is checked before the script runs.
    pub fn execute(&self, namespace: &str, query: &str, format: &str) -> Result<QueryOutput> {
        let format: OutputFormat = format.parse()?;
        self.engine.execute(namespace, query, format)
    }

    pub fn execute_with(
        &self,
        namespace: &str,
        query: &str,
        format: OutputFormat,
    ) -> Result<QueryOutput> {
        self.engine.execute(namespace, query, format)
    }

    pub fn create_namespace(&self, name: &str, packages: &[String]) -> Result<Arc<Namespace>> {
        self.namespaces.create_namespace(name, packages.iter().cloned())
    }

    pub fn list_namespaces(&self) -> Vec<String> {
        self.namespaces.list_namespaces()
    }

    pub fn install_package(&self, namespace: &str, package: &str) -> Result<bool> {
        self.namespaces.install_package(namespace, package)
    }

    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        self.namespaces.drop_namespace(name)
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        self.auth.authenticate(username, password)
    }

    pub fn create_user(&self, username: &str, password: &str) -> Result<()> {
        self.auth.create_user(username, password)
    }

    pub fn require_user(&self, username: &str, password: &str) -> Result<()> {
        self.auth.require(username, password)
    }

    pub fn capabilities(&self) -> Vec<CapabilityInfo> {
        self.plugins.info()
    }

    pub fn namespaces(&self) -> &Arc<NamespaceRegistry> {
        &self.namespaces
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close every namespace store and the auth store.
    pub fn close(&self) -> Result<()> {
        let namespaces = self.namespaces.close_all();
        let auth = self.auth.close();
        namespaces.and(auth)
    }
}

impl std::fmt::Debug for Liath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Liath")
            .field("data_dir", &self.config.data_dir)
            .field("engine", &self.engine)
            .field("auth", &self.auth)
            .finish()
    }
}
