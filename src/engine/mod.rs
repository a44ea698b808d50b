//! Query engine.
//!
//! `execute` resolves the namespace, holds its exclusion lock for the whole
//! call, prepares every registered capability against a fresh
//! [`QueryContext`], runs the script in a new [`Sandbox`] and marshals the
//! result into the requested [`OutputFormat`].

pub mod format;
pub mod marshal;
pub mod sandbox;

pub use format::{render, to_markdown, OutputFormat};
pub use sandbox::Sandbox;

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::namespace::NamespaceRegistry;
use crate::plugins::PluginRegistry;
use crate::value::HostValue;

/// Result of one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutput {
    pub value: HostValue,
    /// Serialized form; `None` for [`OutputFormat::Dict`].
    pub rendered: Option<String>,
}

impl QueryOutput {
    /// The rendered text when there is one, otherwise compact JSON.
    pub fn to_text(&self) -> Result<String> {
        match &self.rendered {
            Some(text) => Ok(text.clone()),
            None => Ok(serde_json::to_string(&self.value)?),
        }
    }
}

/// Executes scripts against namespaces.
pub struct QueryEngine {
    namespaces: Arc<NamespaceRegistry>,
    plugins: Arc<PluginRegistry>,
    sandbox: Sandbox,
}

impl QueryEngine {
    pub fn new(
        namespaces: Arc<NamespaceRegistry>,
        plugins: Arc<PluginRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            namespaces,
            plugins,
            sandbox: Sandbox::new(config),
        }
    }

    pub fn execute(&self, namespace: &str, query: &str, format: OutputFormat) -> Result<QueryOutput> {
        let started = Instant::now();
        let ns = self.namespaces.get(namespace)?;

        let _guard = ns.lock();
        let ctx = ns.context();

        let mut surfaces = Vec::with_capacity(self.plugins.len());
        for (name, capability) in self.plugins.iter() {
            capability.initialize(&ctx).map_err(|e| {
                tracing::warn!(namespace = %namespace, capability = %name, error = %e, "Capability failed to initialize");
                Error::PluginInitialization {
                    capability: name.to_string(),
                    message: e.to_string(),
                }
            })?;
            surfaces.push((name.to_string(), capability.exposed_functions(&ctx)));
        }

        let value = match self.sandbox.run(namespace, &surfaces, query) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    namespace = %namespace,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Query failed"
                );
                return Err(e);
            }
        };
        let rendered = render(&value, format)?;

        tracing::debug!(
            namespace = %namespace,
            format = %format,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query executed"
        );
        Ok(QueryOutput { value, rendered })
    }

    pub fn namespaces(&self) -> &Arc<NamespaceRegistry> {
        &self.namespaces
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("namespaces", &self.namespaces.list_namespaces())
            .field("capabilities", &self.plugins.capability_names())
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginsConfig, StorageBackendKind, StorageConfig};
    use crate::plugins::{Capability, FunctionTable, QueryContext};
    use tempfile::TempDir;

    fn engine(dir: &TempDir, plugins: PluginRegistry) -> QueryEngine {
        let storage = StorageConfig {
            backend: StorageBackendKind::Memory,
            ..StorageConfig::default()
        };
        let namespaces =
            NamespaceRegistry::open(dir.path(), &storage, &dir.path().join("metadata.json"))
                .unwrap();
        QueryEngine::new(Arc::new(namespaces), Arc::new(plugins), EngineConfig::default())
    }

    struct Broken;

    impl Capability for Broken {
        fn capability_name(&self) -> &str {
            "broken"
        }

        fn function_names(&self) -> &'static [&'static str] {
            &[]
        }

        fn initialize(&self, _ctx: &QueryContext) -> Result<()> {
            Err(Error::Config("model file missing".into()))
        }

        fn exposed_functions(&self, _ctx: &QueryContext) -> FunctionTable {
            FunctionTable::new()
        }
    }

    #[test]
    fn executes_against_default_namespace() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, PluginRegistry::from_config(&PluginsConfig::default()).unwrap());
        let out = engine
            .execute("default", "kv.put('a', {n = 1}); return kv.get('a')", OutputFormat::Json)
            .unwrap();
        assert_eq!(out.value, HostValue::mapping([("n", HostValue::Integer(1))]));
        assert_eq!(out.rendered.as_deref(), Some(r#"{"n":1}"#));
    }

    #[test]
    fn unknown_namespace_fails_before_running() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, PluginRegistry::new());
        assert!(matches!(
            engine.execute("missing", "return 1", OutputFormat::Dict),
            Err(Error::NamespaceNotFound(_))
        ));
    }

    #[test]
    fn failing_initialize_fails_the_call() {
        let dir = TempDir::new().unwrap();
        let mut plugins = PluginRegistry::new();
        plugins.register(Arc::new(Broken)).unwrap();
        let engine = engine(&dir, plugins);
        let err = engine.execute("default", "return 1", OutputFormat::Dict).unwrap_err();
        assert!(matches!(
            err,
            Error::PluginInitialization { ref capability, .. } if capability == "broken"
        ));
    }

    #[test]
    fn lock_is_released_after_script_error() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, PluginRegistry::new());
        assert!(engine.execute("default", "error('boom')", OutputFormat::Dict).is_err());
        let out = engine.execute("default", "return 2", OutputFormat::Dict).unwrap();
        assert_eq!(out.value, HostValue::Integer(2));
        assert_eq!(out.rendered, None);
    }

    #[test]
    fn markdown_output() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, PluginRegistry::new());
        let out = engine
            .execute("default", "return {status = 'ok'}", OutputFormat::Markdown)
            .unwrap();
        assert_eq!(out.rendered.as_deref(), Some("- **status**: ok\n"));
    }
}
