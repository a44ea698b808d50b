//! Capability registry.
//!
//! Built once at startup from a static table of built-in factories plus any
//! capabilities registered explicitly, then shared read-only behind an `Arc`
//! for the lifetime of the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::embed::EmbedCapability;
use super::kv::KvCapability;
use super::llm::LlmCapability;
use super::monitor::MonitorCapability;
use super::traits::{Capability, CapabilityInfo};
use super::vector::VectorCapability;
use crate::config::PluginsConfig;
use crate::error::{Error, Result};

/// Builds a capability from settings. `None` means "not configured, skip".
type Factory = fn(&PluginsConfig) -> Result<Option<Arc<dyn Capability>>>;

/// Script global listing registered capability names.
pub const PLUGINS_GLOBAL: &str = "plugins";

const BUILTIN: &[(&str, Factory)] = &[
    ("kv", kv),
    ("vdb", vdb),
    ("embed", embed),
    ("monitor", monitor),
    ("llm", llm),
];

fn kv(_: &PluginsConfig) -> Result<Option<Arc<dyn Capability>>> {
    Ok(Some(Arc::new(KvCapability::new())))
}

fn vdb(config: &PluginsConfig) -> Result<Option<Arc<dyn Capability>>> {
    Ok(Some(Arc::new(VectorCapability::new(config.vdb.clone()))))
}

fn embed(config: &PluginsConfig) -> Result<Option<Arc<dyn Capability>>> {
    Ok(Some(Arc::new(EmbedCapability::new(config.embed.clone())?)))
}

fn monitor(_: &PluginsConfig) -> Result<Option<Arc<dyn Capability>>> {
    Ok(Some(Arc::new(MonitorCapability::new()?)))
}

fn llm(config: &PluginsConfig) -> Result<Option<Arc<dyn Capability>>> {
    if config.llm.endpoint.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Arc::new(LlmCapability::new(config.llm.clone()))))
}

/// Names of the built-in capabilities.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN.iter().map(|(name, _)| *name)
}

/// A capability name must be usable as a Lua identifier.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "capability name '{name}' is not a valid identifier"
        )));
    }
    if name == PLUGINS_GLOBAL {
        return Err(Error::Config(format!("capability name '{name}' is reserved")));
    }
    Ok(())
}

/// Registered capabilities keyed by capability name.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Capability>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate every enabled built-in capability.
    ///
    /// `llm` joins automatically once an endpoint is configured; listing it
    /// without one logs a warning and leaves it out.
    pub fn from_config(config: &PluginsConfig) -> Result<Self> {
        let mut names: Vec<&str> = config.enabled.iter().map(String::as_str).collect();
        if !config.llm.endpoint.trim().is_empty() && !config.is_enabled("llm") {
            names.push("llm");
        }

        let mut registry = Self::new();
        for name in names {
            let (_, factory) = BUILTIN
                .iter()
                .find(|(builtin, _)| *builtin == name)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "unknown capability '{name}', built-in capabilities: {}",
                        builtin_names().collect::<Vec<_>>().join(", ")
                    ))
                })?;

            match factory(config)? {
                Some(capability) => registry.register(capability)?,
                None => tracing::warn!(
                    capability = %name,
                    "Capability enabled but not configured, skipping"
                ),
            }
        }
        Ok(registry)
    }

    /// Add a capability. Names are unique; a collision is fatal.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        let name = capability.capability_name().to_string();
        validate_name(&name)?;
        if self.plugins.contains_key(&name) {
            return Err(Error::DuplicateCapability(name));
        }

        tracing::info!(
            capability = %name,
            functions = capability.function_names().len(),
            "Registered capability"
        );
        self.plugins.insert(name, capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.plugins.get(name).cloned()
    }

    /// Registered capability names, sorted.
    pub fn capability_names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Capability>)> {
        self.plugins.iter().map(|(name, cap)| (name.as_str(), cap))
    }

    pub fn info(&self) -> Vec<CapabilityInfo> {
        self.plugins.values().map(|cap| cap.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("capabilities", &self.plugins.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
