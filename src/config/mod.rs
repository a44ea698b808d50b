//! Configuration for liath.
//!
//! Loaded from `liath.toml`. Every section defaults, so an empty file (or no
//! file at all) yields a working sqlite-backed setup under `./data`.
//!
//! ```toml
//! data_dir = "data"
//!
//! [storage]
//! backend = "sqlite"
//!
//! [engine]
//! timeout_ms = 30000
//!
//! [plugins]
//! enabled = ["kv", "vdb", "embed", "monitor"]
//! dir = "plugins"
//!
//! [plugins.vdb]
//! dimension = 384
//! metric = "cosine"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "LIATH_CONFIG";

const CONFIG_FILE_NAME: &str = "liath.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for namespace stores, the auth store and metadata.
    pub data_dir: PathBuf,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub plugins: PluginsConfig,
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_level: "info".into(),
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            plugins: PluginsConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Resolution order: explicit path, `LIATH_CONFIG`, the platform config
    /// directory, then built-in defaults. An explicit path that does not
    /// exist is an error; the implicit locations are optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "liath") {
            let candidate = dirs.config_dir().join(CONFIG_FILE_NAME);
            if candidate.exists() {
                return Self::from_file(&candidate);
            }
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Self::from_file(&local);
        }

        tracing::debug!("No config file found, using defaults");
        let mut config = Self::default();
        config.plugins.apply_settings_dir(Path::new("."))?;
        Ok(config)
    }

    /// Parse a config file and apply the plugin settings directory relative
    /// to the file's location.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml(&raw)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.plugins.apply_settings_dir(base)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Location of the persisted namespace metadata snapshot.
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata.json")
    }
}

/// Which storage engine backs namespaces and the auth store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Sqlite,
    Memory,
}

impl std::fmt::Display for StorageBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => f.write_str("sqlite"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// SQLite `journal_mode` pragma value.
    pub journal_mode: String,
    /// SQLite busy timeout; protects against a second process holding the file.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Sqlite,
            journal_mode: "wal".into(),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock deadline per script, in milliseconds. 0 disables it.
    pub timeout_ms: u64,
    /// Number of VM instructions between deadline checks.
    pub instruction_budget: u32,
    /// Lua heap limit in bytes. 0 means unlimited.
    pub memory_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            instruction_budget: 10_000,
            memory_limit_bytes: 0,
        }
    }
}

/// Capability plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Capability names to register at startup.
    pub enabled: Vec<String>,
    /// Directory holding `<capability>.toml` settings overrides.
    pub dir: PathBuf,
    pub vdb: VectorConfig,
    pub embed: EmbedConfig,
    pub llm: LlmConfig,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["kv".into(), "vdb".into(), "embed".into(), "monitor".into()],
            dir: PathBuf::from("plugins"),
            vdb: VectorConfig::default(),
            embed: EmbedConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl PluginsConfig {
    /// Whether a capability is in the `enabled` list.
    pub fn is_enabled(&self, capability: &str) -> bool {
        self.enabled.iter().any(|name| name == capability)
    }

    /// Scan the settings directory and merge `<capability>.toml` files.
    ///
    /// Keys in a settings file replace the same keys from `liath.toml`; keys
    /// it leaves out keep their current value. A missing directory is fine. Files for capabilities without settings
    /// are logged and skipped.
    pub fn apply_settings_dir(&mut self, base: &Path) -> Result<()> {
        let dir = if self.dir.is_absolute() {
            self.dir.clone()
        } else {
            base.join(&self.dir)
        };
        if !dir.is_dir() {
            return Ok(());
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        entries.sort();

        for path in entries {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path)?;
            let settings_err = |e: String| Error::Config(format!("{}: {e}", path.display()));
            match stem {
                "vdb" => self.vdb = overlay(&self.vdb, &raw).map_err(settings_err)?,
                "embed" => self.embed = overlay(&self.embed, &raw).map_err(settings_err)?,
                "llm" => self.llm = overlay(&self.llm, &raw).map_err(settings_err)?,
                other => {
                    tracing::warn!(
                        capability = %other,
                        path = %path.display(),
                        "Ignoring settings file for capability without settings"
                    );
                    continue;
                }
            }
            tracing::debug!(capability = %stem, path = %path.display(), "Applied plugin settings");
        }
        Ok(())
    }
}

/// Apply the keys of a TOML document on top of an existing section.
fn overlay<T>(current: &T, raw: &str) -> std::result::Result<T, String>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut merged = toml::Table::try_from(current).map_err(|e| e.to_string())?;
    let changes: toml::Table = toml::from_str(raw).map_err(|e| e.to_string())?;
    merge_tables(&mut merged, changes);
    merged.try_into().map_err(|e| e.to_string())
}

fn merge_tables(base: &mut toml::Table, changes: toml::Table) {
    for (key, value) in changes {
        if let (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) =
            (base.get_mut(&key), &value)
        {
            merge_tables(existing, nested.clone());
            continue;
        }
        base.insert(key, value);
    }
}

/// Similarity metric for the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub dimension: usize,
    pub metric: DistanceMetric,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: DistanceMetric::Cosine,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    pub dimension: usize,
    pub default_model: String,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            default_model: "hash-words".into(),
        }
    }
}

/// OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL, e.g. `http://localhost:11434/v1`. Empty means unconfigured.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "default".into(),
            api_key: None,
            max_tokens: 100,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    /// Whole-request deadline, on top of the script deadline.
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            body_limit_bytes: 1024 * 1024,
            request_timeout_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.storage.backend, StorageBackendKind::Sqlite);
        assert_eq!(config.engine.timeout_ms, 30_000);
        assert!(config.plugins.is_enabled("kv"));
        assert!(!config.plugins.is_enabled("llm"));
    }

    #[test]
    fn parses_sections() {
        let raw = r#"
            data_dir = "/var/lib/liath"

            [storage]
            backend = "memory"

            [plugins]
            enabled = ["kv", "monitor"]

            [plugins.vdb]
            dimension = 3
            metric = "euclidean"
        "#;
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.plugins.enabled, vec!["kv", "monitor"]);
        assert_eq!(config.plugins.vdb.dimension, 3);
        assert_eq!(config.plugins.vdb.metric, DistanceMetric::Euclidean);
        assert_eq!(config.metadata_path(), PathBuf::from("/var/lib/liath/metadata.json"));
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = Config::from_toml("[storage]\nbackend = \"leveldb\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn settings_dir_overrides_capability_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::write(plugins.join("vdb.toml"), "dimension = 8\n").unwrap();
        std::fs::write(plugins.join("kv.toml"), "ignored = true\n").unwrap();

        let mut config = PluginsConfig::default();
        config.apply_settings_dir(tmp.path()).unwrap();
        assert_eq!(config.vdb.dimension, 8);
        assert_eq!(config.embed.dimension, 384);
    }

    #[test]
    fn settings_files_merge_with_inline_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::write(plugins.join("vdb.toml"), "dimension = 8\n").unwrap();
        std::fs::write(plugins.join("llm.toml"), "model = \"small\"\n").unwrap();
        let config_path = tmp.path().join("liath.toml");
        std::fs::write(
            &config_path,
            r#"
            [plugins.vdb]
            metric = "euclidean"

            [plugins.llm]
            endpoint = "http://localhost:8080/v1"
            api_key = "secret"
            "#,
        )
        .unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.plugins.vdb.dimension, 8);
        assert_eq!(config.plugins.vdb.metric, DistanceMetric::Euclidean);
        assert_eq!(config.plugins.llm.model, "small");
        assert_eq!(config.plugins.llm.endpoint, "http://localhost:8080/v1");
        assert_eq!(config.plugins.llm.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn malformed_settings_file_names_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::write(plugins.join("embed.toml"), "dimension = \"wide\"\n").unwrap();

        let mut config = PluginsConfig::default();
        let err = config.apply_settings_dir(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("embed.toml")));
    }

    #[test]
    fn missing_settings_dir_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = PluginsConfig::default();
        config.apply_settings_dir(tmp.path()).unwrap();
    }
}
