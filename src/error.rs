//! Error taxonomy shared by the storage, namespace, plugin and engine layers.
//!
//! Front-ends turn any of these into `{status: "error", message}` bodies;
//! scripts see contract violations as `{status, error, message}` tables keyed
//! by [`Error::kind`].

use thiserror::Error;

/// Main error type for liath.
#[derive(Error, Debug)]
pub enum Error {
    #[error("namespace '{0}' does not exist")]
    NamespaceNotFound(String),

    #[error("invalid namespace name '{0}': use letters, digits, '_' or '-'")]
    InvalidNamespaceName(String),

    #[error("column family '{0}' not found")]
    ColumnFamilyNotFound(String),

    #[error("storage backend '{0}' does not support transactions")]
    TransactionUnsupported(String),

    #[error("no active transaction")]
    NoActiveTransaction,

    /// `begin` while a transaction is already open for the namespace.
    #[error("a transaction is already active for namespace '{0}'")]
    TransactionAlreadyActive(String),

    #[error("storage '{0}' is closed")]
    StorageClosed(String),

    #[error("user already exists")]
    UserAlreadyExists,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("script execution failed: {0}")]
    ScriptExecution(String),

    #[error("script exceeded its execution deadline of {0} ms")]
    ScriptTimeout(u64),

    #[error("unsupported return format: {0}")]
    UnsupportedFormat(String),

    #[error("plugin '{capability}' failed to initialize: {message}")]
    PluginInitialization { capability: String, message: String },

    #[error("capability '{0}' is registered more than once")]
    DuplicateCapability(String),

    /// Bad arguments passed from a script into a capability function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    General(String),
}

/// Result type alias for liath operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable snake_case identifier, used in structured error results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NamespaceNotFound(_) => "namespace_not_found",
            Self::InvalidNamespaceName(_) => "invalid_namespace_name",
            Self::ColumnFamilyNotFound(_) => "column_family_not_found",
            Self::TransactionUnsupported(_) => "transaction_unsupported",
            Self::NoActiveTransaction => "no_active_transaction",
            Self::TransactionAlreadyActive(_) => "transaction_already_active",
            Self::StorageClosed(_) => "storage_closed",
            Self::UserAlreadyExists => "user_already_exists",
            Self::InvalidCredentials => "invalid_credentials",
            Self::ScriptExecution(_) => "script_execution_error",
            Self::ScriptTimeout(_) => "script_timeout",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::PluginInitialization { .. } => "plugin_initialization_error",
            Self::DuplicateCapability(_) => "duplicate_capability",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Config(_) => "config_error",
            Self::Sqlite(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::General(_) => "error",
        }
    }

    /// Storage-contract violations a script can recover from.
    ///
    /// Capabilities hand these back as structured results instead of
    /// aborting the whole script.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::ColumnFamilyNotFound(_)
                | Self::TransactionUnsupported(_)
                | Self::NoActiveTransaction
                | Self::TransactionAlreadyActive(_)
        )
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }
}
