//! Capability plugins injected into every query.
//!
//! Each capability is one process-lifetime instance implementing
//! [`Capability`]. Per call, the engine hands it a [`QueryContext`] for the
//! target namespace and injects the returned [`FunctionTable`] into the
//! script runtime under the capability's name.
//!
//! # Example Configuration
//!
//! ```toml
//! [plugins]
//! enabled = ["kv", "vdb", "embed", "monitor"]
//! dir = "plugins"          # <capability>.toml overrides, e.g. plugins/vdb.toml
//!
//! [plugins.vdb]
//! dimension = 384
//! metric = "cosine"
//!
//! [plugins.llm]
//! endpoint = "http://localhost:8080/v1"   # registers `llm`
//! model = "default"
//! ```

pub mod embed;
pub mod kv;
pub mod llm;
pub mod monitor;
pub mod registry;
pub mod traits;
pub mod vector;

pub use embed::EmbedCapability;
pub use kv::KvCapability;
pub use llm::LlmCapability;
pub use monitor::MonitorCapability;
pub use registry::PluginRegistry;
pub use traits::{
    Args, Capability, CapabilityFn, CapabilityInfo, FunctionTable, QueryContext, TransactionSlot,
};
pub use vector::VectorCapability;
