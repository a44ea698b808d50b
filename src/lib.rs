#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

//! Liath: isolated key-value namespaces queried through sandboxed Lua
//! scripts.
//!
//! A query is a Lua snippet run against one namespace. Every registered
//! capability (`kv`, `vdb`, `embed`, `monitor`, optionally `llm`) is in scope
//! as a table of functions bound to that namespace:
//!
//! ```lua
//! kv.put("greeting", {text = "hello"})
//! monitor:increment("writes")
//! return kv.get("greeting")
//! ```
//!
//! Scripts against one namespace run one at a time; different namespaces
//! run concurrently. The returned value is marshaled into a [`HostValue`]
//! and optionally rendered as JSON, YAML or Markdown.

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod namespace;
pub mod plugins;
pub mod shell;
pub mod storage;
pub mod value;

pub use config::Config;
pub use db::Liath;
pub use engine::{OutputFormat, QueryOutput};
pub use error::{Error, Result};
pub use value::HostValue;
