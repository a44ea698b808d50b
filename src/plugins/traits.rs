//! Capability plugin contract.
//!
//! A capability is created once per process and shared by every namespace.
//! Call-scoped state never lives on the instance: the engine hands each call
//! a [`QueryContext`] and the capability binds its functions to it.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{Storage, Transaction};
use crate::value::HostValue;

/// Per-namespace slot for the single in-flight transaction.
pub type TransactionSlot = Arc<Mutex<Option<Box<dyn Transaction>>>>;

/// A script-callable function.
pub type CapabilityFn = Arc<dyn Fn(Args) -> Result<HostValue> + Send + Sync>;

/// Everything a capability may touch during one query.
#[derive(Clone)]
pub struct QueryContext {
    pub namespace: String,
    pub storage: Arc<dyn Storage>,
    pub packages: BTreeSet<String>,
    pub transaction: TransactionSlot,
    /// Bumped each time a transaction commits or rolls back.
    pub transaction_epoch: Arc<AtomicU64>,
}

impl QueryContext {
    /// A standalone context: no packages, no transaction history.
    pub fn new(namespace: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            namespace: namespace.into(),
            storage,
            packages: BTreeSet::new(),
            transaction: Arc::new(Mutex::new(None)),
            transaction_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of transactions ended on this namespace so far. Anything
    /// cached from storage under an older epoch may include rolled back
    /// writes.
    pub fn transaction_epoch(&self) -> u64 {
        self.transaction_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn end_transaction(&self) {
        self.transaction_epoch.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("namespace", &self.namespace)
            .field("backend", &self.storage.backend_name())
            .field("packages", &self.packages)
            .field("transaction_active", &self.transaction.lock().is_some())
            .finish()
    }
}

/// Functions a capability exposes for one call, keyed by function name.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<String, CapabilityFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function.
    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Args) -> Result<HostValue> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityFn> {
        self.functions.get(name)
    }

    /// Invoke a function directly, bypassing the script runtime.
    pub fn call(&self, name: &str, args: Vec<HostValue>) -> Result<HostValue> {
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| Error::invalid_argument(format!("unknown function '{name}'")))?;
        f(Args::new(args))
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CapabilityFn)> {
        self.functions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.functions.keys()).finish()
    }
}

/// Capability metadata for listings.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    pub functions: Vec<String>,
}

/// A named set of functions injected into every query.
pub trait Capability: Send + Sync {
    /// Script-visible name. Must be a Lua identifier and unique in the registry.
    fn capability_name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Names of the functions `exposed_functions` returns.
    fn function_names(&self) -> &'static [&'static str];

    /// Prepare for one call. An error fails the whole query with
    /// `PluginInitialization`.
    fn initialize(&self, ctx: &QueryContext) -> Result<()>;

    /// Functions bound to `ctx` for the duration of one call.
    fn exposed_functions(&self, ctx: &QueryContext) -> FunctionTable;

    fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            name: self.capability_name().to_string(),
            description: self.description().to_string(),
            functions: self.function_names().iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Positional arguments passed from a script.
#[derive(Debug, Clone, Default)]
pub struct Args(Vec<HostValue>);

impl Args {
    pub fn new(values: Vec<HostValue>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Argument at `index`, absent when missing.
    pub fn value(&self, index: usize) -> &HostValue {
        const ABSENT: &HostValue = &HostValue::Absent;
        self.0.get(index).unwrap_or(ABSENT)
    }

    pub fn string(&self, index: usize, name: &str) -> Result<String> {
        match self.value(index) {
            HostValue::String(s) => Ok(s.clone()),
            other => Err(Error::invalid_argument(format!(
                "'{name}' must be a string, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn opt_string(&self, index: usize, name: &str) -> Result<Option<String>> {
        match self.value(index) {
            HostValue::Absent => Ok(None),
            _ => self.string(index, name).map(Some),
        }
    }

    pub fn integer(&self, index: usize, name: &str) -> Result<i64> {
        self.value(index).as_i64().ok_or_else(|| {
            Error::invalid_argument(format!("'{name}' must be an integer"))
        })
    }

    pub fn opt_integer(&self, index: usize, name: &str) -> Result<Option<i64>> {
        match self.value(index) {
            HostValue::Absent => Ok(None),
            _ => self.integer(index, name).map(Some),
        }
    }

    /// String or number, rendered as a string key.
    pub fn key(&self, index: usize, name: &str) -> Result<String> {
        match self.value(index) {
            HostValue::String(s) => Ok(s.clone()),
            HostValue::Integer(i) => Ok(i.to_string()),
            other => Err(Error::invalid_argument(format!(
                "'{name}' must be a string or integer, got {}",
                other.type_name()
            ))),
        }
    }

    /// A sequence of numbers.
    pub fn vector(&self, index: usize, name: &str) -> Result<Vec<f32>> {
        let items = self.value(index).as_sequence().ok_or_else(|| {
            Error::invalid_argument(format!("'{name}' must be a list of numbers"))
        })?;
        items
            .iter()
            .map(|item| {
                item.as_f64().map(|f| f as f32).ok_or_else(|| {
                    Error::invalid_argument(format!("'{name}' must contain only numbers"))
                })
            })
            .collect()
    }
}
