//! Key-value capability.
//!
//! Mirrors the storage contract one-to-one for scripts. Keys and values are
//! JSON-encoded, so anything a script can express as JSON round-trips through
//! `put`/`get`. Reads and writes go through the namespace's open transaction
//! when there is one.
//!
//! Contract violations (unknown column family, unsupported or missing
//! transaction) come back as `{status = "error", error = ..., message = ...}`
//! tables instead of aborting the script.

use std::sync::Arc;

use super::traits::{Args, Capability, FunctionTable, QueryContext};
use crate::error::{Error, Result};
use crate::storage::BatchOp;
use crate::value::HostValue;

const FUNCTIONS: &[&str] = &[
    "begin_transaction",
    "commit_transaction",
    "compact_range",
    "create_column_family",
    "delete",
    "delete_cf",
    "drop_column_family",
    "flush",
    "get",
    "get_cf",
    "iterator",
    "list_column_families",
    "put",
    "put_cf",
    "rollback_transaction",
    "write_batch",
];

/// Script access to the namespace's key-value store.
#[derive(Debug, Default)]
pub struct KvCapability;

impl KvCapability {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn encode(value: &HostValue) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a stored value. Bytes that are not JSON come back as a string.
pub(crate) fn decode(bytes: &[u8]) -> HostValue {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| HostValue::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Turn contract violations into structured results.
fn structured(result: Result<HostValue>) -> Result<HostValue> {
    match result {
        Err(e) if e.is_contract_violation() => {
            tracing::debug!(error = %e, "Storage contract violation returned to script");
            Ok(HostValue::error_result(&e))
        }
        other => other,
    }
}

fn key_arg(args: &Args, index: usize) -> Result<Vec<u8>> {
    match args.value(index) {
        HostValue::Absent => Err(Error::invalid_argument("'key' is required")),
        key => encode(key),
    }
}

fn opt_key_arg(args: &Args, index: usize) -> Result<Option<Vec<u8>>> {
    match args.value(index) {
        HostValue::Absent => Ok(None),
        key => encode(key).map(Some),
    }
}

/// Parse `{type = "put"|"delete", key = ..., value = ...}` entries.
fn batch_ops(value: &HostValue) -> Result<Vec<BatchOp>> {
    let entries: &[HostValue] = match value {
        HostValue::Sequence(items) => items,
        HostValue::Mapping(map) if map.is_empty() => &[],
        _ => return Err(Error::invalid_argument("'ops' must be a list of operations")),
    };

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let op = entry.get("type").and_then(HostValue::as_str).ok_or_else(|| {
                Error::invalid_argument(format!("operation {} has no 'type'", i + 1))
            })?;
            let key = match entry.get("key") {
                Some(key) if !key.is_absent() => encode(key)?,
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "operation {} has no 'key'",
                        i + 1
                    )))
                }
            };
            match op {
                "put" => {
                    let value = entry.get("value").cloned().unwrap_or_default();
                    Ok(BatchOp::Put {
                        key,
                        value: encode(&value)?,
                    })
                }
                "delete" => Ok(BatchOp::Delete { key }),
                other => Err(Error::invalid_argument(format!(
                    "operation {} has unknown type '{other}'",
                    i + 1
                ))),
            }
        })
        .collect()
}

impl Capability for KvCapability {
    fn capability_name(&self) -> &str {
        "kv"
    }

    fn description(&self) -> &str {
        "Key-value access to the namespace store"
    }

    fn function_names(&self) -> &'static [&'static str] {
        FUNCTIONS
    }

    fn initialize(&self, _ctx: &QueryContext) -> Result<()> {
        Ok(())
    }

    fn exposed_functions(&self, ctx: &QueryContext) -> FunctionTable {
        let ctx = Arc::new(ctx.clone());

        FunctionTable::new()
            .with("get", bind(&ctx, get))
            .with("put", bind(&ctx, put))
            .with("delete", bind(&ctx, delete))
            .with("iterator", bind(&ctx, iterator))
            .with("write_batch", bind(&ctx, write_batch))
            .with("begin_transaction", bind(&ctx, |ctx, _| structured(begin(ctx))))
            .with("commit_transaction", bind(&ctx, |ctx, _| structured(finish(ctx, true))))
            .with("rollback_transaction", bind(&ctx, |ctx, _| structured(finish(ctx, false))))
            .with("create_column_family", bind(&ctx, |ctx, args| {
                ctx.storage.create_column_family(&args.string(0, "name")?)?;
                Ok(HostValue::ok())
            }))
            .with("drop_column_family", bind(&ctx, |ctx, args| {
                structured(
                    ctx.storage
                        .drop_column_family(&args.string(0, "name")?)
                        .map(|()| HostValue::ok()),
                )
            }))
            .with("list_column_families", bind(&ctx, |ctx, _| {
                let names: Vec<String> = ctx.storage.list_column_families()?.into_iter().collect();
                Ok(HostValue::from(names))
            }))
            .with("get_cf", bind(&ctx, |ctx, args| {
                let cf = args.string(0, "cf")?;
                let key = key_arg(&args, 1)?;
                structured(
                    ctx.storage
                        .get_cf(&cf, &key)
                        .map(|v| v.map_or(HostValue::Absent, |b| decode(&b))),
                )
            }))
            .with("put_cf", bind(&ctx, |ctx, args| {
                let cf = args.string(0, "cf")?;
                let key = key_arg(&args, 1)?;
                let value = encode(args.value(2))?;
                structured(ctx.storage.put_cf(&cf, &key, &value).map(|()| HostValue::Absent))
            }))
            .with("delete_cf", bind(&ctx, |ctx, args| {
                let cf = args.string(0, "cf")?;
                let key = key_arg(&args, 1)?;
                structured(ctx.storage.delete_cf(&cf, &key).map(|()| HostValue::Absent))
            }))
            .with("compact_range", bind(&ctx, |ctx, args| {
                let begin = opt_key_arg(&args, 0)?;
                let end = opt_key_arg(&args, 1)?;
                ctx.storage.compact_range(begin.as_deref(), end.as_deref())?;
                Ok(HostValue::ok())
            }))
            .with("flush", bind(&ctx, |ctx, _| {
                ctx.storage.flush()?;
                Ok(HostValue::ok())
            }))
    }
}

type KvFn = fn(&QueryContext, Args) -> Result<HostValue>;

fn bind(
    ctx: &Arc<QueryContext>,
    f: KvFn,
) -> impl Fn(Args) -> Result<HostValue> + Send + Sync + 'static {
    let ctx = Arc::clone(ctx);
    move |args| f(&ctx, args)
}

fn get(ctx: &QueryContext, args: Args) -> Result<HostValue> {
    let key = key_arg(&args, 0)?;
    let raw = match ctx.transaction.lock().as_mut() {
        Some(txn) => txn.get(&key)?,
        None => ctx.storage.get(&key)?,
    };
    Ok(raw.map_or(HostValue::Absent, |bytes| decode(&bytes)))
}

fn put(ctx: &QueryContext, args: Args) -> Result<HostValue> {
    let key = key_arg(&args, 0)?;
    let value = encode(args.value(1))?;
    match ctx.transaction.lock().as_mut() {
        Some(txn) => txn.put(&key, &value)?,
        None => ctx.storage.put(&key, &value)?,
    }
    Ok(HostValue::Absent)
}

fn delete(ctx: &QueryContext, args: Args) -> Result<HostValue> {
    let key = key_arg(&args, 0)?;
    match ctx.transaction.lock().as_mut() {
        Some(txn) => txn.delete(&key)?,
        None => ctx.storage.delete(&key)?,
    }
    Ok(HostValue::Absent)
}

/// Every entry as a single-pair mapping, in key order.
///
/// Entries whose key is not JSON were written by another capability and are
/// skipped.
fn iterator(ctx: &QueryContext, _args: Args) -> Result<HostValue> {
    let mut entries = Vec::new();
    for pair in ctx.storage.iterate() {
        let (key, value) = pair?;
        let Ok(key) = serde_json::from_slice::<HostValue>(&key) else {
            continue;
        };
        let key = match key {
            HostValue::String(s) => s,
            other => other.display_inline(),
        };
        entries.push(HostValue::mapping([(key, decode(&value))]));
    }
    Ok(HostValue::Sequence(entries))
}

fn write_batch(ctx: &QueryContext, args: Args) -> Result<HostValue> {
    let ops = batch_ops(args.value(0))?;
    ctx.storage.write_batch(&ops)?;
    Ok(HostValue::ok())
}

fn begin(ctx: &QueryContext) -> Result<HostValue> {
    let mut slot = ctx.transaction.lock();
    if slot.is_some() {
        return Err(Error::TransactionAlreadyActive(ctx.namespace.clone()));
    }
    *slot = Some(ctx.storage.transaction()?);
    tracing::info!(namespace = %ctx.namespace, "Transaction started");
    Ok(HostValue::ok())
}

fn finish(ctx: &QueryContext, commit: bool) -> Result<HostValue> {
    let txn = ctx
        .transaction
        .lock()
        .take()
        .ok_or(Error::NoActiveTransaction)?;
    let outcome = if commit { txn.commit() } else { txn.rollback() };
    ctx.end_transaction();
    outcome?;
    if commit {
        tracing::info!(namespace = %ctx.namespace, "Transaction committed");
    } else {
        tracing::info!(namespace = %ctx.namespace, "Transaction rolled back");
    }
    Ok(HostValue::ok())
}
