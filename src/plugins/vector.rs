//! Vector index capability.
//!
//! A flat, fixed-dimension similarity index per namespace. The whole index is
//! re-serialized into the namespace store after every mutation, so a crash
//! never loses an acknowledged write; the price is I/O proportional to the
//! index size on each `add`, `remove` and `clear`.
//!
//! The capability instance is shared by all namespaces. Loaded indexes are
//! cached per namespace and tagged with the storage handle they came from and
//! the namespace's transaction epoch. A dropped and re-created namespace, or
//! a commit or rollback, forces a reload from storage.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use super::traits::{Args, Capability, FunctionTable, QueryContext};
use crate::config::{DistanceMetric, VectorConfig};
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::value::HostValue;

const FUNCTIONS: &[&str] = &["add", "clear", "count", "remove", "search"];

/// Storage key holding the serialized index for `namespace`.
///
/// Not valid JSON, so it never collides with keys written by `kv`.
pub fn index_key(namespace: &str) -> Vec<u8> {
    format!("__vdb__:{namespace}").into_bytes()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    entries: BTreeMap<String, Vec<f32>>,
}

impl FlatIndex {
    fn new(config: &VectorConfig) -> Self {
        Self {
            dimension: config.dimension,
            metric: config.metric,
            entries: BTreeMap::new(),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() == self.dimension {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )))
        }
    }

    /// Best `k` matches. Cosine scores sort descending, euclidean distances
    /// ascending.
    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .entries
            .iter()
            .map(|(key, vector)| {
                let score = match self.metric {
                    DistanceMetric::Cosine => cosine_similarity(query, vector),
                    DistanceMetric::Euclidean => euclidean_distance(query, vector),
                };
                (key.clone(), score)
            })
            .collect();

        match self.metric {
            DistanceMetric::Cosine => scored.sort_by(|a, b| b.1.total_cmp(&a.1)),
            DistanceMetric::Euclidean => scored.sort_by(|a, b| a.1.total_cmp(&b.1)),
        }
        scored.truncate(k);
        scored
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

struct CachedIndex {
    /// The store the index was loaded from. Holding the allocation keeps a
    /// re-created namespace from ever matching a dropped one.
    storage: Weak<dyn Storage>,
    epoch: u64,
    index: Arc<Mutex<FlatIndex>>,
}

impl CachedIndex {
    fn is_current(&self, ctx: &QueryContext) -> bool {
        self.epoch == ctx.transaction_epoch()
            && Weak::ptr_eq(&self.storage, &Arc::downgrade(&ctx.storage))
    }
}

/// Loaded indexes, one per namespace.
struct IndexCache {
    config: VectorConfig,
    entries: RwLock<HashMap<String, CachedIndex>>,
}

impl IndexCache {
    fn load(&self, storage: &dyn Storage, namespace: &str) -> Result<FlatIndex> {
        let Some(bytes) = storage.get(&index_key(namespace))? else {
            return Ok(FlatIndex::new(&self.config));
        };
        let index: FlatIndex = serde_json::from_slice(&bytes)?;
        if index.dimension != self.config.dimension {
            return Err(Error::Config(format!(
                "stored index for '{namespace}' has dimension {}, configured {}",
                index.dimension, self.config.dimension
            )));
        }
        tracing::debug!(
            namespace = %namespace,
            vectors = index.entries.len(),
            "Loaded vector index"
        );
        Ok(index)
    }

    /// The index for `ctx`, reloaded from storage when the store changed or a
    /// transaction ended since it was cached.
    fn index_for(&self, ctx: &QueryContext) -> Result<Arc<Mutex<FlatIndex>>> {
        if let Some(cached) = self.entries.read().get(&ctx.namespace) {
            if cached.is_current(ctx) {
                return Ok(Arc::clone(&cached.index));
            }
        }

        let epoch = ctx.transaction_epoch();
        let index = Arc::new(Mutex::new(self.load(ctx.storage.as_ref(), &ctx.namespace)?));
        let mut entries = self.entries.write();
        entries.retain(|_, cached| cached.storage.strong_count() > 0);
        entries.insert(
            ctx.namespace.clone(),
            CachedIndex {
                storage: Arc::downgrade(&ctx.storage),
                epoch,
                index: Arc::clone(&index),
            },
        );
        Ok(index)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Similarity search over vectors stored in the namespace.
pub struct VectorCapability {
    cache: Arc<IndexCache>,
}

impl VectorCapability {
    pub fn new(config: VectorConfig) -> Self {
        Self {
            cache: Arc::new(IndexCache {
                config,
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// Write the full index back to storage.
fn persist(storage: &dyn Storage, namespace: &str, index: &FlatIndex) -> Result<()> {
    let bytes = serde_json::to_vec(index)?;
    storage.put(&index_key(namespace), &bytes)
}

struct Bound {
    cache: Arc<IndexCache>,
    ctx: QueryContext,
}

impl Bound {
    fn index(&self) -> Result<Arc<Mutex<FlatIndex>>> {
        self.cache.index_for(&self.ctx)
    }

    /// Apply `f` to a copy, persist it, and only then make it visible.
    fn mutate<T>(&self, f: impl FnOnce(&mut FlatIndex) -> Result<T>) -> Result<T> {
        let index = self.index()?;
        let mut index = index.lock();
        let mut next = index.clone();
        let out = f(&mut next)?;
        persist(self.ctx.storage.as_ref(), &self.ctx.namespace, &next)?;
        *index = next;
        Ok(out)
    }

    fn add(&self, args: Args) -> Result<HostValue> {
        let key = args.key(0, "key")?;
        let vector = args.vector(1, "vector")?;
        self.mutate(|index| {
            index.check_dimension(&vector)?;
            index.entries.insert(key, vector);
            Ok(HostValue::Absent)
        })
    }

    fn search(&self, args: Args) -> Result<HostValue> {
        let vector = args.vector(0, "vector")?;
        let k = args.opt_integer(1, "k")?.unwrap_or(10).max(0) as usize;
        let index = self.index()?;
        let index = index.lock();
        index.check_dimension(&vector)?;
        let hits = index
            .search(&vector, k)
            .into_iter()
            .map(|(key, score)| {
                HostValue::mapping([("key", HostValue::from(key)), ("score", HostValue::from(score))])
            })
            .collect();
        Ok(HostValue::Sequence(hits))
    }

    fn remove(&self, args: Args) -> Result<HostValue> {
        let key = args.key(0, "key")?;
        self.mutate(|index| Ok(HostValue::from(index.entries.remove(&key).is_some())))
    }

    fn count(&self) -> Result<HostValue> {
        Ok(HostValue::from(self.index()?.lock().entries.len()))
    }

    fn clear(&self) -> Result<HostValue> {
        self.mutate(|index| {
            index.entries.clear();
            Ok(HostValue::Absent)
        })
    }
}

impl Capability for VectorCapability {
    fn capability_name(&self) -> &str {
        "vdb"
    }

    fn description(&self) -> &str {
        "Fixed-dimension vector similarity index"
    }

    fn function_names(&self) -> &'static [&'static str] {
        FUNCTIONS
    }

    fn initialize(&self, ctx: &QueryContext) -> Result<()> {
        self.cache.index_for(ctx).map(|_| ())
    }

    fn exposed_functions(&self, ctx: &QueryContext) -> FunctionTable {
        let bound = Arc::new(Bound {
            cache: Arc::clone(&self.cache),
            ctx: ctx.clone(),
        });

        let (add, search, remove, count, clear) = (
            Arc::clone(&bound),
            Arc::clone(&bound),
            Arc::clone(&bound),
            Arc::clone(&bound),
            bound,
        );
        FunctionTable::new()
            .with("add", move |args| add.add(args))
            .with("search", move |args| search.search(args))
            .with("remove", move |args| remove.remove(args))
            .with("count", move |_| count.count())
            .with("clear", move |_| clear.clear())
    }
}

impl std::fmt::Debug for VectorCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorCapability")
            .field("dimension", &self.cache.config.dimension)
            .field("metric", &self.cache.config.metric)
            .field("cached_namespaces", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn config(dimension: usize) -> VectorConfig {
        VectorConfig {
            dimension,
            metric: DistanceMetric::Cosine,
        }
    }

    fn context(namespace: &str, storage: Arc<dyn Storage>) -> QueryContext {
        QueryContext::new(namespace, storage)
    }

    fn vector(values: &[f64]) -> HostValue {
        HostValue::from(values.to_vec())
    }

    fn prepared(vdb: &VectorCapability, ctx: &QueryContext) -> FunctionTable {
        vdb.initialize(ctx).unwrap();
        vdb.exposed_functions(ctx)
    }

    #[test]
    fn search_ranks_by_cosine_similarity() {
        let vdb = VectorCapability::new(config(3));
        let ctx = context("ns", Arc::new(MemoryStorage::new("ns")));
        let f = prepared(&vdb, &ctx);
        f.call("add", vec![HostValue::from("x"), vector(&[1.0, 0.0, 0.0])]).unwrap();
        f.call("add", vec![HostValue::from("y"), vector(&[0.0, 1.0, 0.0])]).unwrap();
        f.call("add", vec![HostValue::Integer(7), vector(&[0.9, 0.1, 0.0])]).unwrap();

        let hits = f.call("search", vec![vector(&[1.0, 0.0, 0.0]), HostValue::Integer(2)]).unwrap();
        let keys: Vec<_> = hits
            .as_sequence()
            .unwrap()
            .iter()
            .map(|hit| hit.get("key").unwrap().clone())
            .collect();
        assert_eq!(keys, vec![HostValue::from("x"), HostValue::from("7")]);
        assert_eq!(f.call("count", vec![]).unwrap(), HostValue::Integer(3));
    }

    #[test]
    fn euclidean_metric_sorts_by_distance() {
        let vdb = VectorCapability::new(VectorConfig {
            dimension: 2,
            metric: DistanceMetric::Euclidean,
        });
        let ctx = context("ns", Arc::new(MemoryStorage::new("ns")));
        let f = prepared(&vdb, &ctx);
        f.call("add", vec![HostValue::from("far"), vector(&[10.0, 10.0])]).unwrap();
        f.call("add", vec![HostValue::from("near"), vector(&[1.0, 1.0])]).unwrap();
        let hits = f.call("search", vec![vector(&[0.0, 0.0])]).unwrap();
        assert_eq!(
            hits.as_sequence().unwrap()[0].get("key"),
            Some(&HostValue::from("near"))
        );
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let vdb = VectorCapability::new(config(3));
        let ctx = context("ns", Arc::new(MemoryStorage::new("ns")));
        let f = prepared(&vdb, &ctx);
        let err = f.call("add", vec![HostValue::from("x"), vector(&[1.0])]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn every_mutation_is_persisted() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("ns"));
        let vdb = VectorCapability::new(config(2));
        let ctx = context("ns", Arc::clone(&storage));
        let f = prepared(&vdb, &ctx);
        f.call("add", vec![HostValue::from("a"), vector(&[1.0, 0.0])]).unwrap();

        // A fresh instance reloads from storage.
        let reloaded = VectorCapability::new(config(2));
        let f2 = prepared(&reloaded, &ctx);
        assert_eq!(f2.call("count", vec![]).unwrap(), HostValue::Integer(1));

        assert_eq!(
            f.call("remove", vec![HostValue::from("a")]).unwrap(),
            HostValue::Boolean(true)
        );
        let reloaded = VectorCapability::new(config(2));
        let f3 = prepared(&reloaded, &ctx);
        assert_eq!(f3.call("count", vec![]).unwrap(), HostValue::Integer(0));
    }

    #[test]
    fn namespaces_do_not_share_indexes() {
        let vdb = VectorCapability::new(config(2));
        let a = context("a", Arc::new(MemoryStorage::new("a")));
        let b = context("b", Arc::new(MemoryStorage::new("b")));
        prepared(&vdb, &a)
            .call("add", vec![HostValue::from("k"), vector(&[1.0, 1.0])])
            .unwrap();
        assert_eq!(prepared(&vdb, &b).call("count", vec![]).unwrap(), HostValue::Integer(0));
        assert_eq!(prepared(&vdb, &a).call("count", vec![]).unwrap(), HostValue::Integer(1));
    }

    #[test]
    fn recreated_storage_invalidates_cache() {
        let vdb = VectorCapability::new(config(2));
        let first = context("ns", Arc::new(MemoryStorage::new("ns")));
        prepared(&vdb, &first)
            .call("add", vec![HostValue::from("k"), vector(&[1.0, 1.0])])
            .unwrap();
        let second = context("ns", Arc::new(MemoryStorage::new("ns")));
        assert_eq!(
            prepared(&vdb, &second).call("count", vec![]).unwrap(),
            HostValue::Integer(0)
        );
    }

    #[test]
    fn mismatched_stored_dimension_fails_initialize() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("ns"));
        let ctx = context("ns", Arc::clone(&storage));
        prepared(&VectorCapability::new(config(2)), &ctx)
            .call("add", vec![HostValue::from("k"), vector(&[1.0, 1.0])])
            .unwrap();
        let err = VectorCapability::new(config(3)).initialize(&ctx).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn ended_transaction_forces_reload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("ns"));
        let vdb = VectorCapability::new(config(2));
        let ctx = context("ns", Arc::clone(&storage));
        let f = prepared(&vdb, &ctx);
        f.call("add", vec![HostValue::from("k"), vector(&[1.0, 0.0])]).unwrap();

        // Stand-in for a rollback: the stored index disappears and the
        // namespace moves to a new transaction epoch.
        storage.delete(&index_key("ns")).unwrap();
        assert_eq!(f.call("count", vec![]).unwrap(), HostValue::Integer(1));
        ctx.end_transaction();
        assert_eq!(f.call("count", vec![]).unwrap(), HostValue::Integer(0));
    }

    #[test]
    fn failed_persist_leaves_index_unchanged() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new("ns"));
        let vdb = VectorCapability::new(config(2));
        let ctx = context("ns", Arc::clone(&storage));
        let f = prepared(&vdb, &ctx);
        f.call("add", vec![HostValue::from("a"), vector(&[1.0, 0.0])]).unwrap();

        storage.close().unwrap();
        let err = f.call("add", vec![HostValue::from("b"), vector(&[0.0, 1.0])]).unwrap_err();
        assert!(matches!(err, Error::StorageClosed(_)));
        assert_eq!(f.call("count", vec![]).unwrap(), HostValue::Integer(1));
    }

    #[test]
    fn dropped_stores_leave_the_cache() {
        let vdb = VectorCapability::new(config(2));
        let first = context("gone", Arc::new(MemoryStorage::new("gone")));
        vdb.initialize(&first).unwrap();
        drop(first);

        let other = context("other", Arc::new(MemoryStorage::new("other")));
        vdb.initialize(&other).unwrap();
        assert_eq!(vdb.cache.len(), 1);
    }
}
