//! Monitoring capability: structured log emission and counters.
//!
//! Counters live in a private prometheus registry, labelled by namespace, so
//! one namespace's `increment("hits")` never shows up in another's stats.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use prometheus::{IntCounterVec, Opts, Registry};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use super::traits::{Args, Capability, FunctionTable, QueryContext};
use crate::error::{Error, Result};
use crate::value::HostValue;

const FUNCTIONS: &[&str] = &["get_stats", "increment", "log"];

fn metric_error(err: prometheus::Error) -> Error {
    Error::general(format!("metrics registry: {err}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "critical" => Ok(Self::Error),
            other => Err(Error::invalid_argument(format!("unknown log level '{other}'"))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

struct Metrics {
    started: Instant,
    started_at: DateTime<Utc>,
    registry: Registry,
    queries: IntCounterVec,
    logs: IntCounterVec,
    counters: IntCounterVec,
    /// Counter names seen per namespace, for `get_stats`.
    names: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl Metrics {
    fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("liath".into()), None).map_err(metric_error)?;
        let queries = IntCounterVec::new(
            Opts::new("queries_total", "Queries executed per namespace"),
            &["namespace"],
        )
        .map_err(metric_error)?;
        let logs = IntCounterVec::new(
            Opts::new("script_logs_total", "Log entries emitted by scripts"),
            &["namespace", "level"],
        )
        .map_err(metric_error)?;
        let counters = IntCounterVec::new(
            Opts::new("script_counter", "Counters incremented by scripts"),
            &["namespace", "name"],
        )
        .map_err(metric_error)?;

        registry.register(Box::new(queries.clone())).map_err(metric_error)?;
        registry.register(Box::new(logs.clone())).map_err(metric_error)?;
        registry.register(Box::new(counters.clone())).map_err(metric_error)?;

        Ok(Self {
            started: Instant::now(),
            started_at: Utc::now(),
            registry,
            queries,
            logs,
            counters,
            names: RwLock::new(HashMap::new()),
        })
    }

    fn log(&self, namespace: &str, level: Level, message: &str, fields: &HostValue) {
        let fields = if fields.is_absent() {
            String::new()
        } else {
            fields.display_inline()
        };
        match level {
            Level::Debug => tracing::debug!(namespace = %namespace, fields = %fields, "{message}"),
            Level::Info => tracing::info!(namespace = %namespace, fields = %fields, "{message}"),
            Level::Warn => tracing::warn!(namespace = %namespace, fields = %fields, "{message}"),
            Level::Error => tracing::error!(namespace = %namespace, fields = %fields, "{message}"),
        }
        self.logs.with_label_values(&[namespace, level.as_str()]).inc();
    }

    fn increment(&self, namespace: &str, name: &str, by: u64) -> u64 {
        self.names
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string());
        let counter = self.counters.with_label_values(&[namespace, name]);
        counter.inc_by(by);
        counter.get()
    }

    fn stats(&self, namespace: &str) -> HostValue {
        let names = self.names.read().get(namespace).cloned().unwrap_or_default();
        let counters = names.into_iter().map(|name| {
            let value = self.counters.with_label_values(&[namespace, name.as_str()]).get();
            (name, HostValue::from(value as i64))
        });
        let log_count: u64 = ["debug", "info", "warn", "error"]
            .iter()
            .map(|level| self.logs.with_label_values(&[namespace, *level]).get())
            .sum();

        HostValue::mapping([
            ("started_at", HostValue::from(self.started_at.to_rfc3339())),
            ("uptime_secs", HostValue::from(self.started.elapsed().as_secs_f64())),
            (
                "query_count",
                HostValue::from(self.queries.with_label_values(&[namespace]).get() as i64),
            ),
            ("log_count", HostValue::from(log_count as i64)),
            ("counters", HostValue::mapping(counters)),
        ])
    }
}

/// Script logging and counters.
pub struct MonitorCapability {
    metrics: Arc<Metrics>,
}

impl MonitorCapability {
    pub fn new() -> Result<Self> {
        Ok(Self {
            metrics: Arc::new(Metrics::new()?),
        })
    }

    /// Registry holding this capability's counters.
    pub fn registry(&self) -> &Registry {
        &self.metrics.registry
    }
}

impl Capability for MonitorCapability {
    fn capability_name(&self) -> &str {
        "monitor"
    }

    fn description(&self) -> &str {
        "Structured logging and per-namespace counters"
    }

    fn function_names(&self) -> &'static [&'static str] {
        FUNCTIONS
    }

    /// Called once per query, so this is where queries are counted.
    fn initialize(&self, ctx: &QueryContext) -> Result<()> {
        self.metrics.queries.with_label_values(&[ctx.namespace.as_str()]).inc();
        Ok(())
    }

    fn exposed_functions(&self, ctx: &QueryContext) -> FunctionTable {
        let namespace: Arc<str> = Arc::from(ctx.namespace.as_str());

        let (metrics, ns) = (Arc::clone(&self.metrics), Arc::clone(&namespace));
        let log = move |args: Args| -> Result<HostValue> {
            let level = Level::parse(&args.string(0, "level")?)?;
            let message = args.string(1, "message")?;
            metrics.log(&ns, level, &message, args.value(2));
            Ok(HostValue::mapping([
                ("status", HostValue::from("success")),
                ("message", HostValue::from("Log entry created")),
            ]))
        };

        let (metrics, ns) = (Arc::clone(&self.metrics), Arc::clone(&namespace));
        let increment = move |args: Args| -> Result<HostValue> {
            let name = args.key(0, "name")?;
            let by = args.opt_integer(1, "by")?.unwrap_or(1);
            let by = u64::try_from(by)
                .map_err(|_| Error::invalid_argument("counters only go up"))?;
            Ok(HostValue::from(metrics.increment(&ns, &name, by) as i64))
        };

        let (metrics, ns) = (Arc::clone(&self.metrics), namespace);
        FunctionTable::new()
            .with("log", log)
            .with("increment", increment)
            .with("get_stats", move |_| Ok(metrics.stats(&ns)))
    }
}

impl std::fmt::Debug for MonitorCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorCapability")
            .field("uptime", &self.metrics.started.elapsed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn context(namespace: &str) -> QueryContext {
        QueryContext::new(namespace, Arc::new(MemoryStorage::new(namespace)))
    }

    fn functions(monitor: &MonitorCapability, namespace: &str) -> FunctionTable {
        let ctx = context(namespace);
        monitor.initialize(&ctx).unwrap();
        monitor.exposed_functions(&ctx)
    }

    #[test]
    fn log_reports_success() {
        let monitor = MonitorCapability::new().unwrap();
        let f = functions(&monitor, "ns");
        let out = f
            .call(
                "log",
                vec![
                    HostValue::from("warning"),
                    HostValue::from("disk almost full"),
                    HostValue::mapping([("pct", HostValue::Integer(91))]),
                ],
            )
            .unwrap();
        assert_eq!(out.get("status"), Some(&HostValue::from("success")));
        assert!(f
            .call("log", vec![HostValue::from("loud"), HostValue::from("x")])
            .is_err());
    }

    #[test]
    fn counters_are_scoped_by_namespace() {
        let monitor = MonitorCapability::new().unwrap();
        let a = functions(&monitor, "a");
        assert_eq!(a.call("increment", vec![HostValue::from("hits")]).unwrap(), HostValue::Integer(1));
        assert_eq!(
            a.call("increment", vec![HostValue::from("hits"), HostValue::Integer(4)]).unwrap(),
            HostValue::Integer(5)
        );

        let b = functions(&monitor, "b");
        let stats = b.call("get_stats", vec![]).unwrap();
        assert_eq!(stats.get("counters"), Some(&HostValue::mapping(Vec::<(String, HostValue)>::new())));

        let stats = a.call("get_stats", vec![]).unwrap();
        assert_eq!(
            stats.get("counters"),
            Some(&HostValue::mapping([("hits", HostValue::Integer(5))]))
        );
        assert_eq!(stats.get("query_count"), Some(&HostValue::Integer(1)));
    }

    #[test]
    fn negative_increment_is_rejected() {
        let monitor = MonitorCapability::new().unwrap();
        let f = functions(&monitor, "ns");
        let err = f
            .call("increment", vec![HostValue::from("x"), HostValue::Integer(-1)])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn registry_exposes_counters() {
        let monitor = MonitorCapability::new().unwrap();
        functions(&monitor, "ns");
        let text = prometheus::TextEncoder::new()
            .encode_to_string(&monitor.registry().gather())
            .unwrap();
        assert!(text.contains("liath_queries_total{namespace=\"ns\"} 1"));
    }
}
