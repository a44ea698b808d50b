//! Sandboxed script runtime.
//!
//! Every query gets a fresh Lua state with only the `table`, `string`,
//! `math` and `utf8` libraries plus the pure base functions. File loaders
//! are removed and `print` goes to the log instead of stdout.
//!
//! Execution is bounded by a wall-clock deadline checked from an
//! instruction-count hook, and optionally by a heap limit. The deadline only
//! advances while Lua code runs: time spent inside a capability function
//! (an HTTP call, a slow disk) is not interrupted.

use mlua::{HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::marshal::{self, script_error};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::plugins::registry::PLUGINS_GLOBAL;
use crate::plugins::{Args, CapabilityFn, FunctionTable};
use crate::value::HostValue;

/// Field marking a table as a capability surface, so `cap:fn()` calls can
/// drop the implicit self argument.
const CAPABILITY_FIELD: &str = "__capability";

const DEADLINE_MESSAGE: &str = "execution deadline exceeded";

fn deadline_error() -> mlua::Error {
    mlua::Error::RuntimeError(DEADLINE_MESSAGE.into())
}

/// Runs query text against a set of capability surfaces.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: EngineConfig,
}

impl Sandbox {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn new_state(&self, namespace: &str, expired: &Arc<AtomicBool>) -> Result<Lua> {
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(script_error)?;

        let globals = lua.globals();
        for name in ["dofile", "loadfile"] {
            globals.raw_set(name, Value::Nil).map_err(script_error)?;
        }

        let ns = namespace.to_string();
        let print = lua
            .create_function(move |_, args: MultiValue| {
                let line = args
                    .iter()
                    .map(|value| match value {
                        Value::String(s) => s.to_string_lossy().to_string(),
                        other => marshal::to_host(other)
                            .map(|v| v.display_inline())
                            .unwrap_or_else(|_| format!("<{}>", other.type_name())),
                    })
                    .collect::<Vec<_>>()
                    .join("\t");
                tracing::info!(namespace = %ns, "{line}");
                Ok(())
            })
            .map_err(script_error)?;
        globals.raw_set("print", print).map_err(script_error)?;

        if self.config.memory_limit_bytes > 0 {
            lua.set_memory_limit(self.config.memory_limit_bytes)
                .map_err(script_error)?;
        }

        if self.config.timeout_ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
            let every = self.config.instruction_budget.max(1);
            let expired = Arc::clone(expired);
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(every),
                move |lua, _| {
                    if expired.load(Ordering::Relaxed) || Instant::now() >= deadline {
                        expired.store(true, Ordering::Relaxed);
                        // From here on every instruction and call fails, so a
                        // `pcall` around the loop cannot swallow the timeout.
                        lua.set_hook(
                            HookTriggers::new().every_nth_instruction(1).on_calls(),
                            |_, _| Err(deadline_error()),
                        );
                        return Err(deadline_error());
                    }
                    Ok(mlua::VmState::Continue)
                },
            );
        }

        Ok(lua)
    }

    /// Compile `query` as the body of a function taking one parameter per
    /// capability, call it with the surfaces, and marshal its first return
    /// value.
    pub fn run(
        &self,
        namespace: &str,
        surfaces: &[(String, FunctionTable)],
        query: &str,
    ) -> Result<HostValue> {
        let expired = Arc::new(AtomicBool::new(false));
        let lua = self.new_state(namespace, &expired)?;

        let plugins = lua.create_table().map_err(script_error)?;
        let mut args = Vec::with_capacity(surfaces.len());
        for (name, functions) in surfaces {
            let table = surface(&lua, name, functions, &expired).map_err(script_error)?;
            args.push(Value::Table(table));
            plugins.raw_set(name.as_str(), true).map_err(script_error)?;
        }
        lua.globals()
            .raw_set(PLUGINS_GLOBAL, plugins)
            .map_err(script_error)?;

        let params = surfaces
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let source = format!("return function({params})\n{query}\nend");

        let outcome = lua
            .load(source)
            .set_name("=query")
            .eval::<mlua::Function>()
            .and_then(|function| function.call::<Value>(MultiValue::from_vec(args)));

        if expired.load(Ordering::Relaxed) {
            return Err(Error::ScriptTimeout(self.config.timeout_ms));
        }
        match outcome {
            Ok(value) => marshal::to_host(&value),
            Err(err) => Err(script_error(err)),
        }
    }
}

/// Build the script-visible table for one capability.
fn surface(
    lua: &Lua,
    capability: &str,
    functions: &FunctionTable,
    expired: &Arc<AtomicBool>,
) -> mlua::Result<Table> {
    let table = lua.create_table_with_capacity(0, functions.len() + 1)?;
    table.raw_set(CAPABILITY_FIELD, capability)?;
    for (name, function) in functions.iter() {
        table.raw_set(name, wrap(lua, capability, name, function.clone(), Arc::clone(expired))?)?;
    }
    Ok(table)
}

fn wrap(
    lua: &Lua,
    capability: &str,
    name: &str,
    function: CapabilityFn,
    expired: Arc<AtomicBool>,
) -> mlua::Result<mlua::Function> {
    let capability = capability.to_string();
    let qualified = format!("{capability}.{name}");

    lua.create_function(move |lua, args: MultiValue| {
        if expired.load(Ordering::Relaxed) {
            return Err(deadline_error());
        }
        let mut values: Vec<Value> = args.into_iter().collect();
        let called_as_method = match values.first() {
            Some(Value::Table(first)) => {
                let tag: Option<String> = first.raw_get(CAPABILITY_FIELD)?;
                tag.as_deref() == Some(capability.as_str())
            }
            _ => false,
        };
        if called_as_method {
            values.remove(0);
        }

        let host = values
            .iter()
            .map(marshal::to_host)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| mlua::Error::RuntimeError(format!("{qualified}: {e}")))?;
        let out = function(Args::new(host))
            .map_err(|e| mlua::Error::RuntimeError(format!("{qualified}: {e}")))?;
        marshal::to_lua(lua, &out)
    })
}
