//! Conversion between Lua values and [`HostValue`].
//!
//! Table classification follows one rule: a table whose border (`#t`) is
//! positive is a sequence of `t[1..=#t]`; any other table is a mapping with
//! stringified keys. An empty table is therefore a mapping.
//!
//! Mixed tables such as `{10, 20, x = 1}` become `[10, 20]`: keyed entries
//! are dropped. The loss is logged at `warn` so it can be traced back to the
//! offending script.
//!
//! Strings that are not valid UTF-8 cross into the host as standard base64
//! text so binary payloads such as image bytes arrive intact.

use base64::Engine as _;
use mlua::{Lua, Table, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::HostValue;

/// Nesting limit; also stops self-referencing tables.
pub const MAX_DEPTH: usize = 64;

/// Marshal a script value into a host value.
pub fn to_host(value: &Value) -> Result<HostValue> {
    convert(value, 0)
}

fn convert(value: &Value, depth: usize) -> Result<HostValue> {
    if depth > MAX_DEPTH {
        return Err(Error::ScriptExecution(format!(
            "value nested deeper than {MAX_DEPTH} levels (cyclic table?)"
        )));
    }

    Ok(match value {
        Value::Nil => HostValue::Absent,
        Value::Boolean(b) => HostValue::Boolean(*b),
        Value::Integer(i) => HostValue::Integer(*i),
        Value::Number(n) => HostValue::Float(*n),
        Value::String(s) => match s.to_str() {
            Ok(text) => HostValue::String(text.to_string()),
            Err(_) => HostValue::String(
                base64::engine::general_purpose::STANDARD.encode(s.as_bytes()),
            ),
        },
        Value::Table(table) => convert_table(table, depth)?,
        Value::Error(err) => HostValue::String(err.to_string()),
        other => HostValue::String(format!("<{}>", other.type_name())),
    })
}

fn convert_table(table: &Table, depth: usize) -> Result<HostValue> {
    let len = table.raw_len();

    if len > 0 {
        let mut items = Vec::with_capacity(len);
        for index in 1..=len {
            let item: Value = table.raw_get(index).map_err(script_error)?;
            items.push(convert(&item, depth + 1)?);
        }

        let total = table.clone().pairs::<Value, Value>().count();
        if total > len {
            tracing::warn!(
                sequence_len = len,
                dropped = total - len,
                "Mixed table marshaled as a sequence, keyed entries dropped"
            );
        }
        return Ok(HostValue::Sequence(items));
    }

    let mut map = BTreeMap::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair.map_err(script_error)?;
        map.insert(key_string(&key), convert(&value, depth + 1)?);
    }
    Ok(HostValue::Mapping(map))
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
        other => format!("<{}>", other.type_name()),
    }
}

/// Build a script value from a host value.
pub fn to_lua(lua: &Lua, value: &HostValue) -> mlua::Result<Value> {
    Ok(match value {
        HostValue::Absent => Value::Nil,
        HostValue::Boolean(b) => Value::Boolean(*b),
        HostValue::Integer(i) => Value::Integer(*i),
        HostValue::Float(f) => Value::Number(*f),
        HostValue::String(s) => Value::String(lua.create_string(s)?),
        HostValue::Sequence(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        HostValue::Mapping(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
    })
}

pub(crate) fn script_error(err: mlua::Error) -> Error {
    Error::ScriptExecution(err.to_string())
}
