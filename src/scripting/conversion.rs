//! JSON documents passed to and returned from scripts.
//!
//! Arrays carry mlua's array metatable, so an empty list comes back as `[]`.
//! A `null` nested in a document becomes the `json_null` sentinel, which keeps
//! object keys and array positions in place. A top-level `null` argument is
//! plain `nil`.

use mlua::{Lua, LuaSerdeExt, Result as LuaResult, Table, Value as LuaValue};
use serde_json::{Map, Number, Value as JsonValue};

/// Global bound to the null sentinel in every script.
pub const NULL_GLOBAL: &str = "json_null";

/// Convert a JSON argument into a Lua value.
pub fn json_to_lua(lua: &Lua, json: &JsonValue) -> LuaResult<LuaValue> {
    match json {
        JsonValue::Null => Ok(LuaValue::Nil),
        other => nested_to_lua(lua, other),
    }
}

fn nested_to_lua(lua: &Lua, json: &JsonValue) -> LuaResult<LuaValue> {
    Ok(match json {
        JsonValue::Null => LuaValue::NULL,
        JsonValue::Bool(b) => LuaValue::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => n.as_f64().map_or(LuaValue::NULL, LuaValue::Number),
        },
        JsonValue::String(s) => LuaValue::String(lua.create_string(s)?),
        JsonValue::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, nested_to_lua(lua, item)?)?;
            }
            table.set_metatable(Some(lua.array_metatable()))?;
            LuaValue::Table(table)
        }
        JsonValue::Object(fields) => {
            let table = lua.create_table_with_capacity(0, fields.len())?;
            for (k, v) in fields {
                table.raw_set(k.as_str(), nested_to_lua(lua, v)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

/// Convert a script's return value back into JSON.
///
/// Tables built from JSON arrays stay arrays. Other tables are arrays when
/// their keys are exactly `1..=n`, objects otherwise. Functions, threads and
/// userdata other than the null sentinel are rejected.
pub fn lua_to_json(lua: &Lua, value: LuaValue) -> LuaResult<JsonValue> {
    match value {
        LuaValue::Nil => Ok(JsonValue::Null),
        v if v.is_null() => Ok(JsonValue::Null),
        LuaValue::Boolean(b) => Ok(JsonValue::Bool(b)),
        LuaValue::Integer(i) => Ok(JsonValue::Number(i.into())),
        LuaValue::Number(n) => Ok(Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number)),
        LuaValue::String(s) => Ok(JsonValue::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => table_to_json(lua, t),
        other => Err(mlua::Error::runtime(format!(
            "cannot convert a {} to json",
            other.type_name()
        ))),
    }
}

fn table_to_json(lua: &Lua, t: Table) -> LuaResult<JsonValue> {
    let len = t.raw_len();
    let marked = t.metatable().is_some_and(|mt| mt == lua.array_metatable());

    if marked || is_sequence(&t, len)? {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            items.push(lua_to_json(lua, t.raw_get(i)?)?);
        }
        return Ok(JsonValue::Array(items));
    }

    let mut map = Map::new();
    for pair in t.pairs::<LuaValue, LuaValue>() {
        let (k, v) = pair?;
        let key = match k {
            LuaValue::String(s) => s.to_str()?.to_string(),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => n.to_string(),
            _ => continue,
        };
        map.insert(key, lua_to_json(lua, v)?);
    }
    Ok(JsonValue::Object(map))
}

fn is_sequence(t: &Table, len: usize) -> LuaResult<bool> {
    if len == 0 {
        return Ok(false);
    }
    let mut count = 0;
    for pair in t.pairs::<LuaValue, LuaValue>() {
        let (k, _) = pair?;
        match k {
            LuaValue::Integer(i) if i >= 1 && i as usize <= len => count += 1,
            _ => return Ok(false),
        }
    }
    Ok(count == len)
}
