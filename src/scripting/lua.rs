//! Lua scripts loaded from a directory.

use mlua::{Function, Lua, Value as LuaValue};
use parking_lot::Mutex;
use serde_json::Value;
use soligraph_core::{GqlError, GqlResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::conversion::{json_to_lua, lua_to_json, NULL_GLOBAL};
use super::{Script, ScriptLoader};

/// Globals removed before any script code runs.
const UNSAFE_GLOBALS: [&str; 8] = [
    "os", "io", "debug", "package", "dofile", "load", "loadfile", "require",
];

const REQUEST_FN: &str = "request";
const RESPONSE_FN: &str = "response";

fn lua_error(name: &str, err: mlua::Error) -> GqlError {
    GqlError::Script(format!("{}: {}", name, err))
}

/// Loads `<dir>/<name>.lua`.
#[derive(Debug, Clone)]
pub struct LuaScriptLoader {
    dir: PathBuf,
}

impl LuaScriptLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> GqlResult<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(GqlError::Script(format!("invalid script name '{}'", name)));
        }
        Ok(self.dir.join(format!("{}.lua", name)))
    }
}

impl ScriptLoader for LuaScriptLoader {
    fn load(&self, name: &str) -> GqlResult<Arc<dyn Script>> {
        let path = self.path_for(name)?;
        let script = LuaScript::from_file(name, &path)?;
        tracing::debug!(
            script = name,
            request = script.has_request,
            response = script.has_response,
            "Loaded script"
        );
        Ok(Arc::new(script))
    }
}

/// A script evaluated in its own sandboxed Lua state.
pub struct LuaScript {
    name: String,
    lua: Mutex<Lua>,
    has_request: bool,
    has_response: bool,
}

impl LuaScript {
    pub fn from_file(name: &str, path: &Path) -> GqlResult<Self> {
        let code = std::fs::read_to_string(path).map_err(|e| {
            GqlError::Script(format!("cannot read script '{}': {}", path.display(), e))
        })?;
        Self::from_source(name, &code)
    }

    pub fn from_source(name: &str, code: &str) -> GqlResult<Self> {
        let lua = Lua::new();

        let globals = lua.globals();
        for unsafe_global in UNSAFE_GLOBALS {
            globals
                .set(unsafe_global, LuaValue::Nil)
                .map_err(|e| lua_error(name, e))?;
        }
        globals
            .set(NULL_GLOBAL, LuaValue::NULL)
            .map_err(|e| lua_error(name, e))?;

        lua.load(code)
            .set_name(name)
            .exec()
            .map_err(|e| lua_error(name, e))?;

        let has_request = globals.get::<Option<Function>>(REQUEST_FN).ok().flatten().is_some();
        let has_response = globals.get::<Option<Function>>(RESPONSE_FN).ok().flatten().is_some();
        drop(globals);

        Ok(Self {
            name: name.to_string(),
            lua: Mutex::new(lua),
            has_request,
            has_response,
        })
    }

    fn call(&self, func: &str, args: &[&Value]) -> GqlResult<Value> {
        let lua = self.lua.lock();
        let f: Function = lua
            .globals()
            .get(func)
            .map_err(|e| lua_error(&self.name, e))?;

        let mut lua_args = Vec::with_capacity(args.len());
        for a in args {
            lua_args.push(json_to_lua(&lua, a).map_err(|e| lua_error(&self.name, e))?);
        }

        let result: LuaValue = f
            .call(mlua::MultiValue::from_iter(lua_args))
            .map_err(|e| lua_error(&self.name, e))?;
        lua_to_json(&lua, result).map_err(|e| lua_error(&self.name, e))
    }
}

impl Script for LuaScript {
    fn has_request_fn(&self) -> bool {
        self.has_request
    }

    fn has_response_fn(&self) -> bool {
        self.has_response
    }

    fn call_request(&self, vars: Value, role: &str) -> GqlResult<Value> {
        self.call(REQUEST_FN, &[&vars, &Value::String(role.to_string())])
    }

    fn call_response(&self, data: Value) -> GqlResult<Value> {
        self.call(RESPONSE_FN, &[&data])
    }
}
