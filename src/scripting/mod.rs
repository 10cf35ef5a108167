//! Server-side request and response scripts
//!
//! A statement may name a script. Scripts are loaded once when the
//! statement is compiled; each exposes two optional hooks:
//!
//! - `request(vars, role)` returns the variables the statement is bound with
//! - `response(data)` returns the document sent back to the caller

pub mod conversion;
pub mod lua;

use serde_json::Value;
use soligraph_core::GqlResult;
use std::sync::Arc;

pub use lua::{LuaScript, LuaScriptLoader};

/// A loaded script with its optional hooks.
pub trait Script: Send + Sync {
    fn has_request_fn(&self) -> bool;

    fn has_response_fn(&self) -> bool;

    fn call_request(&self, vars: Value, role: &str) -> GqlResult<Value>;

    fn call_response(&self, data: Value) -> GqlResult<Value>;
}

pub trait ScriptLoader: Send + Sync {
    fn load(&self, name: &str) -> GqlResult<Arc<dyn Script>>;
}
