//! Positional argument binding.
//!
//! Turns the parameter list declared by a compiled statement into an
//! ordered value list, drawing from identity claims, request variables and
//! configured defaults. For insert and update statements the decoded JSON
//! payloads are then augmented with auto-column values.

use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::autocol::{
    root_matches_table, AutoColumn, AutoValues, PayloadInjector, AUTO_PARAM_PREFIX,
};
use crate::error::{GqlError, GqlResult};
use crate::identity::{Identity, IdentityClaim};
use crate::psql::Param;
use crate::qcode::{QCode, QType};
use crate::util::to_snake;

/// Request variables, kept as raw JSON so literals can be inspected.
pub type VarMap = HashMap<String, Box<RawValue>>;

/// A bound positional value.
///
/// Numeric request variables are kept as text; the database casts them to
/// the parameter's declared type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Json(Value),
}

impl ArgValue {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Bool(b),
            Value::String(s) => ArgValue::Text(s),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ArgValue::Int(i),
                None => ArgValue::Text(n.to_string()),
            },
            v @ (Value::Array(_) | Value::Object(_)) => ArgValue::Json(v),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ArgValue::Null => Value::Null,
            ArgValue::Bool(b) => Value::Bool(*b),
            ArgValue::Int(i) => Value::Number(Number::from(*i)),
            ArgValue::Text(s) => Value::String(s.clone()),
            ArgValue::Json(v) => v.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }
}

/// Result of binding one request.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub values: Vec<ArgValue>,
    /// JSON encoding of `values`, when requested.
    pub json: Option<Vec<u8>>,
    /// Position of the `cursor` parameter, if declared.
    pub cursor_index: Option<usize>,
    /// Auto-column values injected into this request's payloads.
    pub auto_values: AutoValues,
}

pub type DefaultValueFn = Arc<dyn Fn() -> ArgValue + Send + Sync>;

/// Configured fallback for a variable the request does not carry.
#[derive(Clone)]
pub enum DefaultVar {
    Static(Value),
    Func(DefaultValueFn),
}

impl DefaultVar {
    pub fn string_fn<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        DefaultVar::Func(Arc::new(move || ArgValue::Text(f())))
    }

    pub fn int_fn<F>(f: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        DefaultVar::Func(Arc::new(move || ArgValue::Int(f())))
    }

    pub fn bool_fn<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        DefaultVar::Func(Arc::new(move || ArgValue::Bool(f())))
    }

    pub fn resolve(&self) -> ArgValue {
        match self {
            DefaultVar::Static(v) => ArgValue::from_json(v.clone()),
            DefaultVar::Func(f) => f(),
        }
    }
}

impl std::fmt::Debug for DefaultVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultVar::Static(v) => write!(f, "Static({})", v),
            DefaultVar::Func(_) => f.write_str("Func(..)"),
        }
    }
}

pub type DefaultVars = HashMap<String, DefaultVar>;

/// Convert a user id claim into a bindable value.
///
/// Integers bind as integers, floating point ids are truncated, strings
/// bind as text. Anything else is rejected.
pub fn coerce_user_id(name: &str, value: &Value) -> GqlResult<ArgValue> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ArgValue::Int(i))
            } else if let Some(u) = n.as_u64() {
                Ok(ArgValue::Text(u.to_string()))
            } else {
                let f = n.as_f64().unwrap_or_default();
                Ok(ArgValue::Int(f.trunc() as i64))
            }
        }
        Value::String(s) => Ok(ArgValue::Text(s.clone())),
        other => Err(GqlError::IdentityClaimTypeMismatch {
            name: name.to_string(),
            observed: json_type_name(other).to_string(),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a raw JSON literal into a positional value.
fn parse_var_val(raw: &str) -> GqlResult<ArgValue> {
    let v = match raw.as_bytes().first() {
        Some(b'[') | Some(b'{') => ArgValue::Json(serde_json::from_str(raw)?),
        Some(b'"') => ArgValue::Text(serde_json::from_str::<String>(raw)?),
        Some(b't') | Some(b'T') => ArgValue::Bool(true),
        Some(b'f') | Some(b'F') => ArgValue::Bool(false),
        Some(b'n') => ArgValue::Null,
        _ => ArgValue::Text(raw.to_string()),
    };
    Ok(v)
}

fn is_json_type(param_type: &str) -> bool {
    matches!(param_type, "json" | "jsonb")
}

/// Binds the declared parameters of one compiled statement.
pub struct ArgBinder<'a> {
    qc: &'a QCode,
    params: &'a [Param],
    auto_columns: &'a [AutoColumn],
    enable_camelcase: bool,
    build_json: bool,
}

impl<'a> ArgBinder<'a> {
    pub fn new(qc: &'a QCode, params: &'a [Param]) -> Self {
        Self {
            qc,
            params,
            auto_columns: &[],
            enable_camelcase: false,
            build_json: false,
        }
    }

    pub fn with_auto_columns(mut self, auto_columns: &'a [AutoColumn], enable_camelcase: bool) -> Self {
        self.auto_columns = auto_columns;
        self.enable_camelcase = enable_camelcase;
        self
    }

    /// Also produce the JSON encoding of the bound values.
    pub fn with_json(mut self) -> Self {
        self.build_json = true;
        self
    }

    pub fn bind(&self, vars: &VarMap, identity: &Identity, defaults: &DefaultVars) -> GqlResult<Args> {
        let mut args = Args::default();
        let mut values = Vec::with_capacity(self.params.len());

        for (i, p) in self.params.iter().enumerate() {
            let v = if let Some(claim) = IdentityClaim::from_param(&p.name) {
                self.bind_claim(p, claim, identity)?
            } else if let Some(column) = p.name.strip_prefix(AUTO_PARAM_PREFIX) {
                self.bind_auto_column(p, column, identity)?
            } else if p.name == "cursor" {
                args.cursor_index = Some(i);
                match vars.get("cursor").map(|raw| raw.get().trim()) {
                    Some(raw) if raw.starts_with('"') => {
                        ArgValue::Text(serde_json::from_str::<String>(raw)?)
                    }
                    _ => ArgValue::Null,
                }
            } else {
                self.bind_variable(p, vars, defaults)?
            };
            values.push(v);
        }

        if matches!(self.qc.qtype, QType::Insert | QType::Update)
            && !self.auto_columns.is_empty()
            && !self.qc.mutates.is_empty()
        {
            args.auto_values = self.augment(&mut values, identity)?;
        }

        if self.build_json && !values.is_empty() {
            args.json = Some(serde_json::to_vec(&values)?);
        }
        args.values = values;
        Ok(args)
    }

    fn bind_claim(&self, p: &Param, claim: IdentityClaim, identity: &Identity) -> GqlResult<ArgValue> {
        match identity.claim(claim) {
            Some(v) if claim == IdentityClaim::UserId => coerce_user_id(&p.name, &v),
            Some(Value::String(s)) => Ok(ArgValue::Text(s)),
            Some(v) => Ok(ArgValue::from_json(v)),
            None => Err(GqlError::required(&p.name, &p.param_type)),
        }
    }

    fn bind_auto_column(&self, p: &Param, column: &str, identity: &Identity) -> GqlResult<ArgValue> {
        let rule = self
            .auto_columns
            .iter()
            .find(|r| r.name == column && r.qtypes.contains(&self.qc.qtype));
        match rule {
            Some(rule) => match rule.resolve(Some(identity))? {
                Some(v) => Ok(ArgValue::from_json(v)),
                None => Err(GqlError::required(&p.name, &p.param_type)),
            },
            None => Err(GqlError::required(&p.name, &p.param_type)),
        }
    }

    fn bind_variable(&self, p: &Param, vars: &VarMap, defaults: &DefaultVars) -> GqlResult<ArgValue> {
        if let Some(raw) = vars.get(&p.name) {
            let raw = raw.get().trim();
            let is_null = raw == "null";

            if p.is_not_null && is_null {
                return Err(GqlError::NullNotAllowed(p.name.clone()));
            }
            if p.is_array && !is_null && !raw.starts_with('[') {
                return Err(GqlError::ArrayTypeMismatch {
                    name: p.name.clone(),
                    var_type: p.param_type.clone(),
                });
            }
            if is_json_type(&p.param_type)
                && !is_null
                && !(raw.starts_with('[') || raw.starts_with('{'))
            {
                return Err(GqlError::JsonTypeMismatch(p.name.clone()));
            }
            return parse_var_val(raw);
        }

        match defaults.get(&p.name) {
            Some(d) => Ok(d.resolve()),
            None => Err(GqlError::required(&p.name, &p.param_type)),
        }
    }

    /// Inject auto-column values into every JSON-decodable value.
    fn augment(&self, values: &mut [ArgValue], identity: &Identity) -> GqlResult<AutoValues> {
        let root_key = self.qc.mutates[0].key.as_str();
        let action_var = self.qc.action_var.as_deref();
        let mut injector = PayloadInjector::new(self.qc, self.auto_columns, identity);

        for (p, v) in self.params.iter().zip(values.iter_mut()) {
            let ArgValue::Json(doc) = v else {
                continue;
            };
            if action_var == Some(p.name.as_str()) && !root_matches_table(doc, self.qc) {
                injector.update_variable_tree(doc, self.enable_camelcase)?;
                continue;
            }
            // A root keyed by the root table is a wrapper, not a record.
            let wrapped = doc
                .as_object()
                .is_some_and(|o| o.keys().any(|k| to_snake(k) == root_key));
            injector.inject_into_payload_tree(doc, if wrapped { "" } else { root_key })?;
        }
        Ok(injector.into_auto_values())
    }
}
