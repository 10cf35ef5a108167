//! Execution engine
//!
//! One request runs through these steps:
//!
//! 1. acquire a pooled connection (retried on transient failures)
//! 2. optionally publish the caller's user id on the connection
//! 3. resolve the active role
//! 4. fetch the compiled statement for (namespace, name, role)
//! 5. validate the variables and run the request script
//! 6. bind positional arguments and execute (retried)
//! 7. hash and encrypt the result, run remote joins and the response script
//!
//! The connection is released when the request finishes, fails or is
//! cancelled by the request timeout.

pub mod cache;
pub mod compile;
pub mod retry;
pub mod role;

use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use sha2::{Digest, Sha256};
use soligraph_core::args::coerce_user_id;
use soligraph_core::{
    ArgBinder, ArgValue, AutoColumn, AutoValues, DefaultVar, DefaultVars, FieldError, GqlError,
    GqlResult, Identity, PgRenderer, QType, RenderConfig, SqlRenderer, VarMap,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{field, Instrument, Span};
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig};
use crate::db::{ConnectionPool, PgPool};
use crate::plugin::{
    JsonIrCompiler, PassthroughEncryptor, QueryCompiler, RemoteJoiner, ValueEncryptor,
};
use crate::scripting::{LuaScriptLoader, ScriptLoader};
use crate::validation::{ValidatorCompiler, ValidatorRegistry};

pub use cache::{CacheKey, CacheStats, StmtCache};
pub use compile::Stmt;
pub use retry::RetryPolicy;
pub use role::{active_role, RoleQuery};

use compile::StmtCompiler;

/// Marks result values the encryptor should encrypt.
pub const ENCRYPTION_PREFIX: &str = "__sg_enc:";

const SET_USER_ID_SQL: &str = "SELECT set_config('user.id', $1, false)";

/// A request to execute.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub variables: Option<Box<RawValue>>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.operation_name = Some(name.to_string());
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_variables(mut self, vars: &Value) -> GqlResult<Self> {
        self.variables = Some(serde_json::value::to_raw_value(vars)?);
        Ok(self)
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }

    /// Name the statement is cached under: the operation name, or a digest
    /// of the query text for anonymous requests.
    pub fn cache_name(&self) -> String {
        match &self.operation_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("sha256:{}", hex::encode(Sha256::digest(self.query.as_bytes()))),
        }
    }
}

/// Outcome of one executed request.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// JSON document produced by the statement; `None` when it returned no row.
    pub data: Option<Vec<u8>>,
    /// Hex SHA-256 of the unencrypted document.
    pub hash: Option<String>,
    pub role: String,
    pub name: String,
    pub operation: QType,
    pub cache_header: Option<String>,
    /// Auto-column values injected into this request's payloads.
    pub auto_values: AutoValues,
}

impl QueryResult {
    pub fn data_json(&self) -> GqlResult<Value> {
        match &self.data {
            Some(d) => Ok(serde_json::from_slice(d)?),
            None => Ok(Value::Null),
        }
    }
}

struct EngineInner {
    production: bool,
    debug: bool,
    set_user_id: bool,
    enable_camelcase: bool,
    timeout: Duration,
    pool: Arc<dyn ConnectionPool>,
    stmts: StmtCompiler,
    cache: StmtCache,
    retry: RetryPolicy,
    role_query: Option<RoleQuery>,
    default_vars: DefaultVars,
    encryptor: Arc<dyn ValueEncryptor>,
    encryption_key: Vec<u8>,
    joiner: Option<Arc<dyn RemoteJoiner>>,
}

/// The query engine; cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

fn record_error<T>(span: &Span, result: GqlResult<T>) -> GqlResult<T> {
    if let Err(e) = &result {
        span.record("error", field::display(e));
        tracing::error!(parent: span, kind = e.kind(), "{}", e);
    }
    result
}

fn log_field_errors(errors: &[FieldError]) {
    for e in errors {
        tracing::warn!(field = %e.field, "validation failed: {}", e.message);
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Build an engine over a PostgreSQL pool described by the config.
    pub fn connect(config: EngineConfig) -> GqlResult<Self> {
        let pool = PgPool::new(&config.database)?;
        EngineBuilder::new(config).pool(Arc::new(pool)).build()
    }

    pub fn is_production(&self) -> bool {
        self.inner.production
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Execute a request, bounded by the configured request timeout.
    pub async fn execute(&self, req: &QueryRequest, identity: &Identity) -> GqlResult<QueryResult> {
        let timeout = self.inner.timeout;
        let span = tracing::info_span!(
            "request",
            request.id = %Uuid::now_v7(),
            query.namespace = req.namespace()
        );
        match tokio::time::timeout(timeout, self.run(req, identity))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    namespace = req.namespace(),
                    name = ?req.operation_name,
                    "Request cancelled after {} ms",
                    timeout.as_millis()
                );
                Err(GqlError::Cancelled(format!(
                    "request exceeded {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn run(&self, req: &QueryRequest, identity: &Identity) -> GqlResult<QueryResult> {
        let inner = &*self.inner;
        let ns = req.namespace();
        let name = req.cache_name();

        let span = tracing::info_span!(
            "get_connection",
            query.namespace = ns,
            query.name = %name,
            error = field::Empty
        );
        let pool = &inner.pool;
        let acquired = inner
            .retry
            .run("get_connection", move || pool.acquire())
            .instrument(span.clone())
            .await;
        let mut conn = record_error(&span, acquired)?;

        if inner.set_user_id {
            if let Some(user_id) = &identity.user_id {
                let span = tracing::info_span!(
                    "set_local_user_id",
                    query.namespace = ns,
                    query.name = %name,
                    error = field::Empty
                );
                let args = vec![match coerce_user_id("user_id", user_id)? {
                    ArgValue::Int(i) => ArgValue::Text(i.to_string()),
                    other => other,
                }];
                let result = inner
                    .retry
                    .run_on("set_local_user_id", &mut conn, |c| {
                        let args = args.clone();
                        Box::pin(async move { c.execute(SET_USER_ID_SQL, &args).await })
                    })
                    .instrument(span.clone())
                    .await;
                record_error(&span, result)?;
            }
        }

        let role = active_role(identity, inner.role_query.as_ref(), conn.as_mut()).await?;
        let stmt = self.compile(req, ns, &name, &role).await?;

        let vars = self.prepare_vars(&stmt, req.variables.as_deref())?;

        let mut binder = ArgBinder::new(&stmt.qc, stmt.md.params())
            .with_auto_columns(&inner.stmts.auto_columns, inner.enable_camelcase);
        if stmt.qc.remotes > 0 {
            binder = binder.with_json();
        }
        let args = binder.bind(&vars, identity, &inner.default_vars)?;

        let span = tracing::info_span!(
            "execute_query",
            query.namespace = ns,
            query.operation = %stmt.qc.qtype,
            query.name = %stmt.qc.name,
            query.role = %stmt.role,
            error = field::Empty
        );
        let values = Arc::new(args.values);
        let executed = inner
            .retry
            .run_on("execute_query", &mut conn, |c| {
                let stmt = stmt.clone();
                let values = values.clone();
                Box::pin(async move { c.query_json(&stmt.sql, &values).await })
            })
            .instrument(span.clone())
            .await;
        let data = record_error(&span, executed)?;
        drop(conn);

        if inner.debug {
            tracing::debug!(role = %stmt.role, sql = %stmt.sql, "Executed statement");
        }

        let mut result = QueryResult {
            data: None,
            hash: None,
            role: stmt.role.clone(),
            name: stmt.qc.name.clone(),
            operation: stmt.qc.qtype,
            cache_header: Some(stmt.qc.cache.header.clone()).filter(|h| !h.is_empty()),
            auto_values: args.auto_values,
        };

        let Some(data) = data else {
            return Ok(result);
        };

        let digest = Sha256::digest(&data);
        let mut data = inner.encryptor.encrypt_values(
            data,
            ENCRYPTION_PREFIX,
            digest.as_slice(),
            &inner.encryption_key,
        )?;
        result.hash = Some(hex::encode(digest));

        if stmt.qc.remotes > 0 {
            let joiner = inner.joiner.as_ref().ok_or_else(|| {
                GqlError::Internal(format!(
                    "'{}' declares remote joins but no remote joiner is configured",
                    stmt.qc.name
                ))
            })?;
            data = joiner.join(&stmt.qc, data).await?;
        }

        if let Some(script) = stmt.script.as_ref().filter(|s| s.has_response_fn()) {
            let doc: Value = serde_json::from_slice(&data)?;
            data = serde_json::to_vec(&script.call_response(doc)?)?;
        }

        result.data = Some(data);
        Ok(result)
    }

    async fn compile(&self, req: &QueryRequest, ns: &str, name: &str, role: &str) -> GqlResult<Arc<Stmt>> {
        let inner = &*self.inner;
        let vars = req.variables.as_deref();

        if !inner.production {
            return inner
                .stmts
                .compile_for_role(&req.query, vars, role, ns)
                .map(Arc::new);
        }

        let key = CacheKey::new(ns, name, role);
        inner
            .cache
            .get_or_compile(&key, || inner.stmts.compile_for_role(&req.query, vars, role, ns))
            .await
    }

    /// Run validators and the request script; return the variables to bind.
    fn prepare_vars(&self, stmt: &Stmt, raw: Option<&RawValue>) -> GqlResult<VarMap> {
        let production = self.inner.production;
        let raw = raw.map(|r| r.get()).unwrap_or("{}");
        let request_script = stmt.script.as_ref().filter(|s| s.has_request_fn());

        if stmt.validator.is_none() && stmt.consts.is_none() && request_script.is_none() {
            return Ok(serde_json::from_str(raw)?);
        }

        let doc: Value = serde_json::from_str(raw)?;

        if let Some(ve) = &stmt.validator {
            if let Err(e) = ve.validate(&doc) {
                if let (false, GqlError::ValidationFailed(errors)) = (production, &e) {
                    log_field_errors(errors);
                }
                return Err(e);
            }
        }

        if let Some(consts) = &stmt.consts {
            let empty = serde_json::Map::new();
            let errors = consts.validate_map(doc.as_object().unwrap_or(&empty));
            if !errors.is_empty() {
                if !production {
                    log_field_errors(&errors);
                }
                return Err(GqlError::ValidationFailed(errors));
            }
        }

        match request_script {
            Some(script) => {
                let doc = script.call_request(doc, &stmt.role)?;
                Ok(serde_json::from_str(&serde_json::to_string(&doc)?)?)
            }
            None => Ok(serde_json::from_str(raw)?),
        }
    }
}

/// Assembles an `Engine` from configuration and collaborators.
pub struct EngineBuilder {
    config: EngineConfig,
    pool: Option<Arc<dyn ConnectionPool>>,
    compiler: Option<Arc<dyn QueryCompiler>>,
    renderer: Option<Arc<dyn SqlRenderer>>,
    validators: ValidatorRegistry,
    scripts: Option<Arc<dyn ScriptLoader>>,
    encryptor: Arc<dyn ValueEncryptor>,
    encryption_key: Vec<u8>,
    joiner: Option<Arc<dyn RemoteJoiner>>,
    default_vars: DefaultVars,
    auto_columns: Vec<AutoColumn>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            pool: None,
            compiler: None,
            renderer: None,
            validators: ValidatorRegistry::default(),
            scripts: None,
            encryptor: Arc::new(PassthroughEncryptor),
            encryption_key: Vec::new(),
            joiner: None,
            default_vars: HashMap::new(),
            auto_columns: Vec::new(),
        }
    }

    pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn compiler(mut self, compiler: Arc<dyn QueryCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn SqlRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn validator(mut self, vtype: &str, compiler: Arc<dyn ValidatorCompiler>) -> Self {
        self.validators.register(vtype, compiler);
        self
    }

    pub fn script_loader(mut self, loader: Arc<dyn ScriptLoader>) -> Self {
        self.scripts = Some(loader);
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn ValueEncryptor>, key: Vec<u8>) -> Self {
        self.encryptor = encryptor;
        self.encryption_key = key;
        self
    }

    pub fn remote_joiner(mut self, joiner: Arc<dyn RemoteJoiner>) -> Self {
        self.joiner = Some(joiner);
        self
    }

    /// Server-side fallback for a variable, e.g. `DefaultVar::string_fn`.
    pub fn default_var(mut self, name: &str, var: DefaultVar) -> Self {
        self.default_vars.insert(name.to_string(), var);
        self
    }

    /// Auto column in addition to the configured ones.
    pub fn auto_column(mut self, column: AutoColumn) -> Self {
        self.auto_columns.push(column);
        self
    }

    pub fn build(self) -> GqlResult<Engine> {
        let config = self.config;
        let pool = self
            .pool
            .ok_or_else(|| GqlError::Internal("engine needs a connection pool".to_string()))?;

        let mut auto_columns = config
            .auto_column_rules()
            .map_err(|e: ConfigError| GqlError::Internal(e.to_string()))?;
        auto_columns.extend(self.auto_columns);

        let mut default_vars = config.default_var_map();
        default_vars.extend(self.default_vars);

        let compiler = self
            .compiler
            .unwrap_or_else(|| Arc::new(JsonIrCompiler::new(&config.default_schema)));
        let renderer = self.renderer.unwrap_or_else(|| {
            Arc::new(PgRenderer::new(RenderConfig {
                enable_camelcase: config.enable_camelcase,
            }))
        });
        let scripts = self.scripts.or_else(|| {
            config
                .scripts_dir
                .as_ref()
                .map(|dir| Arc::new(LuaScriptLoader::new(dir)) as Arc<dyn ScriptLoader>)
        });

        let stmts = StmtCompiler {
            roles: config
                .roles
                .iter()
                .map(|r| (r.name.clone(), r.clone()))
                .collect(),
            compiler,
            renderer,
            validators: self.validators,
            scripts,
            auto_columns,
        };

        tracing::info!(
            production = config.production,
            roles = stmts.roles.len(),
            auto_columns = stmts.auto_columns.len(),
            "Engine initialized"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                production: config.production,
                debug: config.debug,
                set_user_id: config.set_user_id,
                enable_camelcase: config.enable_camelcase,
                timeout: config.request_timeout(),
                pool,
                stmts,
                cache: StmtCache::new(),
                retry: RetryPolicy::from(&config.retry),
                role_query: config.roles_query.as_deref().map(RoleQuery::new),
                default_vars,
                encryptor: self.encryptor,
                encryption_key: self.encryption_key,
                joiner: self.joiner,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_name() {
        let named = QueryRequest::new("{}").with_name("updatePost");
        assert_eq!(named.cache_name(), "updatePost");

        let a = QueryRequest::new("mutation a");
        let b = QueryRequest::new("mutation b");
        assert!(a.cache_name().starts_with("sha256:"));
        assert_ne!(a.cache_name(), b.cache_name());
        assert_eq!(a.cache_name(), QueryRequest::new("mutation a").cache_name());
    }

    #[test]
    fn test_request_deserialize() {
        let req: QueryRequest = serde_json::from_value(json!({
            "query": "{}",
            "operationName": "renamePost",
            "namespace": "blog",
            "variables": {"id": 5}
        }))
        .unwrap();
        assert_eq!(req.operation_name.as_deref(), Some("renamePost"));
        assert_eq!(req.namespace(), "blog");
        assert_eq!(req.variables.unwrap().get(), r#"{"id":5}"#);
    }

    #[test]
    fn test_builder_requires_pool() {
        let err = Engine::builder(EngineConfig::default()).build().err().unwrap();
        assert!(matches!(err, GqlError::Internal(_)));
    }
}
