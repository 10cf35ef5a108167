//! Common test utilities for engine tests
//!
//! Provides:
//! - An in-memory connection pool that records every statement
//! - A compiler wrapper counting compilations
//! - IR documents for the `posts` table

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use soligraph::db::{Connection, ConnectionPool};
use soligraph::plugin::{JsonIrCompiler, QueryCompiler};
use soligraph::{Engine, EngineConfig};
use soligraph_core::{ArgValue, GqlError, GqlResult, QCode};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A statement seen by the mock database.
#[derive(Debug, Clone)]
pub struct Executed {
    pub sql: String,
    pub args: Vec<ArgValue>,
}

/// Shared state behind `MockPool`.
#[derive(Default)]
pub struct MockDb {
    pub log: Mutex<Vec<Executed>>,
    pub response: Mutex<Option<Value>>,
    pub role: Mutex<Option<String>>,
    /// Transient failures still to inject into `query_json`.
    pub failures: AtomicU32,
    pub delay: Mutex<Option<Duration>>,
    pub acquired: AtomicUsize,
}

impl MockDb {
    pub fn statements(&self) -> Vec<Executed> {
        self.log.lock().clone()
    }

    pub fn set_response(&self, value: Option<Value>) {
        *self.response.lock() = value;
    }

    fn record(&self, sql: &str, args: &[ArgValue]) {
        self.log.lock().push(Executed {
            sql: sql.to_string(),
            args: args.to_vec(),
        });
    }
}

pub struct MockPool {
    pub db: Arc<MockDb>,
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn acquire(&self) -> GqlResult<Box<dyn Connection>> {
        self.db.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            db: self.db.clone(),
        }))
    }
}

pub struct MockConnection {
    db: Arc<MockDb>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn query_json(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<Option<Vec<u8>>> {
        self.db.record(sql, args);
        let delay = *self.db.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let failing = self
            .db
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GqlError::transient_db("connection reset by peer"));
        }
        let response = self.db.response.lock().clone();
        Ok(response.map(|v| v.to_string().into_bytes()))
    }

    async fn query_scalar(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<Option<String>> {
        self.db.record(sql, args);
        Ok(self.db.role.lock().clone())
    }

    async fn execute(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<u64> {
        self.db.record(sql, args);
        Ok(1)
    }
}

/// Counts compilations and can slow them down to widen races.
pub struct CountingCompiler {
    inner: JsonIrCompiler,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl CountingCompiler {
    pub fn new() -> Self {
        Self {
            inner: JsonIrCompiler::default(),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl QueryCompiler for CountingCompiler {
    fn compile(
        &self,
        query: &str,
        vars: Option<&RawValue>,
        role: &str,
        namespace: &str,
    ) -> GqlResult<QCode> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            std::thread::sleep(d);
        }
        self.inner.compile(query, vars, role, namespace)
    }
}

pub fn test_config(production: bool) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.production = production;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config
}

/// Engine over a fresh mock database.
pub fn create_test_engine(
    config: EngineConfig,
    compiler: Arc<CountingCompiler>,
) -> (Engine, Arc<MockDb>) {
    let db = Arc::new(MockDb::default());
    let engine = Engine::builder(config)
        .pool(Arc::new(MockPool { db: db.clone() }))
        .compiler(compiler)
        .build()
        .expect("Failed to build engine");
    (engine, db)
}

/// `updatePost`: JSON-fed update of `posts` filtered by `$id`.
pub fn update_post_ir() -> Value {
    json!({
        "type": "update",
        "name": "updatePost",
        "action_var": "data",
        "mutates": [{
            "id": 0,
            "key": "posts",
            "type": "update",
            "is_json": true,
            "ti": {"name": "posts", "columns": [
                {"name": "id", "type": "bigint", "primary_key": true},
                {"name": "title", "type": "text"},
                {"name": "updated_by", "type": "bigint"}
            ]},
            "cols": [{"col": {"name": "title", "type": "text"}, "field_name": "title"}],
            "where": {"op": "cmp", "col": "id", "cmp": "eq", "val": {"kind": "var", "value": "id"}}
        }]
    })
}

pub fn with_fields(mut doc: Value, extra: Value) -> Value {
    if let (Some(d), Some(e)) = (doc.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            d.insert(k.clone(), v.clone());
        }
    }
    doc
}
