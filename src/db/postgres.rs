//! PostgreSQL pool over `tokio-postgres`.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use soligraph_core::{ArgValue, GqlError, GqlResult};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Statement};

use super::{Connection, ConnectionPool};
use crate::config::DatabaseConfig;

/// SQLSTATE codes worth retrying besides the connection exception class.
const TRANSIENT_STATES: [&str; 3] = ["40001", "40P01", "57P01"];

fn is_transient_state(code: &str) -> bool {
    code.starts_with("08") || TRANSIENT_STATES.contains(&code)
}

/// Convert a driver error, classifying it for the retry policy.
pub fn pg_error(err: tokio_postgres::Error) -> GqlError {
    let transient = err.is_closed()
        || err
            .code()
            .is_some_and(|state| is_transient_state(state.code()));

    let message = match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    GqlError::Database { message, transient }
}

/// Positional argument as sent over the wire. JSON values go as `json`,
/// everything else as text; the statement casts each placeholder.
#[derive(Debug)]
struct PgArg<'a>(&'a ArgValue);

impl PgArg<'_> {
    fn param_type(&self) -> Type {
        match self.0 {
            ArgValue::Json(_) => Type::JSON,
            _ => Type::TEXT,
        }
    }

    fn text(&self) -> String {
        match self.0 {
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Text(s) => s.clone(),
            ArgValue::Null | ArgValue::Json(_) => String::new(),
        }
    }
}

impl ToSql for PgArg<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self.0 {
            ArgValue::Null => Ok(IsNull::Yes),
            ArgValue::Json(v) => v.to_sql(ty, out),
            _ => self.text().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Pool of PostgreSQL clients bounded by a semaphore.
pub struct PgPool {
    config: Config,
    idle: Arc<Mutex<Vec<Client>>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl PgPool {
    /// Build the pool. Connections are opened lazily.
    pub fn new(db: &DatabaseConfig) -> GqlResult<Self> {
        let mut config: Config = db
            .url
            .parse()
            .map_err(|e| GqlError::fatal_db(format!("invalid Postgres DSN: {}", e)))?;
        config.connect_timeout(db.connect_timeout());

        Ok(Self {
            config,
            idle: Arc::new(Mutex::new(Vec::with_capacity(db.pool_size))),
            permits: Arc::new(Semaphore::new(db.pool_size.max(1))),
            acquire_timeout: db.acquire_timeout(),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    async fn connect(&self) -> GqlResult<Client> {
        let (client, connection) = self.config.connect(NoTls).await.map_err(|e| {
            tracing::warn!("Postgres connect failed: {}", e);
            GqlError::transient_db(format!("connect failed: {}", e))
        })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Postgres connection error: {}", e);
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    async fn acquire(&self) -> GqlResult<Box<dyn Connection>> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| GqlError::transient_db("timed out waiting for a pooled connection"))?
            .map_err(|_| GqlError::Internal("connection pool closed".to_string()))?;

        let reused = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(client) = idle.pop() {
                if !client.is_closed() {
                    found = Some(client);
                    break;
                }
            }
            found
        };
        let client = match reused {
            Some(client) => client,
            None => self.connect().await?,
        };

        Ok(Box::new(PgConnection {
            client: Some(client),
            idle: self.idle.clone(),
            _permit: permit,
        }))
    }
}

/// A checked-out client; dropping it returns a healthy client to the pool.
pub struct PgConnection {
    client: Option<Client>,
    idle: Arc<Mutex<Vec<Client>>>,
    _permit: OwnedSemaphorePermit,
}

impl PgConnection {
    fn client(&self) -> GqlResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| GqlError::transient_db("connection already released"))
    }

    async fn prepare(&self, sql: &str, args: &[PgArg<'_>]) -> GqlResult<Statement> {
        let types: Vec<Type> = args.iter().map(|a| a.param_type()).collect();
        self.client()?
            .prepare_typed(sql, &types)
            .await
            .map_err(pg_error)
    }
}

fn wrap(args: &[ArgValue]) -> Vec<PgArg<'_>> {
    args.iter().map(PgArg).collect()
}

fn refs<'a>(args: &'a [PgArg<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Connection for PgConnection {
    async fn query_json(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<Option<Vec<u8>>> {
        let args = wrap(args);
        let stmt = self.prepare(sql, &args).await?;
        let row = self
            .client()?
            .query_opt(&stmt, &refs(&args))
            .await
            .map_err(pg_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: Option<serde_json::Value> = row.try_get(0).map_err(pg_error)?;
        match value {
            Some(v) => Ok(Some(serde_json::to_vec(&v)?)),
            None => Ok(None),
        }
    }

    async fn query_scalar(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<Option<String>> {
        let args = wrap(args);
        let stmt = self.prepare(sql, &args).await?;
        let row = self
            .client()?
            .query_opt(&stmt, &refs(&args))
            .await
            .map_err(pg_error)?;

        match row {
            Some(row) => row.try_get::<_, Option<String>>(0).map_err(pg_error),
            None => Ok(None),
        }
    }

    async fn execute(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<u64> {
        let args = wrap(args);
        let stmt = self.prepare(sql, &args).await?;
        self.client()?
            .execute(&stmt, &refs(&args))
            .await
            .map_err(pg_error)
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.is_closed() {
                self.idle.lock().push(client);
            }
        }
    }
}
