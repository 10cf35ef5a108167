//! Database access
//!
//! The engine only talks to the database through these traits: one pooled
//! connection is acquired per request and returned to the pool when the
//! boxed connection is dropped, whatever stage of the request failed.

pub mod postgres;

use async_trait::async_trait;
use soligraph_core::{ArgValue, GqlResult};

pub use postgres::PgPool;

/// One pooled connection.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement that yields a single JSON-aggregated row. `None`
    /// means the statement produced no row (or a NULL root).
    async fn query_json(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<Option<Vec<u8>>>;

    /// Run a statement that yields at most one text value.
    async fn query_scalar(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<Option<String>>;

    /// Run a statement for its side effects.
    async fn execute(&mut self, sql: &str, args: &[ArgValue]) -> GqlResult<u64>;
}

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Acquire a connection; it is released when dropped.
    async fn acquire(&self) -> GqlResult<Box<dyn Connection>>;
}
