//! Active role resolution.

use soligraph_core::args::coerce_user_id;
use soligraph_core::{ArgValue, GqlResult, Identity};
use std::sync::Arc;

use crate::db::Connection;

/// Runs the configured role-determination query with `$1` bound to the
/// caller's user id.
#[derive(Debug, Clone)]
pub struct RoleQuery {
    sql: Arc<str>,
}

impl RoleQuery {
    pub fn new(sql: &str) -> Self {
        Self { sql: Arc::from(sql) }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// `None` when the caller is anonymous or the query yields no role.
    pub async fn resolve(&self, conn: &mut dyn Connection, identity: &Identity) -> GqlResult<Option<String>> {
        let Some(user_id) = identity.user_id.as_ref() else {
            return Ok(None);
        };
        let args: [ArgValue; 1] = [coerce_user_id("user_id", user_id)?];

        let role = conn.query_scalar(&self.sql, &args).await?;
        Ok(role.filter(|r| !r.is_empty()))
    }
}

/// Pick the role a request runs as.
///
/// An explicit role claim always wins. Otherwise the caller starts as
/// `user` or `anon`, and an authenticated caller may be promoted by the
/// role query.
pub async fn active_role(
    identity: &Identity,
    query: Option<&RoleQuery>,
    conn: &mut dyn Connection,
) -> GqlResult<String> {
    if let Some(role) = &identity.role {
        return Ok(role.clone());
    }

    let start = identity.default_role();
    match query {
        Some(q) if identity.is_authenticated() => match q.resolve(conn, identity).await? {
            Some(role) => {
                tracing::debug!(role = %role, "Role resolved by role query");
                Ok(role)
            }
            None => Ok(start.to_string()),
        },
        _ => Ok(start.to_string()),
    }
}
