use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use soligraph_core::{GqlError, Identity};
use std::sync::Arc;

use super::auth::JwtAuth;
use crate::engine::{Engine, QueryRequest};
use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub auth: Option<Arc<JwtAuth>>,
}

impl AppState {
    pub fn new(engine: Engine, jwt_secret: Option<&str>) -> Self {
        Self {
            engine,
            auth: jwt_secret.map(|s| Arc::new(JwtAuth::new(s))),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GraphQLResponse {
    pub data: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

pub async fn execute_graphql(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Response> {
    if req.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query is required".to_string()));
    }

    let result = state.engine.execute(&req, &identity).await?;

    let data = match result.data {
        Some(bytes) => {
            let text = String::from_utf8(bytes)
                .map_err(|e| GqlError::Internal(format!("result is not UTF-8: {}", e)))?;
            Some(RawValue::from_string(text).map_err(GqlError::from)?)
        }
        None => None,
    };

    let mut response = Json(GraphQLResponse {
        data,
        hash: result.hash,
    })
    .into_response();

    if let Some(value) = result
        .cache_header
        .as_deref()
        .and_then(|h| HeaderValue::from_str(h).ok())
    {
        response.headers_mut().insert(header::CACHE_CONTROL, value);
    }
    Ok(response)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.engine.cache_stats();
    Json(json!({
        "status": "ok",
        "production": state.engine.is_production(),
        "cache": {
            "entries": stats.entries,
            "hits": stats.hits,
            "misses": stats.misses,
            "hit_rate": stats.hit_rate(),
        }
    }))
}
