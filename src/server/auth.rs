use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use soligraph_core::Identity;

use super::handlers::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Overrides `sub` as the bound user id; may be numeric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

impl Claims {
    pub fn into_identity(self) -> Identity {
        let mut identity = match (self.user_id, self.sub.as_deref()) {
            (Some(id), _) => Identity::user(id),
            (None, Some(sub)) if !sub.is_empty() => Identity::user(sub),
            _ => Identity::anonymous(),
        };
        if let Some(sub) = self.sub {
            identity = identity.with_raw_id(sub);
        }
        if let Some(provider) = self.provider {
            identity = identity.with_provider(provider);
        }
        if let Some(role) = self.role {
            identity = identity.with_role(role);
        }
        identity
    }
}

/// HS256 token verification.
pub struct JwtAuth {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn create_token(&self, claims: &Claims) -> ApiResult<String> {
        encode(&Header::default(), claims, &self.encoding)
            .map_err(|e| ApiError::BadRequest(format!("Token creation failed: {}", e)))
    }

    pub fn validate_token(&self, token: &str) -> ApiResult<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized("Invalid token".to_string()))
    }
}

/// Resolve the caller from the `Authorization` header. A missing header
/// means an anonymous caller.
pub fn identity_from_headers(auth: Option<&JwtAuth>, headers: &HeaderMap) -> ApiResult<Identity> {
    let Some(header) = headers.get("Authorization") else {
        return Ok(Identity::anonymous());
    };
    let token = header
        .to_str()
        .ok()
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Expected a bearer token".to_string()))?;
    let auth = auth.ok_or_else(|| {
        ApiError::Unauthorized("Token authentication is not configured".to_string())
    })?;
    Ok(auth.validate_token(token)?.into_identity())
}

/// Axum middleware attaching the caller's `Identity` to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = identity_from_headers(state.auth.as_deref(), req.headers())?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
