use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use soligraph_core::{FieldError, GqlError};
use thiserror::Error;

/// Errors surfaced by the HTTP layer.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] GqlError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(err) => match err {
                GqlError::RequiredVariableMissing { .. }
                | GqlError::NullNotAllowed(_)
                | GqlError::ArrayTypeMismatch { .. }
                | GqlError::JsonTypeMismatch(_)
                | GqlError::IdentityClaimTypeMismatch { .. }
                | GqlError::ValidationFailed(_)
                | GqlError::Compilation(_)
                | GqlError::Json(_) => StatusCode::BAD_REQUEST,
                GqlError::UnknownRole(_) | GqlError::Forbidden(_) => StatusCode::FORBIDDEN,
                GqlError::OperationNotSupported(_) => StatusCode::NOT_IMPLEMENTED,
                GqlError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
                GqlError::Database { transient: true, .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Engine(err) => err.kind(),
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::BadRequest(_) => "BadRequest",
        }
    }

    fn fields(&self) -> Option<&[FieldError]> {
        match self {
            ApiError::Engine(GqlError::ValidationFailed(fields)) => Some(fields),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16(),
            "type": self.kind(),
        });
        if let Some(fields) = self.fields() {
            body["fields"] = serde_json::json!(fields);
        }

        (status, Json(body)).into_response()
    }
}
