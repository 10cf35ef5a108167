//! Error types for soligraph-core.
//!
//! Every error is `Clone` so a failed compilation can be cached and handed
//! to every request waiting on the same statement.

use serde::Serialize;
use thiserror::Error;

/// A single failed constraint on a request variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum GqlError {
    #[error("role '{0}' is not defined")]
    UnknownRole(String),

    #[error("no validator found for '{0}'")]
    MissingValidator(String),

    #[error("validation failed: {} field error(s)", .0.len())]
    ValidationFailed(Vec<FieldError>),

    #[error("required variable '{name}' of type '{var_type}' must be set")]
    RequiredVariableMissing { name: String, var_type: String },

    #[error("variable '{0}' cannot be null")]
    NullNotAllowed(String),

    #[error("variable '{name}' should be an array of type '{var_type}'")]
    ArrayTypeMismatch { name: String, var_type: String },

    #[error("variable '{0}' should be an array or object")]
    JsonTypeMismatch(String),

    #[error("{name} must be an integer or a string: {observed}")]
    IdentityClaimTypeMismatch { name: String, observed: String },

    #[error("database error: {message}")]
    Database { message: String, transient: bool },

    #[error("compilation failed: {0}")]
    Compilation(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type GqlResult<T> = Result<T, GqlError>;

impl GqlError {
    /// Transient database failure worth retrying.
    pub fn transient_db(message: impl Into<String>) -> Self {
        GqlError::Database {
            message: message.into(),
            transient: true,
        }
    }

    /// Database failure that must surface immediately.
    pub fn fatal_db(message: impl Into<String>) -> Self {
        GqlError::Database {
            message: message.into(),
            transient: false,
        }
    }

    pub fn required(name: impl Into<String>, var_type: impl Into<String>) -> Self {
        GqlError::RequiredVariableMissing {
            name: name.into(),
            var_type: var_type.into(),
        }
    }

    /// Whether a retry policy may re-run the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GqlError::Database {
                transient: true,
                ..
            }
        )
    }

    /// Short variant name, used as the error `type` in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            GqlError::UnknownRole(_) => "UnknownRole",
            GqlError::MissingValidator(_) => "MissingValidator",
            GqlError::ValidationFailed(_) => "ValidationFailed",
            GqlError::RequiredVariableMissing { .. } => "RequiredVariableMissing",
            GqlError::NullNotAllowed(_) => "NullNotAllowed",
            GqlError::ArrayTypeMismatch { .. } => "ArrayTypeMismatch",
            GqlError::JsonTypeMismatch(_) => "JSONTypeMismatch",
            GqlError::IdentityClaimTypeMismatch { .. } => "IdentityClaimTypeMismatch",
            GqlError::Database { .. } => "DatabaseError",
            GqlError::Compilation(_) => "CompilationError",
            GqlError::Render(_) => "RenderError",
            GqlError::OperationNotSupported(_) => "OperationNotSupported",
            GqlError::Script(_) => "ScriptError",
            GqlError::Json(_) => "JsonError",
            GqlError::Forbidden(_) => "Forbidden",
            GqlError::Cancelled(_) => "Cancelled",
            GqlError::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for GqlError {
    fn from(err: serde_json::Error) -> Self {
        GqlError::Json(err.to_string())
    }
}

impl Serialize for GqlError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
