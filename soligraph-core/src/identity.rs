//! Caller identity threaded explicitly through compilation and binding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity claims of the caller. Absence is distinct from an empty string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// User id claim; integers and strings are accepted, floats are truncated.
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub user_id_raw: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<Value>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_raw_id(mut self, raw: impl Into<String>) -> Self {
        self.user_id_raw = Some(raw.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// Role a request starts with before any explicit claim or role query.
    pub fn default_role(&self) -> &'static str {
        if self.is_authenticated() {
            "user"
        } else {
            "anon"
        }
    }

    pub fn claim(&self, claim: IdentityClaim) -> Option<Value> {
        match claim {
            IdentityClaim::UserId => self.user_id.clone(),
            IdentityClaim::UserIdRaw => self.user_id_raw.clone().map(Value::String),
            IdentityClaim::UserIdProvider => self.provider.clone().map(Value::String),
            IdentityClaim::UserRole => self.role.clone().map(Value::String),
        }
    }
}

/// Reserved identity claims usable as parameters and auto-column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityClaim {
    UserId,
    UserIdRaw,
    UserIdProvider,
    UserRole,
}

impl IdentityClaim {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityClaim::UserId => "user_id",
            IdentityClaim::UserIdRaw => "user_id_raw",
            IdentityClaim::UserIdProvider => "user_id_provider",
            IdentityClaim::UserRole => "user_role",
        }
    }

    /// Match a declared parameter name, including its casing variants.
    pub fn from_param(name: &str) -> Option<Self> {
        match name {
            "user_id" | "userID" | "userId" => Some(IdentityClaim::UserId),
            "user_id_raw" | "userIDRaw" | "userIdRaw" => Some(IdentityClaim::UserIdRaw),
            "user_id_provider" | "userIDProvider" | "userIdProvider" => {
                Some(IdentityClaim::UserIdProvider)
            }
            "user_role" | "userRole" => Some(IdentityClaim::UserRole),
            _ => None,
        }
    }
}
