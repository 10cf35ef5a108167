//! Engine configuration
//!
//! Loaded from a TOML file (conventionally `soligraph.toml`). Every field has
//! a default so an empty file yields a usable development configuration.
//!
//! ## Environment Variables
//!
//! - `SOLIGRAPH_DATABASE_URL` - overrides `database.url`
//! - `SOLIGRAPH_JWT_SECRET` - overrides `jwt_secret`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use soligraph_core::autocol::builtin_generator;
use soligraph_core::{
    AutoColumn, AutoValueSource, ColumnRule, DefaultVar, DefaultVars, IdentityClaim, QType,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_DATABASE_URL: &str = "SOLIGRAPH_DATABASE_URL";
pub const ENV_JWT_SECRET: &str = "SOLIGRAPH_JWT_SECRET";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache compiled statements and hide per-field validation logs.
    #[serde(default)]
    pub production: bool,
    /// Log every executed statement.
    #[serde(default)]
    pub debug: bool,
    /// Run `set_config('user.id', ...)` on the connection before executing.
    #[serde(default)]
    pub set_user_id: bool,
    #[serde(default)]
    pub enable_camelcase: bool,
    #[serde(default = "default_schema")]
    pub default_schema: String,
    /// Role-determination query, `$1` is the user id.
    #[serde(default)]
    pub roles_query: Option<String>,
    #[serde(default = "default_roles")]
    pub roles: Vec<RoleConfig>,
    #[serde(default)]
    pub auto_columns: Vec<AutoColumnConfig>,
    #[serde(default)]
    pub default_vars: HashMap<String, Value>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scripts_dir: Option<PathBuf>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_roles() -> Vec<RoleConfig> {
    vec![RoleConfig::new("anon"), RoleConfig::new("user")]
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

/// A role statements may be compiled for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    /// Mutations are refused for this role.
    #[serde(default)]
    pub read_only: bool,
}

impl RoleConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    50
}

fn default_max_delay() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// How long a request waits for a free connection.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_database_url() -> String {
    "postgres://postgres@localhost:5432/postgres".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_acquire_timeout() -> u64 {
    2_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Auto column as written in the configuration file. Exactly one of
/// `value`, `generator` and `claim` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoColumnConfig {
    pub name: String,
    #[serde(default = "default_qtypes")]
    pub qtypes: Vec<QType>,
    pub rule: ColumnRule,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub generator: Option<String>,
    #[serde(default)]
    pub claim: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
}

fn default_qtypes() -> Vec<QType> {
    vec![QType::Insert, QType::Update, QType::Upsert]
}

impl AutoColumnConfig {
    pub fn to_auto_column(&self) -> Result<AutoColumn, ConfigError> {
        let source = match (&self.value, &self.generator, &self.claim) {
            (Some(v), None, None) => AutoValueSource::Static(v.clone()),
            (None, Some(g), None) => {
                let f = builtin_generator(g).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "auto column '{}': unknown generator '{}'",
                        self.name, g
                    ))
                })?;
                AutoValueSource::Generator(f)
            }
            (None, None, Some(c)) => {
                let claim = IdentityClaim::from_param(c).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "auto column '{}': unknown claim '{}'",
                        self.name, c
                    ))
                })?;
                AutoValueSource::Claim(claim)
            }
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "auto column '{}' needs exactly one of value, generator or claim",
                    self.name
                )))
            }
        };

        Ok(AutoColumn::new(&self.name, self.rule, source)
            .with_qtypes(self.qtypes.clone())
            .for_tables(self.tables.clone()))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            production: false,
            debug: false,
            set_user_id: false,
            enable_camelcase: false,
            default_schema: default_schema(),
            roles_query: None,
            roles: default_roles(),
            auto_columns: Vec::new(),
            default_vars: HashMap::new(),
            retry: RetryConfig::default(),
            request_timeout_ms: default_request_timeout(),
            database: DatabaseConfig::default(),
            scripts_dir: None,
            jwt_secret: None,
            listen: default_listen(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.check()?;
        Ok(config)
    }

    /// Load the file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Override secrets from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            self.database.url = url;
        }
        if let Ok(secret) = std::env::var(ENV_JWT_SECRET) {
            self.jwt_secret = Some(secret);
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.roles.is_empty() {
            return Err(ConfigError::Invalid("at least one role is required".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        self.auto_column_rules().map(|_| ())
    }

    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn auto_column_rules(&self) -> Result<Vec<AutoColumn>, ConfigError> {
        self.auto_columns.iter().map(|c| c.to_auto_column()).collect()
    }

    pub fn default_var_map(&self) -> DefaultVars {
        self.default_vars
            .iter()
            .map(|(k, v)| (k.clone(), DefaultVar::Static(v.clone())))
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
