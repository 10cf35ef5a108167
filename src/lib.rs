pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod scripting;
pub mod server;
pub mod validation;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineBuilder, QueryRequest, QueryResult};
pub use error::{ApiError, ApiResult};
pub use server::{create_router, AppState};
