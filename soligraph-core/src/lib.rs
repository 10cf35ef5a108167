//! Soligraph Core - Storage-independent mutation pipeline.
//!
//! This crate holds everything between a compiled query (the IR) and the
//! SQL statement plus positional arguments sent to PostgreSQL. It performs
//! no I/O and can be used by the server as well as by offline tooling.
//!
//! # Main Components
//!
//! - **QCode**: the role-scoped compiled query representation
//! - **Renderer**: turns mutation IRs into one multi-CTE PostgreSQL statement
//! - **Auto columns**: system-managed columns injected into column lists and payloads
//! - **Binder**: resolves declared parameters from identity, variables and defaults
//!
//! # Example
//!
//! ```rust
//! use soligraph_core::{PgRenderer, QCode, SqlRenderer};
//! use serde_json::json;
//!
//! let qc: QCode = serde_json::from_value(json!({
//!     "type": "update",
//!     "name": "renamePosts",
//!     "action_var": "data",
//!     "mutates": [{
//!         "id": 0,
//!         "key": "posts",
//!         "type": "update_bulk",
//!         "is_json": true,
//!         "ti": {"name": "posts", "columns": [
//!             {"name": "id", "type": "bigint", "primary_key": true},
//!             {"name": "title", "type": "text"}
//!         ]},
//!         "cols": [{"col": {"name": "title", "type": "text"}, "field_name": "title"}]
//!     }]
//! }))
//! .unwrap();
//!
//! let (sql, md) = PgRenderer::default().render(&qc).unwrap();
//! assert!(sql.contains("json_to_recordset"));
//! assert_eq!(md.params()[0].name, "data");
//! ```

pub mod args;
pub mod autocol;
pub mod error;
pub mod identity;
pub mod psql;
pub mod qcode;
pub mod util;
pub mod valid;

// Re-export main types for convenience
pub use args::{ArgBinder, ArgValue, Args, DefaultVar, DefaultVars, VarMap};
pub use autocol::{
    apply_to_column_list, AutoColumn, AutoValueSource, AutoValues, ColumnRule, PayloadInjector,
};
pub use error::{FieldError, GqlError, GqlResult};
pub use identity::{Identity, IdentityClaim};
pub use psql::{Metadata, Param, PgRenderer, RenderConfig, SqlRenderer};
pub use qcode::{MType, Mutate, QCode, QType};
pub use valid::{Constraint, ConstValidator};
