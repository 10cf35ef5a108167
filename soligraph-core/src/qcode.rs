//! Compiled query representation (IR).
//!
//! A `QCode` is produced once per (namespace, name, role) by the upstream
//! query compiler and is read-only after compilation completes. Only the
//! fields the mutation pipeline needs are modelled here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::valid::Constraint;

fn default_schema() -> String {
    "public".to_string()
}

/// Statement kind of a compiled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QType {
    Query,
    Subscription,
    Insert,
    Update,
    Upsert,
    Delete,
}

impl QType {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, QType::Query | QType::Subscription)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QType::Query => "query",
            QType::Subscription => "subscription",
            QType::Insert => "insert",
            QType::Update => "update",
            QType::Upsert => "upsert",
            QType::Delete => "delete",
        }
    }
}

impl fmt::Display for QType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-table mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MType {
    Insert,
    Update,
    Upsert,
    Delete,
    UpdateBulk,
    Connect,
    Disconnect,
}

impl MType {
    /// Statement kind this node contributes to, used to match auto-column
    /// applicability. Connect and disconnect only move foreign keys.
    pub fn qtype(&self) -> Option<QType> {
        match self {
            MType::Insert => Some(QType::Insert),
            MType::Update | MType::UpdateBulk => Some(QType::Update),
            MType::Upsert => Some(QType::Upsert),
            MType::Delete => Some(QType::Delete),
            MType::Connect | MType::Disconnect => None,
        }
    }
}

/// A column of a database table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub array: bool,
}

impl Column {
    pub fn new(name: &str, col_type: &str) -> Self {
        Self {
            name: name.to_string(),
            col_type: col_type.to_string(),
            primary_key: false,
            array: false,
        }
    }

    pub fn primary(name: &str, col_type: &str) -> Self {
        Self {
            primary_key: true,
            ..Self::new(name, col_type)
        }
    }
}

/// Schema metadata for the table a mutation targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl TableInfo {
    pub fn new(name: &str, columns: Vec<Column>) -> Self {
        Self {
            schema: default_schema(),
            name: name.to_string(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }
}

/// One entry of a mutation's column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MColumn {
    pub col: Column,
    /// Field name carrying the value in the payload.
    pub field_name: String,
    /// Literal value, when the column is not fed from the payload.
    #[serde(default)]
    pub value: Option<Value>,
    /// Filled in by an auto-column rule rather than the caller.
    #[serde(skip_deserializing)]
    pub auto: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelType {
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelColumn {
    pub table: String,
    pub col: String,
}

/// Join between a mutated table (left) and its parent (right).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(rename = "type")]
    pub rel_type: RelType,
    pub left: RelColumn,
    pub right: RelColumn,
}

/// Comparison operator of a filter expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl CmpOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::In => "= ANY",
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExpVal {
    /// Inline literal.
    Literal(Value),
    /// Named request variable, bound as a statement parameter.
    Var(String),
    /// Field of the node's own JSON record; the first segment is a record
    /// field, the rest a path inside it.
    Input(Vec<String>),
}

/// Filter expression attached to a mutation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Exp {
    And { children: Vec<Exp> },
    Or { children: Vec<Exp> },
    Not { child: Box<Exp> },
    Cmp { col: String, cmp: CmpOp, val: ExpVal },
    IsNull { col: String, is_null: bool },
}

impl Exp {
    pub fn eq(col: &str, val: ExpVal) -> Self {
        Exp::Cmp {
            col: col.to_string(),
            cmp: CmpOp::Eq,
            val,
        }
    }
}

/// One table's worth of mutation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutate {
    pub id: usize,
    /// Key naming this node in the payload and in the generated CTE.
    pub key: String,
    #[serde(rename = "type")]
    pub mtype: MType,
    pub ti: TableInfo,
    #[serde(default)]
    pub cols: Vec<MColumn>,
    #[serde(default)]
    pub rel: Option<Relation>,
    /// Index of the parent node; `None` for a root node.
    #[serde(default)]
    pub parent_id: Option<usize>,
    /// Path into the action variable locating this node's record(s).
    #[serde(default)]
    pub path: Vec<String>,
    /// Nodes whose CTEs this one reads from.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// Values come from the JSON action variable rather than discrete parameters.
    #[serde(default)]
    pub is_json: bool,
    #[serde(default, rename = "where")]
    pub where_exp: Option<Exp>,
    /// Payload fragment: column name to value, mirrored for re-serialization.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Fields captured by RETURNING; empty means every column.
    #[serde(default)]
    pub returning: Vec<String>,
}

impl Mutate {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.col.name == name)
    }
}

/// Declared validation step; the validator is resolved by `vtype`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    #[serde(rename = "type")]
    pub vtype: String,
    pub source: String,
}

/// Declared server-side script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDecl {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    #[serde(default)]
    pub header: String,
}

/// Role-scoped compiled representation of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QCode {
    #[serde(rename = "type")]
    pub qtype: QType,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub mutates: Vec<Mutate>,
    /// Name of the single JSON variable carrying the mutation payload.
    #[serde(default)]
    pub action_var: Option<String>,
    #[serde(default)]
    pub validation: Option<Validation>,
    #[serde(default)]
    pub script: Option<ScriptDecl>,
    #[serde(default)]
    pub cache: CacheMeta,
    #[serde(default)]
    pub consts: Option<BTreeMap<String, Vec<Constraint>>>,
    /// Number of remote joins to resolve after execution.
    #[serde(default)]
    pub remotes: usize,
}

impl QCode {
    /// Keys of every table participating in the mutation, in node order.
    pub fn mutated_keys(&self) -> Vec<String> {
        self.mutates.iter().map(|m| m.key.clone()).collect()
    }

    pub fn mutate_by_key(&self, key: &str) -> Option<&Mutate> {
        self.mutates.iter().find(|m| m.key == key)
    }
}
