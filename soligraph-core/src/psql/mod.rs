//! PostgreSQL rendering of mutation IRs.
//!
//! Every mutation node becomes one CTE of a single statement. Nodes fed by
//! the JSON action variable read their values from a typed record set
//! expanded out of `$1`. The final SELECT aggregates the rows returned by
//! the root nodes into one JSON object keyed by node key.

mod exp;
mod update_bulk;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{GqlError, GqlResult};
use crate::qcode::{Column, MType, QCode};
use crate::util::{quote_ident, quote_literal};

pub(crate) const INPUT_CTE: &str = "_sg_input";
pub(crate) const PARENT_PREFIX: &str = "_x_";

/// A positional parameter declared by a rendered statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub is_not_null: bool,
    #[serde(default)]
    pub is_array: bool,
}

impl Param {
    pub fn new(name: &str, param_type: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type: param_type.to_string(),
            is_not_null: false,
            is_array: false,
        }
    }
}

/// Parameter metadata of a rendered statement, in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    params: Vec<Param>,
    index: HashMap<String, usize>,
}

impl Metadata {
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Register a parameter once per name and return its 1-based placeholder.
    pub fn add_param(&mut self, param: Param) -> usize {
        if let Some(i) = self.index.get(&param.name) {
            return i + 1;
        }
        self.index.insert(param.name.clone(), self.params.len());
        self.params.push(param);
        self.params.len()
    }
}

/// Renders a compiled IR into SQL text plus parameter metadata.
pub trait SqlRenderer: Send + Sync {
    fn render(&self, qc: &QCode) -> GqlResult<(String, Metadata)>;
}

#[derive(Debug, Clone, Default)]
pub struct RenderConfig {
    /// Payload keys are lowerCamelCase versions of the IR's path segments.
    pub enable_camelcase: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PgRenderer {
    config: RenderConfig,
}

impl PgRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }
}

impl SqlRenderer for PgRenderer {
    fn render(&self, qc: &QCode) -> GqlResult<(String, Metadata)> {
        if !qc.qtype.is_mutation() {
            return Err(GqlError::OperationNotSupported(format!(
                "cannot render {} '{}' as a mutation",
                qc.qtype, qc.name
            )));
        }
        if qc.mutates.is_empty() {
            return Err(GqlError::Render(format!(
                "mutation '{}' has no tables",
                qc.name
            )));
        }
        check_order(qc)?;

        let mut ctx = Context {
            qc,
            config: &self.config,
            md: Metadata::default(),
            w: String::with_capacity(512),
        };
        ctx.render_statement()?;
        tracing::trace!(name = %qc.name, params = ctx.md.params().len(), "Rendered mutation");
        Ok((ctx.w, ctx.md))
    }
}

/// Parents and dependencies must be emitted before the nodes reading them.
fn check_order(qc: &QCode) -> GqlResult<()> {
    for (i, m) in qc.mutates.iter().enumerate() {
        for &r in m.parent_id.iter().chain(m.depends_on.iter()) {
            if r >= i {
                return Err(GqlError::Render(format!(
                    "table '{}' depends on node {} which is not rendered before it",
                    m.key, r
                )));
            }
        }
    }
    Ok(())
}

pub(crate) fn sql_type(col: &Column) -> String {
    if col.array {
        format!("{}[]", col.col_type)
    } else {
        col.col_type.clone()
    }
}

pub(crate) fn literal_sql(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

pub(crate) struct Context<'a> {
    qc: &'a QCode,
    config: &'a RenderConfig,
    md: Metadata,
    w: String,
}

impl Context<'_> {
    fn render_statement(&mut self) -> GqlResult<()> {
        let qc = self.qc;
        self.w.push_str("WITH ");

        if qc.mutates.iter().any(|m| m.is_json) {
            let var = qc.action_var.as_deref().ok_or_else(|| {
                GqlError::Render(format!(
                    "mutation '{}' reads a json payload but declares no action variable",
                    qc.name
                ))
            })?;
            let n = self.md.add_param(Param::new(var, "json"));
            self.w.push_str(&format!(
                "{} AS (SELECT ${} :: json AS j), ",
                quote_ident(INPUT_CTE),
                n
            ));
        }

        for (i, m) in qc.mutates.iter().enumerate() {
            if i != 0 {
                self.w.push_str(", ");
            }
            match m.mtype {
                MType::Update | MType::UpdateBulk => self.render_update(m)?,
                MType::Connect => self.render_connect(m)?,
                MType::Disconnect => self.render_disconnect(m)?,
                other => {
                    return Err(GqlError::OperationNotSupported(format!(
                        "{:?} on table '{}'",
                        other, m.ti.name
                    )))
                }
            }
        }

        self.w.push_str(" SELECT json_build_object(");
        for (i, m) in qc.mutates.iter().filter(|m| m.is_root()).enumerate() {
            if i != 0 {
                self.w.push_str(", ");
            }
            self.w.push_str(&format!(
                "{}, (SELECT json_agg(to_json(\"_sg_r\")) FROM {} AS \"_sg_r\")",
                quote_literal(&m.key),
                quote_ident(&m.key)
            ));
        }
        self.w.push_str(") AS \"__root\"");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autocol::{apply_to_column_list, AutoColumn, AutoValueSource, ColumnRule};
    use crate::identity::IdentityClaim;
    use crate::qcode::{Exp, ExpVal, MColumn, Mutate, RelColumn, RelType, Relation, TableInfo};
    use serde_json::{json, Map};

    fn mcol(name: &str, col_type: &str) -> MColumn {
        MColumn {
            col: Column::new(name, col_type),
            field_name: name.to_string(),
            value: None,
            auto: false,
        }
    }

    fn posts_table() -> TableInfo {
        TableInfo::new(
            "posts",
            vec![
                Column::primary("id", "bigint"),
                Column::new("title", "text"),
                Column::new("author_id", "bigint"),
                Column::new("updated_by", "bigint"),
            ],
        )
    }

    fn users_table() -> TableInfo {
        TableInfo::new(
            "users",
            vec![Column::primary("id", "bigint"), Column::new("name", "text")],
        )
    }

    fn node(id: usize, key: &str, mtype: MType, ti: TableInfo) -> Mutate {
        Mutate {
            id,
            key: key.to_string(),
            mtype,
            ti,
            cols: vec![],
            rel: None,
            parent_id: None,
            path: vec![],
            depends_on: vec![],
            is_json: false,
            where_exp: None,
            data: Map::new(),
            returning: vec![],
        }
    }

    fn mutation(mutates: Vec<Mutate>) -> QCode {
        let mut qc: QCode =
            serde_json::from_value(json!({"type": "update", "name": "m", "action_var": "data"}))
                .unwrap();
        qc.mutates = mutates;
        qc
    }

    fn render(qc: &QCode) -> GqlResult<(String, Metadata)> {
        PgRenderer::default().render(qc)
    }

    #[test]
    fn test_bulk_update_from_record_set() {
        let mut posts = node(0, "posts", MType::UpdateBulk, posts_table());
        posts.is_json = true;
        posts.cols = vec![mcol("title", "text")];

        let (sql, md) = render(&mutation(vec![posts])).unwrap();

        assert_eq!(
            sql,
            "WITH \"_sg_input\" AS (SELECT $1 :: json AS j), \
             \"posts\" AS (UPDATE \"public\".\"posts\" SET \"title\" = t.\"title\" :: text \
             FROM \"_sg_input\" i, json_to_recordset(CASE json_typeof(i.j) WHEN 'array' THEN i.j \
             ELSE json_build_array(i.j) END) AS t(\"title\" text, \"id\" bigint) \
             WHERE ((\"posts\".\"id\") = (t.\"id\")) RETURNING \"posts\".*) \
             SELECT json_build_object('posts', (SELECT json_agg(to_json(\"_sg_r\")) FROM \"posts\" AS \"_sg_r\")) \
             AS \"__root\""
        );
        assert_eq!(sql.matches("UPDATE ").count(), 1);
        assert_eq!(md.params(), &[Param::new("data", "json")]);
        assert_eq!(md.param_index("data"), Some(0));
    }

    #[test]
    fn test_bulk_update_with_filter_keeps_key_match() {
        let mut posts = node(0, "posts", MType::UpdateBulk, posts_table());
        posts.is_json = true;
        posts.cols = vec![mcol("title", "text")];
        posts.where_exp = Some(Exp::eq("author_id", ExpVal::Var("author".to_string())));

        let (sql, md) = render(&mutation(vec![posts])).unwrap();

        assert!(sql.contains(
            "WHERE ((\"posts\".\"id\") = (t.\"id\")) AND ((\"posts\".\"author_id\") = ($2 :: bigint)) \
             RETURNING \"posts\".*"
        ));
        let names: Vec<_> = md.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["data", "author"]);
    }

    #[test]
    fn test_update_with_filter_and_auto_column() {
        let mut posts = node(0, "posts", MType::Update, posts_table());
        posts.is_json = true;
        posts.cols = vec![mcol("title", "text")];
        posts.where_exp = Some(Exp::eq("id", ExpVal::Var("id".to_string())));
        let mut qc = mutation(vec![posts]);

        let rules = vec![AutoColumn::new(
            "updated_by",
            ColumnRule::Upsert,
            AutoValueSource::Claim(IdentityClaim::UserId),
        )];
        apply_to_column_list(&mut qc, &rules).unwrap();

        let (sql, md) = render(&qc).unwrap();
        assert!(sql.contains(
            "SET \"title\" = t.\"title\" :: text, \"updated_by\" = t.\"updated_by\" :: bigint"
        ));
        assert!(sql.contains("WHERE ((\"posts\".\"id\") = ($2 :: bigint))"));
        let names: Vec<_> = md.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["data", "id"]);
    }

    #[test]
    fn test_auto_column_on_discrete_node_binds_as_param() {
        let mut posts = node(0, "posts", MType::Update, posts_table());
        posts.cols = vec![mcol("title", "text")];
        posts.where_exp = Some(Exp::eq("id", ExpVal::Var("id".to_string())));
        let mut qc = mutation(vec![posts]);

        let rules = vec![AutoColumn::new(
            "updated_by",
            ColumnRule::Upsert,
            AutoValueSource::Claim(IdentityClaim::UserId),
        )];
        apply_to_column_list(&mut qc, &rules).unwrap();

        let (sql, md) = render(&qc).unwrap();
        assert!(!sql.contains("_sg_input"));
        assert!(sql.contains("SET \"title\" = $1 :: text, \"updated_by\" = $2 :: bigint"));
        let names: Vec<_> = md.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["title", "__auto_updated_by", "id"]);
    }

    #[test]
    fn test_nested_path_expansion() {
        let mut users = node(0, "users", MType::Update, users_table());
        users.is_json = true;
        users.cols = vec![mcol("name", "text")];
        users.where_exp = Some(Exp::eq("id", ExpVal::Var("id".to_string())));

        let mut posts = node(1, "posts", MType::UpdateBulk, posts_table());
        posts.is_json = true;
        posts.cols = vec![mcol("title", "text")];
        posts.parent_id = Some(0);
        posts.path = vec!["user_posts".to_string(), "items".to_string()];
        posts.rel = Some(Relation {
            rel_type: RelType::OneToMany,
            left: RelColumn { table: "posts".to_string(), col: "author_id".to_string() },
            right: RelColumn { table: "users".to_string(), col: "id".to_string() },
        });

        let renderer = PgRenderer::new(RenderConfig { enable_camelcase: true });
        let (sql, _) = renderer.render(&mutation(vec![users, posts])).unwrap();

        assert!(sql.contains(
            "\"posts\" AS (WITH \"_x_users\" AS (SELECT DISTINCT \"id\" FROM \"users\") UPDATE"
        ));
        assert!(sql.contains(
            "json_to_recordset(CASE json_typeof(i.j->'userPosts') WHEN 'array' THEN i.j->'userPosts' \
             ELSE json_build_array(i.j->'userPosts') END) AS \"_r0\"(\"items\" json)"
        ));
        assert!(sql.contains("json_to_recordset(CASE json_typeof(\"_r0\".\"items\")"));
        assert!(sql.contains(
            "WHERE ((\"posts\".\"author_id\") = (\"_x_users\".\"id\")) AND ((\"posts\".\"id\") = (t.\"id\"))"
        ));
        // Only the root node is returned.
        assert!(sql.contains("json_build_object('users',"));
        assert!(!sql.contains("'posts', (SELECT"));
    }

    fn connect_qc(mtype: MType, rel_type: RelType) -> QCode {
        let mut users = node(0, "users", MType::Update, users_table());
        users.cols = vec![mcol("name", "text")];
        users.where_exp = Some(Exp::eq("id", ExpVal::Var("id".to_string())));

        let mut posts = node(1, "posts", mtype, posts_table());
        posts.parent_id = Some(0);
        posts.where_exp = Some(Exp::eq("id", ExpVal::Var("post_id".to_string())));
        posts.rel = Some(Relation {
            rel_type,
            left: RelColumn { table: "posts".to_string(), col: "author_id".to_string() },
            right: RelColumn { table: "users".to_string(), col: "id".to_string() },
        });
        mutation(vec![users, posts])
    }

    #[test]
    fn test_connect_sets_foreign_key() {
        let (sql, md) = render(&connect_qc(MType::Connect, RelType::OneToOne)).unwrap();
        assert!(sql.contains(
            "\"posts\" AS (UPDATE \"public\".\"posts\" SET \"author_id\" = \"_x_users\".\"id\" \
             FROM \"users\" AS \"_x_users\" WHERE ((\"posts\".\"id\") = ($3 :: bigint)) RETURNING \"posts\".*)"
        ));
        assert!(!sql.contains("json_to_recordset"));
        let names: Vec<_> = md.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["name", "id", "post_id"]);
    }

    #[test]
    fn test_disconnect_clears_foreign_key() {
        let (sql, _) = render(&connect_qc(MType::Disconnect, RelType::OneToOne)).unwrap();
        assert!(sql.contains("SET \"author_id\" = NULL FROM \"users\" AS \"_x_users\""));
        assert!(sql.contains(
            "WHERE ((\"posts\".\"author_id\") = (\"_x_users\".\"id\")) AND ((\"posts\".\"id\") = ($3 :: bigint))"
        ));
        assert!(!sql.contains("\"author_id\" = \"_x_users\""));
    }

    #[test]
    fn test_connect_requires_one_to_one() {
        let err = render(&connect_qc(MType::Connect, RelType::OneToMany)).unwrap_err();
        assert!(matches!(err, GqlError::OperationNotSupported(_)));
    }

    #[test]
    fn test_out_of_order_nodes_rejected() {
        let mut qc = connect_qc(MType::Connect, RelType::OneToOne);
        qc.mutates.swap(0, 1);
        qc.mutates[0].parent_id = Some(1);
        qc.mutates[1].parent_id = None;
        let err = render(&qc).unwrap_err();
        assert!(matches!(err, GqlError::Render(ref m) if m.contains("not rendered before")));
    }

    #[test]
    fn test_unsupported_operations() {
        let query: QCode = serde_json::from_value(json!({"type": "query", "name": "q"})).unwrap();
        assert!(matches!(render(&query), Err(GqlError::OperationNotSupported(_))));

        let mut insert = node(0, "posts", MType::Insert, posts_table());
        insert.cols = vec![mcol("title", "text")];
        assert!(matches!(
            render(&mutation(vec![insert])),
            Err(GqlError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_discrete_update_without_filter_fails() {
        let mut posts = node(0, "posts", MType::Update, posts_table());
        posts.cols = vec![mcol("title", "text")];
        assert!(matches!(
            render(&mutation(vec![posts])),
            Err(GqlError::Render(_))
        ));
    }

    #[test]
    fn test_metadata_dedupes_params() {
        let mut md = Metadata::default();
        assert_eq!(md.add_param(Param::new("a", "text")), 1);
        assert_eq!(md.add_param(Param::new("b", "int")), 2);
        assert_eq!(md.add_param(Param::new("a", "text")), 1);
        assert_eq!(md.params().len(), 2);
    }
}
