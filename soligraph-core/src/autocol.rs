//! System-managed columns ("auto columns").
//!
//! Auto columns are injected in two places:
//!
//! - at compile time into each mutation node's column list, so the rendered
//!   SQL sets them (`apply_to_column_list`);
//! - at bind time into the JSON payload the SQL reads its values from
//!   (`PayloadInjector`), either by walking nested records whose keys match
//!   mutated tables or by following each node's JSON path.
//!
//! Rules are scoped per table: a rule only applies to a node whose table
//! has the target column, whose mutation type the rule permits, and whose
//! table is listed in the rule's table scope when one is given.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::args::coerce_user_id;
use crate::error::{GqlError, GqlResult};
use crate::identity::{Identity, IdentityClaim};
use crate::qcode::{MColumn, MType, Mutate, QCode, QType};
use crate::util::{to_camel, to_snake};

/// Parameter name prefix under which auto columns of nodes not fed by the
/// JSON payload are bound.
pub const AUTO_PARAM_PREFIX: &str = "__auto_";

/// Auto-column values actually applied, keyed by table key.
pub type AutoValues = BTreeMap<String, Vec<Map<String, Value>>>;

/// Zero-argument value producer invoked at injection time.
pub type ValueFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// When a rule fires relative to the caller-supplied columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRule {
    /// Add the column when inserting and the caller did not set it.
    Insert,
    /// Overwrite the column when updating and the caller set it.
    Update,
    /// Always set the column.
    Upsert,
}

impl ColumnRule {
    pub fn permits(&self, mtype: MType) -> bool {
        match self {
            ColumnRule::Insert => matches!(mtype, MType::Insert | MType::Upsert),
            ColumnRule::Update => {
                matches!(mtype, MType::Update | MType::UpdateBulk | MType::Upsert)
            }
            ColumnRule::Upsert => true,
        }
    }
}

#[derive(Clone)]
pub enum AutoValueSource {
    Static(Value),
    Generator(ValueFn),
    Claim(IdentityClaim),
}

impl fmt::Debug for AutoValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoValueSource::Static(v) => write!(f, "Static({})", v),
            AutoValueSource::Generator(_) => f.write_str("Generator(..)"),
            AutoValueSource::Claim(c) => write!(f, "Claim({})", c.as_str()),
        }
    }
}

/// Built-in value generators available to configuration files.
pub fn builtin_generator(name: &str) -> Option<ValueFn> {
    let f: ValueFn = match name {
        "now" => Arc::new(|| Value::String(chrono::Utc::now().to_rfc3339())),
        "uuid" => Arc::new(|| Value::String(uuid::Uuid::new_v4().to_string())),
        "uuid_v7" => Arc::new(|| {
            Value::String(uuid::Uuid::new_v7(uuid::Timestamp::now(uuid::NoContext)).to_string())
        }),
        _ => return None,
    };
    Some(f)
}

/// A configured system-managed column.
#[derive(Debug, Clone)]
pub struct AutoColumn {
    /// Target column name.
    pub name: String,
    /// Statement kinds the column applies to.
    pub qtypes: Vec<QType>,
    pub rule: ColumnRule,
    pub source: AutoValueSource,
    /// Restrict the rule to these tables; empty means every table having the column.
    pub tables: Vec<String>,
}

impl AutoColumn {
    pub fn new(name: &str, rule: ColumnRule, source: AutoValueSource) -> Self {
        Self {
            name: name.to_string(),
            qtypes: vec![QType::Insert, QType::Update, QType::Upsert],
            rule,
            source,
            tables: Vec::new(),
        }
    }

    pub fn with_qtypes(mut self, qtypes: Vec<QType>) -> Self {
        self.qtypes = qtypes;
        self
    }

    pub fn for_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    /// Whether this rule may touch the given mutation node.
    pub fn applies_to(&self, m: &Mutate) -> bool {
        let Some(qtype) = m.mtype.qtype() else {
            return false;
        };
        self.qtypes.contains(&qtype)
            && self.rule.permits(m.mtype)
            && (self.tables.is_empty()
                || self.tables.iter().any(|t| *t == m.ti.name || *t == m.key))
            && m.ti.column(&self.name).is_some()
    }

    /// Resolve the value to inject. Claim-sourced values need an identity;
    /// without one (at compile time) they resolve to `None`.
    pub fn resolve(&self, identity: Option<&Identity>) -> GqlResult<Option<Value>> {
        match &self.source {
            AutoValueSource::Static(v) => Ok(Some(v.clone())),
            AutoValueSource::Generator(f) => Ok(Some(f())),
            AutoValueSource::Claim(claim) => {
                let Some(identity) = identity else {
                    return Ok(None);
                };
                match (claim, identity.claim(*claim)) {
                    (IdentityClaim::UserId, Some(v)) => {
                        Ok(Some(coerce_user_id(claim.as_str(), &v)?.to_json()))
                    }
                    (_, Some(v)) => Ok(Some(v)),
                    (_, None) => Err(GqlError::required(claim.as_str(), "claim")),
                }
            }
        }
    }
}

/// Add every applicable auto column to each node's column list.
///
/// Insert rules append a missing column, update rules overwrite a column
/// the caller set, upsert rules do either. Applied values are mirrored into
/// the node's payload fragment and returned keyed by table. Nodes fed by the
/// JSON payload read the column from the payload; other nodes bind it as a
/// parameter named with `AUTO_PARAM_PREFIX`, resolved per request.
pub fn apply_to_column_list(qc: &mut QCode, rules: &[AutoColumn]) -> GqlResult<AutoValues> {
    let mut auto_values = AutoValues::new();

    for m in qc.mutates.iter_mut() {
        let mut applied = Map::new();

        let applicable: Vec<&AutoColumn> = rules.iter().filter(|r| r.applies_to(m)).collect();
        for rule in applicable {
            let Some(col) = m.ti.column(&rule.name).cloned() else {
                continue;
            };
            let value = rule.resolve(None)?;
            let field_name = if m.is_json {
                col.name.clone()
            } else {
                format!("{}{}", AUTO_PARAM_PREFIX, col.name)
            };
            let mcol = MColumn {
                field_name,
                col,
                value: value.clone(),
                auto: true,
            };

            match (m.column_index(&rule.name), rule.rule) {
                (None, ColumnRule::Insert | ColumnRule::Upsert) => m.cols.push(mcol),
                (Some(i), ColumnRule::Update | ColumnRule::Upsert) => m.cols[i] = mcol,
                _ => continue,
            }

            let value = value.unwrap_or(Value::Null);
            m.data.insert(rule.name.clone(), value.clone());
            applied.insert(rule.name.clone(), value);
        }

        if !applied.is_empty() {
            tracing::trace!(table = %m.key, columns = applied.len(), "Applied auto columns");
            auto_values.entry(m.key.clone()).or_default().push(applied);
        }
    }
    Ok(auto_values)
}

/// Whether a decoded payload's root object is keyed by a mutated table.
pub fn root_matches_table(value: &Value, qc: &QCode) -> bool {
    match value {
        Value::Object(map) => {
            let keys = qc.mutated_keys();
            map.keys().any(|k| keys.contains(&to_snake(k)))
        }
        _ => false,
    }
}

/// Injects auto-column values into decoded request payloads at bind time.
pub struct PayloadInjector<'a> {
    qc: &'a QCode,
    rules: Vec<&'a AutoColumn>,
    identity: &'a Identity,
    auto_values: AutoValues,
}

impl<'a> PayloadInjector<'a> {
    /// Rules are pre-filtered to the statement kind of `qc`.
    pub fn new(qc: &'a QCode, rules: &'a [AutoColumn], identity: &'a Identity) -> Self {
        let rules = rules
            .iter()
            .filter(|r| r.qtypes.contains(&qc.qtype))
            .collect();
        Self {
            qc,
            rules,
            identity,
            auto_values: AutoValues::new(),
        }
    }

    pub fn into_auto_values(self) -> AutoValues {
        self.auto_values
    }

    /// Walk a payload tree rooted at a record of table `key`.
    ///
    /// Nested records whose snake_cased key names a mutated table are
    /// visited first; then the current record receives the auto values of
    /// the table it belongs to.
    pub fn inject_into_payload_tree(&mut self, value: &mut Value, key: &str) -> GqlResult<()> {
        match value {
            Value::Object(map) => {
                for (k, child) in map.iter_mut() {
                    if !(child.is_object() || child.is_array()) {
                        continue;
                    }
                    let table_key = to_snake(k);
                    if self.qc.mutate_by_key(&table_key).is_none() {
                        continue;
                    }
                    self.inject_into_payload_tree(child, &table_key)?;
                }

                let qc = self.qc;
                if let Some(m) = qc.mutate_by_key(key) {
                    let applied = self.apply_to_record(m, map)?;
                    if !applied.is_empty() {
                        self.auto_values
                            .entry(key.to_string())
                            .or_default()
                            .push(applied);
                    }
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.inject_into_payload_tree(item, key)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Set auto values along each node's JSON path inside the action variable.
    ///
    /// Used when the action variable's root is not keyed by a mutated table,
    /// e.g. a bare record or an array of records.
    pub fn update_variable_tree(&mut self, value: &mut Value, camel_case: bool) -> GqlResult<()> {
        let qc = self.qc;

        for m in &qc.mutates {
            if !self.rules.iter().any(|r| r.applies_to(m)) {
                continue;
            }
            let path: Vec<String> = if camel_case {
                m.path.iter().map(|p| to_camel(p)).collect()
            } else {
                m.path.clone()
            };

            let mut failure = None;
            let mut records = Vec::new();
            visit_path(value, &path, &mut |record| {
                if failure.is_some() {
                    return;
                }
                match self.apply_to_record(m, record) {
                    Ok(applied) if !applied.is_empty() => records.push(applied),
                    Ok(_) => {}
                    Err(e) => failure = Some(e),
                }
            });

            if let Some(e) = failure {
                return Err(e);
            }
            if !records.is_empty() {
                self.auto_values
                    .entry(m.key.clone())
                    .or_default()
                    .extend(records);
            }
        }
        Ok(())
    }

    fn apply_to_record(
        &self,
        m: &Mutate,
        record: &mut Map<String, Value>,
    ) -> GqlResult<Map<String, Value>> {
        let mut applied = Map::new();

        // Every record follows the column list fixed at compile time, so the
        // value is written whether or not the caller sent the key.
        let rules = self
            .rules
            .iter()
            .filter(|r| r.applies_to(m) && reads_auto_value(m, &r.name));
        for rule in rules {
            let value = rule.resolve(Some(self.identity))?.unwrap_or(Value::Null);
            record.insert(rule.name.clone(), value.clone());
            applied.insert(rule.name.clone(), value);
        }
        Ok(applied)
    }
}

fn reads_auto_value(m: &Mutate, name: &str) -> bool {
    m.is_json && m.cols.iter().any(|c| c.auto && c.col.name == name)
}

fn visit_path<F>(data: &mut Value, path: &[String], f: &mut F)
where
    F: FnMut(&mut Map<String, Value>),
{
    match data {
        Value::Array(items) => {
            for item in items.iter_mut() {
                visit_path(item, path, f);
            }
        }
        Value::Object(map) => match path.split_first() {
            None => f(map),
            Some((head, rest)) => {
                if let Some(next) = map.get_mut(head) {
                    visit_path(next, rest, f);
                }
            }
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qcode::{Column, TableInfo};
    use serde_json::json;

    fn node(id: usize, key: &str, mtype: MType, columns: Vec<Column>) -> Mutate {
        Mutate {
            id,
            key: key.to_string(),
            mtype,
            ti: TableInfo::new(key, columns),
            cols: vec![],
            rel: None,
            parent_id: None,
            path: vec![],
            depends_on: vec![],
            is_json: true,
            where_exp: None,
            data: Map::new(),
            returning: vec![],
        }
    }

    fn qcode(qtype: QType, mutates: Vec<Mutate>) -> QCode {
        QCode {
            qtype,
            name: "m".to_string(),
            role: "user".to_string(),
            namespace: String::new(),
            mutates,
            action_var: Some("data".to_string()),
            validation: None,
            script: None,
            cache: Default::default(),
            consts: None,
            remotes: 0,
        }
    }

    fn posts_columns() -> Vec<Column> {
        vec![
            Column::primary("id", "bigint"),
            Column::new("title", "text"),
            Column::new("created_at", "timestamptz"),
            Column::new("updated_by", "bigint"),
        ]
    }

    fn created_at() -> AutoColumn {
        AutoColumn::new(
            "created_at",
            ColumnRule::Insert,
            AutoValueSource::Static(json!("2024-01-01T00:00:00Z")),
        )
        .with_qtypes(vec![QType::Insert, QType::Update])
    }

    #[test]
    fn test_insert_rule_skipped_for_update() {
        let mut qc = qcode(
            QType::Update,
            vec![node(0, "posts", MType::Update, posts_columns())],
        );
        let values = apply_to_column_list(&mut qc, &[created_at()]).unwrap();

        assert!(qc.mutates[0].column_index("created_at").is_none());
        assert!(values.is_empty());
    }

    #[test]
    fn test_insert_rule_appends_once() {
        let mut qc = qcode(
            QType::Insert,
            vec![node(0, "posts", MType::Insert, posts_columns())],
        );
        let values = apply_to_column_list(&mut qc, &[created_at()]).unwrap();

        let m = &qc.mutates[0];
        let matching: Vec<_> = m.cols.iter().filter(|c| c.col.name == "created_at").collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].value, Some(json!("2024-01-01T00:00:00Z")));
        assert_eq!(m.data.get("created_at"), Some(&json!("2024-01-01T00:00:00Z")));
        assert_eq!(values["posts"].len(), 1);

        // Applying again must not duplicate the column.
        apply_to_column_list(&mut qc, &[created_at()]).unwrap();
        let count = qc.mutates[0]
            .cols
            .iter()
            .filter(|c| c.col.name == "created_at")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_update_rule_overwrites_only_present_column() {
        let mut m = node(0, "posts", MType::Update, posts_columns());
        m.cols.push(MColumn {
            col: Column::new("updated_by", "bigint"),
            field_name: "updatedBy".to_string(),
            value: None,
            auto: false,
        });
        let mut qc = qcode(QType::Update, vec![m]);

        let rule = AutoColumn::new("updated_by", ColumnRule::Update, AutoValueSource::Static(json!(1)));
        apply_to_column_list(&mut qc, &[rule.clone()]).unwrap();
        assert_eq!(qc.mutates[0].cols.len(), 1);
        assert_eq!(qc.mutates[0].cols[0].field_name, "updated_by");
        assert_eq!(qc.mutates[0].cols[0].value, Some(json!(1)));

        let mut bare = qcode(
            QType::Update,
            vec![node(0, "posts", MType::Update, posts_columns())],
        );
        apply_to_column_list(&mut bare, &[rule]).unwrap();
        assert!(bare.mutates[0].cols.is_empty());
    }

    #[test]
    fn test_rule_skips_tables_without_column() {
        let mut qc = qcode(
            QType::Insert,
            vec![
                node(0, "posts", MType::Insert, posts_columns()),
                node(1, "tags", MType::Insert, vec![Column::primary("id", "bigint")]),
            ],
        );
        let values = apply_to_column_list(&mut qc, &[created_at()]).unwrap();
        assert!(qc.mutates[1].cols.is_empty());
        assert!(values.contains_key("posts"));
        assert!(!values.contains_key("tags"));
    }

    #[test]
    fn test_claim_resolves_to_none_at_compile_time() {
        let rule = AutoColumn::new(
            "updated_by",
            ColumnRule::Upsert,
            AutoValueSource::Claim(IdentityClaim::UserId),
        );
        assert_eq!(rule.resolve(None).unwrap(), None);
        assert_eq!(rule.resolve(Some(&Identity::user(42))).unwrap(), Some(json!(42)));
        assert_eq!(rule.resolve(Some(&Identity::user(42.9))).unwrap(), Some(json!(42)));
        assert!(matches!(
            rule.resolve(Some(&Identity::anonymous())),
            Err(GqlError::RequiredVariableMissing { .. })
        ));
    }

    #[test]
    fn test_nested_injection_keeps_sibling_tables_apart() {
        let mut users = node(0, "users", MType::Insert, vec![
            Column::primary("id", "bigint"),
            Column::new("created_at", "timestamptz"),
        ]);
        users.path = vec![];
        let mut posts = node(1, "posts", MType::Insert, posts_columns());
        posts.parent_id = Some(0);
        let mut tags = node(2, "tags", MType::Insert, vec![
            Column::primary("id", "bigint"),
            Column::new("label", "text"),
        ]);
        tags.parent_id = Some(0);

        let mut qc = qcode(QType::Insert, vec![users, posts, tags]);
        let rules = vec![
            created_at(),
            AutoColumn::new("label", ColumnRule::Insert, AutoValueSource::Static(json!("untagged")))
                .for_tables(vec!["tags".to_string()]),
        ];
        apply_to_column_list(&mut qc, &rules).unwrap();
        let identity = Identity::user(1);

        let mut payload = json!({
            "name": "ann",
            "posts": [{"title": "a"}, {"title": "b"}],
            "tags": {"id": 3}
        });
        let mut injector = PayloadInjector::new(&qc, &rules, &identity);
        injector.inject_into_payload_tree(&mut payload, "users").unwrap();
        let values = injector.into_auto_values();

        assert_eq!(payload["posts"][0]["created_at"], json!("2024-01-01T00:00:00Z"));
        assert_eq!(payload["posts"][1]["created_at"], json!("2024-01-01T00:00:00Z"));
        assert!(payload["posts"][0].get("label").is_none());
        assert_eq!(payload["tags"]["label"], json!("untagged"));
        assert!(payload["tags"].get("created_at").is_none());
        assert_eq!(payload["created_at"], json!("2024-01-01T00:00:00Z"));

        assert_eq!(values["posts"].len(), 2);
        assert_eq!(values["tags"].len(), 1);
        assert_eq!(values["users"].len(), 1);
        assert!(values["posts"].iter().all(|m| !m.contains_key("label")));
        assert!(values["tags"].iter().all(|m| !m.contains_key("created_at")));
    }

    #[test]
    fn test_bulk_records_all_receive_update_value() {
        let mut posts = node(0, "posts", MType::UpdateBulk, posts_columns());
        posts.cols.push(MColumn {
            col: Column::new("title", "text"),
            field_name: "title".to_string(),
            value: None,
            auto: false,
        });
        posts.cols.push(MColumn {
            col: Column::new("updated_by", "bigint"),
            field_name: "updated_by".to_string(),
            value: None,
            auto: false,
        });
        let mut qc = qcode(QType::Update, vec![posts]);
        let rules = vec![AutoColumn::new(
            "updated_by",
            ColumnRule::Update,
            AutoValueSource::Claim(IdentityClaim::UserId),
        )];
        apply_to_column_list(&mut qc, &rules).unwrap();
        let identity = Identity::user(7);

        // Only the first record carries the key, yet the statement sets the
        // column for every row.
        let mut payload = json!([
            {"id": 1, "title": "a", "updated_by": 99},
            {"id": 2, "title": "b"}
        ]);
        let mut injector = PayloadInjector::new(&qc, &rules, &identity);
        injector.update_variable_tree(&mut payload, false).unwrap();
        let values = injector.into_auto_values();

        assert_eq!(payload[0]["updated_by"], json!(7));
        assert_eq!(payload[1]["updated_by"], json!(7));
        assert_eq!(values["posts"].len(), 2);
    }

    #[test]
    fn test_insert_value_replaces_caller_key() {
        let mut qc = qcode(
            QType::Insert,
            vec![node(0, "posts", MType::Insert, posts_columns())],
        );
        let rules = vec![created_at()];
        apply_to_column_list(&mut qc, &rules).unwrap();
        let identity = Identity::anonymous();

        let mut payload = json!([
            {"title": "a", "created_at": "1999-01-01T00:00:00Z"},
            {"title": "b"}
        ]);
        let mut injector = PayloadInjector::new(&qc, &rules, &identity);
        injector.update_variable_tree(&mut payload, false).unwrap();

        assert_eq!(payload[0]["created_at"], json!("2024-01-01T00:00:00Z"));
        assert_eq!(payload[1]["created_at"], json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_update_rule_without_column_leaves_records_alone() {
        let mut qc = qcode(
            QType::Update,
            vec![node(0, "posts", MType::UpdateBulk, posts_columns())],
        );
        let rules = vec![AutoColumn::new(
            "updated_by",
            ColumnRule::Update,
            AutoValueSource::Static(json!(1)),
        )];
        apply_to_column_list(&mut qc, &rules).unwrap();
        let identity = Identity::anonymous();

        let mut payload = json!([{"id": 1, "updated_by": 5}, {"id": 2}]);
        let mut injector = PayloadInjector::new(&qc, &rules, &identity);
        injector.update_variable_tree(&mut payload, false).unwrap();

        assert_eq!(payload, json!([{"id": 1, "updated_by": 5}, {"id": 2}]));
        assert!(injector.into_auto_values().is_empty());
    }

    #[test]
    fn test_camel_case_keys_map_to_tables() {
        let mut parent = node(0, "users", MType::Insert, vec![Column::primary("id", "bigint")]);
        parent.path = vec![];
        let mut items = node(1, "purchase_items", MType::Insert, vec![
            Column::primary("id", "bigint"),
            Column::new("created_at", "timestamptz"),
        ]);
        items.parent_id = Some(0);
        let mut qc = qcode(QType::Insert, vec![parent, items]);
        let rules = vec![created_at()];
        apply_to_column_list(&mut qc, &rules).unwrap();
        let identity = Identity::anonymous();

        let mut payload = json!({"purchaseItems": [{"sku": "x"}]});
        let mut injector = PayloadInjector::new(&qc, &rules, &identity);
        injector.inject_into_payload_tree(&mut payload, "users").unwrap();
        assert_eq!(payload["purchaseItems"][0]["created_at"], json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_update_variable_tree_follows_path() {
        let mut posts = node(0, "posts", MType::UpdateBulk, posts_columns());
        posts.path = vec!["post_list".to_string()];
        let mut qc = qcode(QType::Update, vec![posts]);
        let rules = vec![AutoColumn::new(
            "updated_by",
            ColumnRule::Upsert,
            AutoValueSource::Claim(IdentityClaim::UserId),
        )];
        apply_to_column_list(&mut qc, &rules).unwrap();
        let identity = Identity::user("u-9");

        let mut payload = json!({"postList": [{"id": 1}, {"id": 2}]});
        let mut injector = PayloadInjector::new(&qc, &rules, &identity);
        injector.update_variable_tree(&mut payload, true).unwrap();
        let values = injector.into_auto_values();

        assert_eq!(payload["postList"][0]["updated_by"], json!("u-9"));
        assert_eq!(payload["postList"][1]["updated_by"], json!("u-9"));
        assert_eq!(values["posts"].len(), 2);
    }

    #[test]
    fn test_generators() {
        let now = builtin_generator("now").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(now().as_str().unwrap()).is_ok());
        let id = builtin_generator("uuid").unwrap();
        assert_ne!(id(), id());
        assert!(builtin_generator("nope").is_none());
    }

    #[test]
    fn test_root_matches_table() {
        let qc = qcode(
            QType::Update,
            vec![
                node(0, "posts", MType::Update, posts_columns()),
                node(1, "post_tags", MType::Insert, vec![Column::primary("id", "bigint")]),
            ],
        );
        assert!(root_matches_table(&json!({"posts": []}), &qc));
        assert!(root_matches_table(&json!({"postTags": [{"id": 1}]}), &qc));
        assert!(!root_matches_table(&json!({"title": "x"}), &qc));
        assert!(!root_matches_table(&json!([{"posts": 1}]), &qc));
    }
}
