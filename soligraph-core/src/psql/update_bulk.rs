//! UPDATE-based CTEs: bulk updates, connect and disconnect.

use crate::autocol::AUTO_PARAM_PREFIX;
use crate::error::{GqlError, GqlResult};
use crate::qcode::{Column, MColumn, MType, Mutate, RelType, Relation};
use crate::util::{quote_ident, quote_literal, to_camel};

use super::exp::input_refs;
use super::{literal_sql, sql_type, Context, Param, INPUT_CTE, PARENT_PREFIX};

/// Alias of the typed row set a JSON node is expanded into.
pub(super) const RECORD_ALIAS: &str = "t";

/// Columns of the typed row set `t(...)`.
#[derive(Debug, Default)]
pub(super) struct RecordSet {
    columns: Vec<(String, String)>,
}

impl RecordSet {
    pub(super) fn add(&mut self, name: &str, sql_type: &str) {
        if !self.columns.iter().any(|(n, _)| n == name) {
            self.columns.push((name.to_string(), sql_type.to_string()));
        }
    }

    pub(super) fn is_json(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, t)| n == name && t == "json")
    }

    fn definition(&self) -> String {
        self.columns
            .iter()
            .map(|(n, t)| format!("{} {}", quote_ident(n), t))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn parent_alias(table: &str) -> String {
    quote_ident(&format!("{}{}", PARENT_PREFIX, table))
}

fn table_name(m: &Mutate) -> String {
    format!("{}.{}", quote_ident(&m.ti.schema), quote_ident(&m.ti.name))
}

/// Wrap a json expression so a single object expands like a one-element array.
fn as_array(expr: &str) -> String {
    format!(
        "CASE json_typeof({e}) WHEN 'array' THEN {e} ELSE json_build_array({e}) END",
        e = expr
    )
}

fn one_to_one<'m>(m: &'m Mutate, op: &str) -> GqlResult<&'m Relation> {
    match (&m.rel, m.parent_id) {
        (Some(rel), Some(_)) if rel.rel_type == RelType::OneToOne => Ok(rel),
        (Some(_), Some(_)) => Err(GqlError::OperationNotSupported(format!(
            "{} on '{}' requires a one-to-one relation",
            op, m.ti.name
        ))),
        _ => Err(GqlError::Render(format!(
            "{} on '{}' requires a parent table",
            op, m.ti.name
        ))),
    }
}

impl<'a> Context<'a> {
    pub(super) fn render_update(&mut self, m: &Mutate) -> GqlResult<()> {
        if m.cols.is_empty() {
            return Err(GqlError::Render(format!(
                "no columns to update on table '{}'",
                m.ti.name
            )));
        }
        let rs = self.record_set(m)?;

        self.open_cte(m);
        let parent_aliased = self.render_modifier(m)?;

        self.w.push_str("UPDATE ");
        self.w.push_str(&table_name(m));
        self.w.push_str(" SET ");
        for (i, c) in m.cols.iter().enumerate() {
            if i != 0 {
                self.w.push_str(", ");
            }
            let source = self.column_source(c, rs.as_ref());
            self.w.push_str(&format!("{} = {}", quote_ident(&c.col.name), source));
        }

        self.render_from(m, rs.as_ref(), parent_aliased);
        self.w.push_str(" WHERE ");

        match (m.parent_id, &m.rel) {
            // Bulk rows always join on their key; a filter only narrows them.
            (None, _) if m.mtype == MType::UpdateBulk && rs.is_some() => {
                self.render_pk_match(m, rs.as_ref())?;
                if let Some(exp) = &m.where_exp {
                    self.w.push_str(" AND ");
                    self.render_exp(m, exp, rs.as_ref())?;
                }
            }
            (None, _) => match &m.where_exp {
                Some(exp) => self.render_exp(m, exp, rs.as_ref())?,
                None => self.render_pk_match(m, rs.as_ref())?,
            },
            (Some(_), Some(rel)) => {
                self.render_rel_join(rel);
                match rel.rel_type {
                    RelType::OneToOne => {
                        if let Some(exp) = &m.where_exp {
                            self.w.push_str(" AND ");
                            self.render_exp(m, exp, rs.as_ref())?;
                        }
                    }
                    RelType::OneToMany | RelType::ManyToMany => {
                        if rs.is_some() {
                            self.w.push_str(" AND ");
                            self.render_pk_match(m, rs.as_ref())?;
                        }
                    }
                }
            }
            (Some(_), None) => {
                return Err(GqlError::Render(format!(
                    "nested table '{}' has no relation to its parent",
                    m.ti.name
                )))
            }
        }

        self.render_returning(m);
        self.w.push(')');
        Ok(())
    }

    pub(super) fn render_connect(&mut self, m: &Mutate) -> GqlResult<()> {
        let rel = one_to_one(m, "connect")?;
        let exp = m.where_exp.as_ref().ok_or_else(|| {
            GqlError::Render(format!("connect on '{}' requires a filter", m.ti.name))
        })?;
        let rs = self.record_set(m)?;

        self.open_cte(m);
        self.w.push_str(&format!(
            "UPDATE {} SET {} = {}.{}",
            table_name(m),
            quote_ident(&rel.left.col),
            parent_alias(&rel.right.table),
            quote_ident(&rel.right.col)
        ));
        self.render_from(m, rs.as_ref(), false);
        self.w.push_str(" WHERE ");
        self.render_exp(m, exp, rs.as_ref())?;
        self.render_returning(m);
        self.w.push(')');
        Ok(())
    }

    pub(super) fn render_disconnect(&mut self, m: &Mutate) -> GqlResult<()> {
        let rel = one_to_one(m, "disconnect")?;
        let rs = self.record_set(m)?;

        self.open_cte(m);
        self.w.push_str(&format!(
            "UPDATE {} SET {} = NULL",
            table_name(m),
            quote_ident(&rel.left.col)
        ));
        self.render_from(m, rs.as_ref(), false);
        self.w.push_str(" WHERE ");
        self.render_rel_join(rel);
        if let Some(exp) = &m.where_exp {
            self.w.push_str(" AND ");
            self.render_exp(m, exp, rs.as_ref())?;
        }
        self.render_returning(m);
        self.w.push(')');
        Ok(())
    }

    fn open_cte(&mut self, m: &Mutate) {
        self.w.push_str(&quote_ident(&m.key));
        self.w.push_str(" AS (");
    }

    /// One-to-many children update against the distinct parent keys.
    /// Returns whether the parent alias is now defined by the modifier.
    fn render_modifier(&mut self, m: &Mutate) -> GqlResult<bool> {
        let (Some(p), Some(rel)) = (m.parent_id, &m.rel) else {
            return Ok(false);
        };
        if rel.rel_type != RelType::OneToMany {
            return Ok(false);
        }
        let parent = self.parent(p)?;
        self.w.push_str(&format!(
            "WITH {} AS (SELECT DISTINCT {} FROM {}) ",
            parent_alias(&rel.right.table),
            quote_ident(&rel.right.col),
            quote_ident(&parent.key)
        ));
        Ok(true)
    }

    fn parent(&self, index: usize) -> GqlResult<&'a Mutate> {
        let qc = self.qc;
        qc.mutates
            .get(index)
            .ok_or_else(|| GqlError::Render(format!("unknown parent node {}", index)))
    }

    fn column_source(&mut self, c: &MColumn, rs: Option<&RecordSet>) -> String {
        let col_type = sql_type(&c.col);

        if rs.is_some() {
            return format!("{}.{} :: {}", RECORD_ALIAS, quote_ident(&c.field_name), col_type);
        }
        match &c.value {
            Some(v) if !c.field_name.starts_with(AUTO_PARAM_PREFIX) => {
                format!("{} :: {}", literal_sql(v), col_type)
            }
            _ => {
                let n = self.md.add_param(Param {
                    is_array: c.col.array,
                    ..Param::new(&c.field_name, &c.col.col_type)
                });
                format!("${} :: {}", n, col_type)
            }
        }
    }

    /// Typed columns the JSON payload of `m` is expanded into.
    fn record_set(&self, m: &Mutate) -> GqlResult<Option<RecordSet>> {
        if !m.is_json {
            return Ok(None);
        }
        let mut rs = RecordSet::default();
        for c in &m.cols {
            rs.add(&c.field_name, &sql_type(&c.col));
        }
        if let Some(pk) = m.ti.primary_key() {
            rs.add(&self.pk_field(m, pk), &sql_type(pk));
        }
        if let Some(exp) = &m.where_exp {
            let mut refs = Vec::new();
            input_refs(exp, &mut refs);
            for (field, needs_json) in refs {
                rs.add(&field, if needs_json { "json" } else { "text" });
            }
        }
        Ok(Some(rs))
    }

    fn pk_field(&self, m: &Mutate, pk: &Column) -> String {
        match m.cols.iter().find(|c| c.col.name == pk.name) {
            Some(c) => c.field_name.clone(),
            None if self.config.enable_camelcase => to_camel(&pk.name),
            None => pk.name.clone(),
        }
    }

    /// Walk the node's path through the payload, one record set per level.
    fn record_set_expansion(&self, m: &Mutate, rs: &RecordSet) -> Vec<String> {
        let path: Vec<String> = m
            .path
            .iter()
            .map(|s| {
                if self.config.enable_camelcase {
                    to_camel(s)
                } else {
                    s.clone()
                }
            })
            .collect();

        let mut items = Vec::with_capacity(path.len() + 1);
        let mut expr = "i.j".to_string();

        for (k, seg) in path.iter().enumerate() {
            if k == 0 {
                expr = format!("i.j->{}", quote_literal(seg));
                continue;
            }
            let alias = quote_ident(&format!("_r{}", k - 1));
            items.push(format!(
                "json_to_recordset({}) AS {}({} json)",
                as_array(&expr),
                alias,
                quote_ident(seg)
            ));
            expr = format!("{}.{}", alias, quote_ident(seg));
        }

        items.push(format!(
            "json_to_recordset({}) AS {}({})",
            as_array(&expr),
            RECORD_ALIAS,
            rs.definition()
        ));
        items
    }

    fn render_from(&mut self, m: &Mutate, rs: Option<&RecordSet>, parent_aliased: bool) {
        let qc = self.qc;
        let mut from = Vec::new();

        if let Some(rs) = rs {
            from.push(format!("{} i", quote_ident(INPUT_CTE)));
            from.extend(self.record_set_expansion(m, rs));
        }
        if let (Some(p), Some(rel)) = (m.parent_id, &m.rel) {
            if parent_aliased {
                from.push(parent_alias(&rel.right.table));
            } else if let Some(parent) = qc.mutates.get(p) {
                from.push(format!(
                    "{} AS {}",
                    quote_ident(&parent.key),
                    parent_alias(&rel.right.table)
                ));
            }
        }
        for &d in &m.depends_on {
            if Some(d) == m.parent_id {
                continue;
            }
            if let Some(dep) = qc.mutates.get(d) {
                from.push(format!(
                    "{} AS {}",
                    quote_ident(&dep.key),
                    parent_alias(&dep.ti.name)
                ));
            }
        }

        if !from.is_empty() {
            self.w.push_str(" FROM ");
            self.w.push_str(&from.join(", "));
        }
    }

    fn render_pk_match(&mut self, m: &Mutate, rs: Option<&RecordSet>) -> GqlResult<()> {
        if rs.is_none() {
            return Err(GqlError::Render(format!(
                "update on '{}' requires a filter",
                m.ti.name
            )));
        }
        let pk = m.ti.primary_key().ok_or_else(|| {
            GqlError::Render(format!("table '{}' has no primary key", m.ti.name))
        })?;
        let field = self.pk_field(m, pk);
        self.w.push_str(&format!(
            "(({}.{}) = ({}.{}))",
            quote_ident(&m.ti.name),
            quote_ident(&pk.name),
            RECORD_ALIAS,
            quote_ident(&field)
        ));
        Ok(())
    }

    fn render_rel_join(&mut self, rel: &Relation) {
        self.w.push_str(&format!(
            "(({}.{}) = ({}.{}))",
            quote_ident(&rel.left.table),
            quote_ident(&rel.left.col),
            parent_alias(&rel.right.table),
            quote_ident(&rel.right.col)
        ));
    }

    fn render_returning(&mut self, m: &Mutate) {
        let table = quote_ident(&m.ti.name);
        self.w.push_str(" RETURNING ");
        if m.returning.is_empty() {
            self.w.push_str(&format!("{}.*", table));
            return;
        }
        let fields: Vec<String> = m
            .returning
            .iter()
            .map(|f| format!("{}.{}", table, quote_ident(f)))
            .collect();
        self.w.push_str(&fields.join(", "));
    }
}
