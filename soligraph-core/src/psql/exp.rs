//! Filter expressions.

use crate::error::{GqlError, GqlResult};
use crate::qcode::{CmpOp, Column, Exp, ExpVal, Mutate};
use crate::util::{quote_ident, quote_literal};

use super::update_bulk::{RecordSet, RECORD_ALIAS};
use super::{literal_sql, Context, Param};

/// Payload fields an expression reads, with whether each must be typed json.
pub(super) fn input_refs(exp: &Exp, out: &mut Vec<(String, bool)>) {
    match exp {
        Exp::And { children } | Exp::Or { children } => {
            for c in children {
                input_refs(c, out);
            }
        }
        Exp::Not { child } => input_refs(child, out),
        Exp::Cmp {
            cmp,
            val: ExpVal::Input(path),
            ..
        } => {
            if let Some(first) = path.first() {
                out.push((first.clone(), path.len() > 1 || *cmp == CmpOp::In));
            }
        }
        Exp::Cmp { .. } | Exp::IsNull { .. } => {}
    }
}

fn json_path(segments: &[String]) -> String {
    quote_literal(&format!("{{{}}}", segments.join(",")))
}

impl Context<'_> {
    pub(super) fn render_exp(&mut self, m: &Mutate, exp: &Exp, rs: Option<&RecordSet>) -> GqlResult<()> {
        match exp {
            Exp::And { children } => self.render_list(m, children, " AND ", "true", rs),
            Exp::Or { children } => self.render_list(m, children, " OR ", "false", rs),
            Exp::Not { child } => {
                self.w.push_str("(NOT ");
                self.render_exp(m, child, rs)?;
                self.w.push(')');
                Ok(())
            }
            Exp::Cmp { col, cmp, val } => {
                let column = column_of(m, col)?;
                let left = format!("{}.{}", quote_ident(&m.ti.name), quote_ident(col));
                let right = self.render_val(m, column, *cmp, val, rs)?;
                if *cmp == CmpOp::In {
                    self.w.push_str(&format!("(({}) = ANY ({}))", left, right));
                } else {
                    self.w.push_str(&format!("(({}) {} ({}))", left, cmp.as_sql(), right));
                }
                Ok(())
            }
            Exp::IsNull { col, is_null } => {
                column_of(m, col)?;
                self.w.push_str(&format!(
                    "({}.{} IS {}NULL)",
                    quote_ident(&m.ti.name),
                    quote_ident(col),
                    if *is_null { "" } else { "NOT " }
                ));
                Ok(())
            }
        }
    }

    fn render_list(
        &mut self,
        m: &Mutate,
        children: &[Exp],
        sep: &str,
        empty: &str,
        rs: Option<&RecordSet>,
    ) -> GqlResult<()> {
        if children.is_empty() {
            self.w.push_str(empty);
            return Ok(());
        }
        self.w.push('(');
        for (i, c) in children.iter().enumerate() {
            if i != 0 {
                self.w.push_str(sep);
            }
            self.render_exp(m, c, rs)?;
        }
        self.w.push(')');
        Ok(())
    }

    fn render_val(
        &mut self,
        m: &Mutate,
        column: &Column,
        cmp: CmpOp,
        val: &ExpVal,
        rs: Option<&RecordSet>,
    ) -> GqlResult<String> {
        let col_type = &column.col_type;
        let list = cmp == CmpOp::In;

        match val {
            ExpVal::Literal(v) if list => {
                let items = v.as_array().ok_or_else(|| {
                    GqlError::Render(format!("'in' on column '{}' expects a list", column.name))
                })?;
                let items: Vec<String> = items
                    .iter()
                    .map(|i| format!("{} :: {}", literal_sql(i), col_type))
                    .collect();
                Ok(format!("ARRAY[{}]", items.join(", ")))
            }
            ExpVal::Literal(v) => Ok(format!("{} :: {}", literal_sql(v), col_type)),
            ExpVal::Var(name) => {
                let n = self.md.add_param(Param {
                    is_array: list || column.array,
                    ..Param::new(name, col_type)
                });
                Ok(format!("${} :: {}{}", n, col_type, if list { "[]" } else { "" }))
            }
            ExpVal::Input(path) => {
                let rs = rs.ok_or_else(|| {
                    GqlError::Render(format!(
                        "table '{}' filters on payload fields but is not fed by a json payload",
                        m.ti.name
                    ))
                })?;
                let (first, rest) = path.split_first().ok_or_else(|| {
                    GqlError::Render(format!("empty payload reference on table '{}'", m.ti.name))
                })?;
                let field = format!("{}.{}", RECORD_ALIAS, quote_ident(first));

                if !rs.is_json(first) {
                    if !rest.is_empty() || list {
                        return Err(GqlError::Render(format!(
                            "payload field '{}' of table '{}' is not json",
                            first, m.ti.name
                        )));
                    }
                    return Ok(format!("{} :: {}", field, col_type));
                }
                if list {
                    return Ok(format!(
                        "ARRAY(SELECT json_array_elements_text({} #> {})) :: {}[]",
                        field,
                        json_path(rest),
                        col_type
                    ));
                }
                Ok(format!("({} #>> {}) :: {}", field, json_path(rest), col_type))
            }
        }
    }
}

fn column_of<'m>(m: &'m Mutate, col: &str) -> GqlResult<&'m Column> {
    m.ti.column(col).ok_or_else(|| {
        GqlError::Render(format!("unknown column '{}' on table '{}'", col, m.ti.name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psql::{Metadata, RenderConfig};
    use crate::qcode::{QCode, TableInfo};
    use serde_json::{json, Map};

    fn posts(is_json: bool) -> Mutate {
        Mutate {
            id: 0,
            key: "posts".to_string(),
            mtype: crate::qcode::MType::Update,
            ti: TableInfo::new(
                "posts",
                vec![
                    Column::primary("id", "bigint"),
                    Column::new("status", "text"),
                    Column::new("deleted_at", "timestamptz"),
                ],
            ),
            cols: vec![],
            rel: None,
            parent_id: None,
            path: vec![],
            depends_on: vec![],
            is_json,
            where_exp: None,
            data: Map::new(),
            returning: vec![],
        }
    }

    fn render(m: &Mutate, exp: &Exp, rs: Option<&RecordSet>) -> GqlResult<(String, Metadata)> {
        let qc: QCode = serde_json::from_value(json!({"type": "update", "name": "m"})).unwrap();
        let config = RenderConfig::default();
        let mut ctx = Context {
            qc: &qc,
            config: &config,
            md: Metadata::default(),
            w: String::new(),
        };
        ctx.render_exp(m, exp, rs)?;
        Ok((ctx.w, ctx.md))
    }

    #[test]
    fn test_boolean_composition() {
        let exp: Exp = serde_json::from_value(json!({
            "op": "and",
            "children": [
                {"op": "cmp", "col": "status", "cmp": "eq", "val": {"kind": "literal", "value": "draft"}},
                {"op": "not", "child": {"op": "is_null", "col": "deleted_at", "is_null": false}},
                {"op": "or", "children": []}
            ]
        }))
        .unwrap();

        let (sql, md) = render(&posts(false), &exp, None).unwrap();
        assert_eq!(
            sql,
            "(((\"posts\".\"status\") = ('draft' :: text)) AND \
             (NOT (\"posts\".\"deleted_at\" IS NOT NULL)) AND false)"
        );
        assert!(md.params().is_empty());
    }

    #[test]
    fn test_in_list_variants() {
        let literal = Exp::Cmp {
            col: "id".to_string(),
            cmp: CmpOp::In,
            val: ExpVal::Literal(json!([1, 2])),
        };
        let (sql, _) = render(&posts(false), &literal, None).unwrap();
        assert_eq!(sql, "((\"posts\".\"id\") = ANY (ARRAY['1' :: bigint, '2' :: bigint]))");

        let var = Exp::Cmp {
            col: "id".to_string(),
            cmp: CmpOp::In,
            val: ExpVal::Var("ids".to_string()),
        };
        let (sql, md) = render(&posts(false), &var, None).unwrap();
        assert_eq!(sql, "((\"posts\".\"id\") = ANY ($1 :: bigint[]))");
        assert!(md.params()[0].is_array);
    }

    #[test]
    fn test_payload_references() {
        let exp = Exp::And {
            children: vec![
                Exp::eq("id", ExpVal::Input(vec!["id".to_string()])),
                Exp::eq(
                    "status",
                    ExpVal::Input(vec!["meta".to_string(), "state".to_string()]),
                ),
            ],
        };
        let mut refs = Vec::new();
        input_refs(&exp, &mut refs);
        assert_eq!(refs, vec![("id".to_string(), false), ("meta".to_string(), true)]);

        let mut rs = RecordSet::default();
        for (field, json) in refs {
            rs.add(&field, if json { "json" } else { "text" });
        }
        let (sql, _) = render(&posts(true), &exp, Some(&rs)).unwrap();
        assert_eq!(
            sql,
            "(((\"posts\".\"id\") = (t.\"id\" :: bigint)) AND \
             ((\"posts\".\"status\") = ((t.\"meta\" #>> '{state}') :: text)))"
        );

        assert!(matches!(
            render(&posts(false), &exp, None),
            Err(GqlError::Render(_))
        ));
    }

    #[test]
    fn test_unknown_column() {
        let exp = Exp::eq("nope", ExpVal::Literal(json!(1)));
        let err = render(&posts(false), &exp, None).unwrap_err();
        assert!(matches!(err, GqlError::Render(ref m) if m == "unknown column 'nope' on table 'posts'"));
    }
}
