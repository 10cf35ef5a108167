//! Per-variable constraint checks declared in the IR.
//!
//! Constraints are compiled once when the statement is compiled (patterns
//! become `Regex` values) and evaluated against the decoded request
//! variables on every execution.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{FieldError, GqlError, GqlResult};

/// Well-known string formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Email,
    Uuid,
    Date,
    Datetime,
}

/// A single declared constraint on a request variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    Required,
    MinLength { min: usize },
    MaxLength { max: usize },
    Min { min: f64 },
    Max { max: f64 },
    OneOf { values: Vec<Value> },
    Pattern { pattern: String },
    Format { format: Format },
    /// The variable may only be set together with another one.
    Requires { other: String },
}

enum Check {
    Required,
    MinLength(usize),
    MaxLength(usize),
    Min(f64),
    Max(f64),
    OneOf(Vec<Value>),
    Pattern(Regex),
    Format(Format),
    Requires(String),
}

/// Compiled constraint set of one statement.
pub struct ConstValidator {
    checks: BTreeMap<String, Vec<Check>>,
    email: Regex,
}

impl ConstValidator {
    pub fn new(consts: &BTreeMap<String, Vec<Constraint>>) -> GqlResult<Self> {
        let mut checks = BTreeMap::new();

        for (field, constraints) in consts {
            let mut compiled = Vec::with_capacity(constraints.len());
            for c in constraints {
                compiled.push(match c {
                    Constraint::Required => Check::Required,
                    Constraint::MinLength { min } => Check::MinLength(*min),
                    Constraint::MaxLength { max } => Check::MaxLength(*max),
                    Constraint::Min { min } => Check::Min(*min),
                    Constraint::Max { max } => Check::Max(*max),
                    Constraint::OneOf { values } => Check::OneOf(values.clone()),
                    Constraint::Pattern { pattern } => {
                        let re = Regex::new(pattern).map_err(|e| {
                            GqlError::Compilation(format!(
                                "invalid pattern for variable '{}': {}",
                                field, e
                            ))
                        })?;
                        Check::Pattern(re)
                    }
                    Constraint::Format { format } => Check::Format(*format),
                    Constraint::Requires { other } => Check::Requires(other.clone()),
                });
            }
            checks.insert(field.clone(), compiled);
        }

        let email = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
            .map_err(|e| GqlError::Internal(e.to_string()))?;

        Ok(Self { checks, email })
    }

    /// Check every declared variable and collect all failures.
    pub fn validate_map(&self, vars: &Map<String, Value>) -> Vec<FieldError> {
        let mut errors = Vec::new();

        for (field, checks) in &self.checks {
            let value = vars.get(field).filter(|v| !v.is_null());

            for check in checks {
                let Some(value) = value else {
                    if matches!(check, Check::Required) {
                        errors.push(FieldError::new(field, "is required"));
                    }
                    continue;
                };
                if let Some(message) = self.check_value(check, value, vars) {
                    errors.push(FieldError::new(field, message));
                }
            }
        }
        errors
    }

    fn check_value(&self, check: &Check, value: &Value, vars: &Map<String, Value>) -> Option<String> {
        match check {
            Check::Required => None,
            Check::MinLength(min) => match length_of(value) {
                Some(len) if len < *min => Some(format!("must have at least {} items/characters", min)),
                _ => None,
            },
            Check::MaxLength(max) => match length_of(value) {
                Some(len) if len > *max => Some(format!("must have at most {} items/characters", max)),
                _ => None,
            },
            Check::Min(min) => match value.as_f64() {
                Some(n) if n < *min => Some(format!("must be greater than or equal to {}", min)),
                None => Some("must be a number".to_string()),
                _ => None,
            },
            Check::Max(max) => match value.as_f64() {
                Some(n) if n > *max => Some(format!("must be less than or equal to {}", max)),
                None => Some("must be a number".to_string()),
                _ => None,
            },
            Check::OneOf(values) => {
                if values.contains(value) {
                    None
                } else {
                    Some("is not one of the allowed values".to_string())
                }
            }
            Check::Pattern(re) => match value.as_str() {
                Some(s) if re.is_match(s) => None,
                _ => Some(format!("must match pattern '{}'", re.as_str())),
            },
            Check::Format(format) => {
                let s = value.as_str().unwrap_or_default();
                let ok = match format {
                    Format::Email => self.email.is_match(s),
                    Format::Uuid => uuid::Uuid::parse_str(s).is_ok(),
                    Format::Date => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
                    Format::Datetime => chrono::DateTime::parse_from_rfc3339(s).is_ok(),
                };
                if ok {
                    None
                } else {
                    Some(format!("must be a valid {:?}", format).to_lowercase())
                }
            }
            Check::Requires(other) => match vars.get(other) {
                Some(v) if !v.is_null() => None,
                _ => Some(format!("requires '{}' to be set", other)),
            },
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator(consts: Value) -> ConstValidator {
        let consts: BTreeMap<String, Vec<Constraint>> = serde_json::from_value(consts).unwrap();
        ConstValidator::new(&consts).unwrap()
    }

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_required_and_format() {
        let va = validator(json!({
            "email": [{"kind": "required"}, {"kind": "format", "format": "email"}],
            "id": [{"kind": "format", "format": "uuid"}]
        }));

        let errs = va.validate_map(&vars(json!({"id": "not-a-uuid"})));
        assert_eq!(errs.len(), 2);
        assert_eq!(errs[0].field, "email");
        assert_eq!(errs[0].message, "is required");
        assert_eq!(errs[1].field, "id");

        let errs = va.validate_map(&vars(json!({
            "email": "a@b.io",
            "id": "67e55044-10b1-426f-9247-bb680e5fe0c8"
        })));
        assert!(errs.is_empty());
    }

    #[test]
    fn test_ranges_and_lengths() {
        let va = validator(json!({
            "age": [{"kind": "min", "min": 18.0}, {"kind": "max", "max": 120.0}],
            "name": [{"kind": "min_length", "min": 2}, {"kind": "max_length", "max": 4}]
        }));

        let errs = va.validate_map(&vars(json!({"age": 12, "name": "Alexander"})));
        assert_eq!(errs.len(), 2);

        let errs = va.validate_map(&vars(json!({"age": 30, "name": "Ann"})));
        assert!(errs.is_empty());
    }

    #[test]
    fn test_one_of_pattern_requires() {
        let va = validator(json!({
            "status": [{"kind": "one_of", "values": ["draft", "published"]}],
            "slug": [{"kind": "pattern", "pattern": "^[a-z-]+$"}],
            "end": [{"kind": "requires", "other": "start"}]
        }));

        let errs = va.validate_map(&vars(json!({
            "status": "archived",
            "slug": "Hello World",
            "end": "2024-01-01"
        })));
        let fields: Vec<_> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["end", "slug", "status"]);
    }

    #[test]
    fn test_invalid_pattern_fails_compilation() {
        let consts: BTreeMap<String, Vec<Constraint>> = serde_json::from_value(json!({
            "slug": [{"kind": "pattern", "pattern": "("}]
        }))
        .unwrap();
        assert!(matches!(
            ConstValidator::new(&consts),
            Err(GqlError::Compilation(_))
        ));
    }
}
