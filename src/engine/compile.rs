//! Compiler adapter: request text to an executable statement for one role.

use serde_json::value::RawValue;
use soligraph_core::autocol::apply_to_column_list;
use soligraph_core::{
    AutoColumn, AutoValues, ConstValidator, GqlError, GqlResult, Metadata, QCode, SqlRenderer,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::RoleConfig;
use crate::plugin::QueryCompiler;
use crate::scripting::{Script, ScriptLoader};
use crate::validation::{ValidationExecuter, ValidatorRegistry};

/// A compiled statement. Immutable once built and shared by every request
/// for the same (namespace, name, role).
pub struct Stmt {
    pub role: String,
    pub qc: QCode,
    pub md: Metadata,
    pub sql: String,
    pub validator: Option<Arc<dyn ValidationExecuter>>,
    pub consts: Option<ConstValidator>,
    pub script: Option<Arc<dyn Script>>,
    /// Auto-column values resolved while compiling.
    pub auto_values: AutoValues,
}

impl Stmt {
    pub fn new(role: &str, qc: QCode, md: Metadata, sql: String) -> Self {
        Self {
            role: role.to_string(),
            qc,
            md,
            sql,
            validator: None,
            consts: None,
            script: None,
            auto_values: AutoValues::new(),
        }
    }
}

impl fmt::Debug for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stmt")
            .field("role", &self.role)
            .field("name", &self.qc.name)
            .field("params", &self.md.params().len())
            .field("validator", &self.validator.is_some())
            .field("consts", &self.consts.is_some())
            .field("script", &self.script.is_some())
            .finish()
    }
}

/// Everything compilation needs, shared by the engine.
pub(crate) struct StmtCompiler {
    pub(crate) roles: HashMap<String, RoleConfig>,
    pub(crate) compiler: Arc<dyn QueryCompiler>,
    pub(crate) renderer: Arc<dyn SqlRenderer>,
    pub(crate) validators: ValidatorRegistry,
    pub(crate) scripts: Option<Arc<dyn ScriptLoader>>,
    pub(crate) auto_columns: Vec<AutoColumn>,
}

impl StmtCompiler {
    /// Compile `query` for `role`. Performs no database I/O.
    pub(crate) fn compile_for_role(
        &self,
        query: &str,
        vars: Option<&RawValue>,
        role: &str,
        namespace: &str,
    ) -> GqlResult<Stmt> {
        let role_config = self
            .roles
            .get(role)
            .ok_or_else(|| GqlError::UnknownRole(role.to_string()))?;

        let mut qc = self.compiler.compile(query, vars, role, namespace)?;

        if qc.qtype.is_mutation() && role_config.read_only {
            return Err(GqlError::Forbidden(format!(
                "role '{}' cannot run {} '{}'",
                role, qc.qtype, qc.name
            )));
        }

        let auto_values = if qc.qtype.is_mutation() && !self.auto_columns.is_empty() {
            apply_to_column_list(&mut qc, &self.auto_columns)?
        } else {
            AutoValues::new()
        };

        let (sql, md) = self.renderer.render(&qc)?;

        let validator = match &qc.validation {
            Some(v) => Some(self.validators.compile(&v.vtype, &v.source)?),
            None => None,
        };

        let consts = match &qc.consts {
            Some(c) => Some(ConstValidator::new(c)?),
            None => None,
        };

        let script = match &qc.script {
            Some(decl) => {
                let loader = self.scripts.as_ref().ok_or_else(|| {
                    GqlError::Script(format!(
                        "'{}' needs script '{}' but no script directory is configured",
                        qc.name, decl.name
                    ))
                })?;
                Some(loader.load(&decl.name)?)
            }
            None => None,
        };

        tracing::debug!(
            namespace = namespace,
            name = %qc.name,
            role = role,
            params = md.params().len(),
            "Compiled statement"
        );

        Ok(Stmt {
            role: role.to_string(),
            qc,
            md,
            sql,
            validator,
            consts,
            script,
            auto_values,
        })
    }
}
