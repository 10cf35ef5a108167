//! Request validators
//!
//! A statement may declare a validation step by type and source. The
//! registry maps the type to a compiler; compiled validators are attached to
//! the cached statement and run against the raw request variables.

use jsonschema::validator_for;
use serde_json::Value;
use soligraph_core::{FieldError, GqlError, GqlResult};
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled validation step.
pub trait ValidationExecuter: Send + Sync {
    fn validate(&self, vars: &Value) -> GqlResult<()>;
}

/// Compiles validation source of one declared type.
pub trait ValidatorCompiler: Send + Sync {
    fn compile_validation(&self, source: &str) -> GqlResult<Arc<dyn ValidationExecuter>>;
}

/// Validator compilers keyed by declared type.
pub struct ValidatorRegistry {
    compilers: HashMap<String, Arc<dyn ValidatorCompiler>>,
}

impl ValidatorRegistry {
    /// A registry with no validators.
    pub fn empty() -> Self {
        Self {
            compilers: HashMap::new(),
        }
    }

    pub fn register(&mut self, vtype: &str, compiler: Arc<dyn ValidatorCompiler>) {
        self.compilers.insert(vtype.to_string(), compiler);
    }

    pub fn get(&self, vtype: &str) -> Option<&Arc<dyn ValidatorCompiler>> {
        self.compilers.get(vtype)
    }

    /// Compile `source` with the validator registered for `vtype`.
    pub fn compile(&self, vtype: &str, source: &str) -> GqlResult<Arc<dyn ValidationExecuter>> {
        let compiler = self
            .get(vtype)
            .ok_or_else(|| GqlError::MissingValidator(vtype.to_string()))?;
        compiler.compile_validation(source)
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("jsonschema", Arc::new(JsonSchemaCompiler));
        registry
    }
}

/// JSON Schema validation of the request variables.
pub struct JsonSchemaCompiler;

impl ValidatorCompiler for JsonSchemaCompiler {
    fn compile_validation(&self, source: &str) -> GqlResult<Arc<dyn ValidationExecuter>> {
        let schema: Value = serde_json::from_str(source)
            .map_err(|e| GqlError::Compilation(format!("validation schema is not JSON: {}", e)))?;
        let validator = validator_for(&schema)
            .map_err(|e| GqlError::Compilation(format!("invalid validation schema: {}", e)))?;
        Ok(Arc::new(JsonSchemaExecuter { validator }))
    }
}

struct JsonSchemaExecuter {
    validator: jsonschema::Validator,
}

impl ValidationExecuter for JsonSchemaExecuter {
    fn validate(&self, vars: &Value) -> GqlResult<()> {
        let errors: Vec<FieldError> = self
            .validator
            .iter_errors(vars)
            .map(|e| {
                let path = e.instance_path().to_string();
                FieldError::new(if path.is_empty() { "/" } else { path.as_str() }, e.to_string())
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GqlError::ValidationFailed(errors))
        }
    }
}
