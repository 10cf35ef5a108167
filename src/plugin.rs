//! Collaborator interfaces the engine is built against, with the shipped
//! default implementations.

use async_trait::async_trait;
use serde_json::value::RawValue;
use serde_json::Value;
use soligraph_core::{GqlError, GqlResult, QCode};

/// Turns request text into a role-scoped IR.
pub trait QueryCompiler: Send + Sync {
    /// `vars` is the raw variables document (or variable schema) of the
    /// request, when one was given.
    fn compile(
        &self,
        query: &str,
        vars: Option<&RawValue>,
        role: &str,
        namespace: &str,
    ) -> GqlResult<QCode>;
}

/// Compiler for allow-listed statements stored as serialized IR documents.
///
/// Tables that do not name a schema are placed in `default_schema`.
#[derive(Debug, Clone)]
pub struct JsonIrCompiler {
    default_schema: String,
}

impl JsonIrCompiler {
    pub fn new(default_schema: &str) -> Self {
        Self {
            default_schema: default_schema.to_string(),
        }
    }

    fn fill_schema(&self, doc: &mut Value) {
        let Some(mutates) = doc.get_mut("mutates").and_then(Value::as_array_mut) else {
            return;
        };
        for ti in mutates.iter_mut().filter_map(|m| m.get_mut("ti")) {
            if let Some(ti) = ti.as_object_mut() {
                ti.entry("schema")
                    .or_insert_with(|| Value::String(self.default_schema.clone()));
            }
        }
    }
}

impl Default for JsonIrCompiler {
    fn default() -> Self {
        Self::new("public")
    }
}

impl QueryCompiler for JsonIrCompiler {
    fn compile(
        &self,
        query: &str,
        _vars: Option<&RawValue>,
        role: &str,
        namespace: &str,
    ) -> GqlResult<QCode> {
        let invalid = |e: serde_json::Error| GqlError::Compilation(format!("invalid IR document: {}", e));
        let mut doc: Value = serde_json::from_str(query).map_err(invalid)?;
        self.fill_schema(&mut doc);
        let mut qc: QCode = serde_json::from_value(doc).map_err(invalid)?;

        if qc.name.is_empty() {
            return Err(GqlError::Compilation("IR document has no name".to_string()));
        }
        for (i, m) in qc.mutates.iter().enumerate() {
            if m.id != i {
                return Err(GqlError::Compilation(format!(
                    "mutation node '{}' has id {} at position {}",
                    m.key, m.id, i
                )));
            }
        }

        qc.role = role.to_string();
        qc.namespace = namespace.to_string();
        Ok(qc)
    }
}

/// Encrypts designated values of a result document in place.
pub trait ValueEncryptor: Send + Sync {
    /// `prefix` marks the values to encrypt; `hash` is the SHA-256 of the
    /// unencrypted result and separates keys per result.
    fn encrypt_values(&self, data: Vec<u8>, prefix: &str, hash: &[u8], key: &[u8]) -> GqlResult<Vec<u8>>;
}

/// Leaves results untouched.
#[derive(Debug, Default, Clone)]
pub struct PassthroughEncryptor;

impl ValueEncryptor for PassthroughEncryptor {
    fn encrypt_values(&self, data: Vec<u8>, _prefix: &str, _hash: &[u8], _key: &[u8]) -> GqlResult<Vec<u8>> {
        Ok(data)
    }
}

/// Resolves remote joins declared by the IR after the main statement ran.
#[async_trait]
pub trait RemoteJoiner: Send + Sync {
    async fn join(&self, qc: &QCode, data: Vec<u8>) -> GqlResult<Vec<u8>>;
}
