//! Schema-gated writes.
//!
//! The JSON Schema itself is evaluated by the `jsonschema` crate; this
//! module only compiles it once at construction, aggregates violations
//! into a single message, and extracts the `default` values declared for
//! top-level properties so they can be materialized into a fresh document.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// Compiled validation predicate plus the schema's declared defaults.
pub struct SchemaGate {
    validator: jsonschema::Validator,
    defaults: Map<String, Value>,
}

impl fmt::Debug for SchemaGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaGate")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl SchemaGate {
    /// Compile `schema`. The document is always an object, so the schema
    /// is expected to describe one.
    pub fn compile(schema: &Value) -> Result<Self> {
        let validator =
            jsonschema::validator_for(schema).map_err(|err| StoreError::InvalidSchema {
                reason: err.to_string(),
            })?;
        Ok(Self {
            validator,
            defaults: extract_defaults(schema),
        })
    }

    /// Validate the whole document; all field-level violations are
    /// aggregated into one `` `<path>` <message>; ... `` string.
    pub fn validate(&self, doc: &Map<String, Value>) -> Result<()> {
        let instance = Value::Object(doc.clone());
        let details: Vec<String> = self
            .validator
            .iter_errors(&instance)
            .map(|err| format!("`{}` {err}", err.instance_path))
            .collect();
        if details.is_empty() {
            Ok(())
        } else {
            Err(StoreError::SchemaViolation {
                details: details.join("; "),
            })
        }
    }

    /// `default` values declared on top-level properties.
    #[must_use]
    pub fn defaults(&self) -> &Map<String, Value> {
        &self.defaults
    }
}

fn extract_defaults(schema: &Value) -> Map<String, Value> {
    let mut defaults = Map::new();
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return defaults;
    };
    for (key, property) in properties {
        if let Some(default) = property.get("default") {
            defaults.insert(key.clone(), default.clone());
        }
    }
    defaults
}
