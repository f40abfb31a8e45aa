//! Thin wrapper around the `jsonschema` crate used by both catalogs (C1/C2)
//! to validate dynamic JSON at the API boundary (spec.md §9 design note:
//! schema-validated dynamic records).

use serde_json::Value;

pub struct CompiledSchema {
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    /// Compiles a schema literal embedded in this crate. Panics if the
    /// literal itself is malformed — a programming error in the catalog,
    /// never a runtime condition.
    pub fn compile(schema: &Value) -> Self {
        let validator =
            jsonschema::validator_for(schema).expect("built-in catalog schema must be valid JSON Schema");
        Self { validator }
    }

    pub fn validate(&self, instance: &Value) -> crate::error::Result<()> {
        match self.validator.validate(instance) {
            Ok(()) => Ok(()),
            Err(e) => Err(crate::error::Error::Protocol(e.to_string())),
        }
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.validator.is_valid(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_matching_instance() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "required": ["broadcaster_user_id"],
            "properties": { "broadcaster_user_id": { "type": "string" } }
        }));
        assert!(schema.validate(&json!({"broadcaster_user_id": "123"})).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "required": ["broadcaster_user_id"],
            "properties": { "broadcaster_user_id": { "type": "string" } }
        }));
        assert!(schema.validate(&json!({})).is_err());
    }
}
