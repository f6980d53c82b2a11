//! JSON Schema validation for structured objects.

use serde_json::Value;

/// Validate `instance` against `schema`.
///
/// # Errors
/// Returns every validation failure joined into one message, or a message
/// describing why the schema itself is unusable.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator =
        jsonschema::Validator::new(schema).map_err(|e| format!("invalid schema: {e}"))?;
    if validator.is_valid(instance) {
        return Ok(());
    }
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| e.to_string())
        .collect();
    Err(errors.join("; "))
}
