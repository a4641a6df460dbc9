// src/schema.rs - Draft-07 schema validation for the side-channel verdict

use jsonschema::{Draft, JSONSchema};
use serde::Serialize;
use serde_json::Value;

/// One schema violation, with a human path (`root` or dot-joined keys and
/// indices), the failing validator keyword, and the validator's message.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaError {
    pub path: String,
    pub keyword: String,
    pub hint: String,
}

/// Compile-checks a client-supplied schema. A failure here is a client
/// error (400), not an artifact.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map(|_| ())
        .map_err(|e| format!("Invalid schema provided: {}", e))
}

/// Validates an instance against a schema, collecting every violation.
/// Returns `Err` only when the schema itself does not compile.
pub fn validate(schema: &Value, instance: &Value) -> Result<(bool, Vec<SchemaError>), String> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| format!("Invalid schema provided: {}", e))?;

    let result = match compiled.validate(instance) {
        Ok(()) => Ok((true, Vec::new())),
        Err(errors) => {
            let collected = errors
                .map(|error| SchemaError {
                    path: humanize_path(&error.instance_path.to_string()),
                    keyword: keyword_of_kind(&error.kind),
                    hint: error.to_string(),
                })
                .collect();
            Ok((false, collected))
        }
    };
    result
}

/// `/users/0/name` -> `users.0.name`, empty pointer -> `root`.
fn humanize_path(pointer: &str) -> String {
    let trimmed = pointer.trim_start_matches('/');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.replace('/', ".")
    }
}

/// The validator kind's name doubles as the JSON Schema keyword once the
/// leading letter is lowercased (Required -> required, MaxLength ->
/// maxLength).
fn keyword_of_kind(kind: &jsonschema::error::ValidationErrorKind) -> String {
    let debug = format!("{:?}", kind);
    let name = debug
        .split(|c: char| c == ' ' || c == '(' || c == '{')
        .next()
        .unwrap_or("schema");
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => "schema".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer", "minimum": 0}
            },
            "required": ["name", "age"]
        })
    }

    #[test]
    fn test_valid_instance_passes() {
        let (valid, errors) =
            validate(&person_schema(), &json!({"name": "John", "age": 30})).unwrap();
        assert!(valid);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_missing_required_field_reported() {
        let (valid, errors) = validate(&person_schema(), &json!({"name": "John"})).unwrap();
        assert!(!valid);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].keyword, "required");
        assert_eq!(errors[0].path, "root");
        assert!(errors[0].hint.contains("age"));
    }

    #[test]
    fn test_nested_path_is_dot_joined() {
        let schema = json!({
            "type": "object",
            "properties": {
                "users": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"id": {"type": "integer"}},
                        "required": ["id"]
                    }
                }
            }
        });
        let (valid, errors) =
            validate(&schema, &json!({"users": [{"id": 1}, {"id": "two"}]})).unwrap();
        assert!(!valid);
        assert_eq!(errors[0].path, "users.1.id");
        assert_eq!(errors[0].keyword, "type");
    }

    #[test]
    fn test_wrong_type_at_root() {
        let (valid, errors) = validate(&json!({"type": "array"}), &json!({"a": 1})).unwrap();
        assert!(!valid);
        assert_eq!(errors[0].path, "root");
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let bad = json!({"type": "not-a-real-type"});
        assert!(check_schema(&bad).is_err());
        assert!(validate(&bad, &json!({})).is_err());
    }

    #[test]
    fn test_valid_schema_accepted() {
        assert!(check_schema(&person_schema()).is_ok());
    }
}
