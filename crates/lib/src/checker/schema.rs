//! JSON Schema validation for checker data.
//!
//! Checker data is a free-form map; each checker declares a JSON Schema for
//! the properties it reads. Unknown properties stay allowed since the same map
//! also carries orchestration flags like `parent-id`.

use jsonschema::Draft;
use serde_json::{Map, Value};

/// Validate `data` against `schema`, joining every violation into one message.
pub fn validate(schema: &Value, data: &Map<String, Value>) -> Result<(), String> {
  let validator = jsonschema::options()
    .with_draft(Draft::Draft7)
    .should_validate_formats(true)
    .build(schema)
    .map_err(|e| format!("invalid schema: {}", e))?;

  let instance = Value::Object(data.clone());
  let errors: Vec<String> = validator.iter_errors(&instance).map(|e| e.to_string()).collect();
  if errors.is_empty() { Ok(()) } else { Err(errors.join("; ")) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn schema() -> Value {
    json!({
      "type": "object",
      "properties": {
        "url": {"type": "string"},
        "pattern": {"type": "string", "format": "regex"},
        "sort-tags": {"type": "boolean"},
        "version-scheme": {"type": "string", "enum": ["loose", "semantic"]}
      },
      "required": ["url"]
    })
  }

  fn check(value: Value) -> Result<(), String> {
    validate(&schema(), value.as_object().unwrap())
  }

  #[test]
  fn accepts_valid_data_with_extra_keys() {
    assert!(check(json!({"type": "x", "url": "https://x", "pattern": "v(\\d+)", "parent-id": "a"})).is_ok());
  }

  #[test]
  fn missing_required_property() {
    let err = check(json!({"pattern": "x"})).unwrap_err();
    assert!(err.contains("url"));
  }

  #[test]
  fn wrong_type() {
    assert!(check(json!({"url": 3})).is_err());
    assert!(check(json!({"url": "x", "sort-tags": "yes"})).is_err());
  }

  #[test]
  fn invalid_regex() {
    assert!(check(json!({"url": "x", "pattern": "("})).is_err());
  }

  #[test]
  fn value_outside_enum() {
    assert!(check(json!({"url": "x", "version-scheme": "semantic"})).is_ok());
    assert!(check(json!({"url": "x", "version-scheme": "calendar"})).is_err());
  }
}
