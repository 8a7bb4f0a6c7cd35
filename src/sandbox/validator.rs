use std::str::FromStr;

use serde_json::Value;

use crate::error::SandkitError;

/// Check applied to a value parsed by `execute_parsed_data`.
pub trait Validator: Send + Sync {
    /// Return a human-readable reason when the value is rejected.
    fn validate(&self, value: &Value) -> Result<(), String>;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<(), String> {
        self(value)
    }
}

/// JSON value kinds a field can be required to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl JsonType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => JsonType::String,
            Value::Number(_) => JsonType::Number,
            Value::Bool(_) => JsonType::Boolean,
            Value::Object(_) => JsonType::Object,
            Value::Array(_) => JsonType::Array,
            Value::Null => JsonType::Null,
        }
    }
}

impl FromStr for JsonType {
    type Err = SandkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" => Ok(JsonType::String),
            "number" => Ok(JsonType::Number),
            "boolean" | "bool" => Ok(JsonType::Boolean),
            "object" => Ok(JsonType::Object),
            "array" => Ok(JsonType::Array),
            "null" => Ok(JsonType::Null),
            other => Err(SandkitError::Config(format!("Unknown JSON type: {}", other))),
        }
    }
}

impl std::fmt::Display for JsonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::Null => "null",
        };
        f.write_str(name)
    }
}

/// Requires the parsed value to be an object whose named fields have given
/// JSON types.
#[derive(Debug, Clone, Default)]
pub struct FieldTypeValidator {
    fields: Vec<(String, JsonType)>,
}

impl FieldTypeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, kind: JsonType) -> Self {
        self.fields.push((field.into(), kind));
        self
    }

    /// Parse a `FIELD:TYPE` requirement, as given on the command line.
    pub fn parse_requirement(requirement: &str) -> crate::error::Result<(String, JsonType)> {
        let (field, kind) = requirement.split_once(':').ok_or_else(|| {
            SandkitError::Config(format!(
                "Invalid field requirement '{}': expected FIELD:TYPE",
                requirement
            ))
        })?;
        if field.is_empty() {
            return Err(SandkitError::Config(format!(
                "Invalid field requirement '{}': empty field name",
                requirement
            )));
        }
        Ok((field.to_string(), kind.parse()?))
    }
}

impl Validator for FieldTypeValidator {
    fn validate(&self, value: &Value) -> Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("expected an object, got {}", JsonType::of(value)))?;

        for (field, expected) in &self.fields {
            match object.get(field) {
                None => return Err(format!("missing required field '{}'", field)),
                Some(actual) if JsonType::of(actual) != *expected => {
                    return Err(format!(
                        "field '{}' must be {}, got {}",
                        field,
                        expected,
                        JsonType::of(actual)
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_type_validator() {
        let validator = FieldTypeValidator::new().require("a", JsonType::String);
        assert!(validator.validate(&json!({"a": "x"})).is_ok());
        assert_eq!(
            validator.validate(&json!({"a": 1})).unwrap_err(),
            "field 'a' must be string, got number"
        );
        assert!(validator.validate(&json!({})).is_err());
        assert!(validator.validate(&json!([1])).is_err());
    }

    #[test]
    fn test_closure_validator() {
        let positive = |value: &Value| match value.as_i64() {
            Some(n) if n > 0 => Ok(()),
            _ => Err("must be positive".to_string()),
        };
        assert!(positive.validate(&json!(3)).is_ok());
        assert!(positive.validate(&json!(-3)).is_err());
    }

    #[test]
    fn test_parse_requirement() {
        let (field, kind) = FieldTypeValidator::parse_requirement("name:string").unwrap();
        assert_eq!(field, "name");
        assert_eq!(kind, JsonType::String);
        assert!(FieldTypeValidator::parse_requirement("name").is_err());
        assert!(FieldTypeValidator::parse_requirement("name:date").is_err());
    }
}
