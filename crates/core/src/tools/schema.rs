// Validation for the JSON Schema subset used by tool input schemas:
// type, properties, required, additionalProperties (bool), enum, const,
// minLength/maxLength, minimum/maximum, items, minItems/maxItems.

use crate::error::FieldError;
use serde_json::{Map, Value};

/// Validate `input` against `schema`, collecting every violation.
/// An empty or non-object schema accepts anything.
pub fn validate(schema: &Value, input: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if let Value::Object(schema) = schema {
        validate_at(schema, input, "$", &mut errors);
    }
    errors
}

fn validate_at(schema: &Map<String, Value>, value: &Value, path: &str, errors: &mut Vec<FieldError>) {
    if let Some(expected) = schema.get("type") {
        if !matches_type(expected, value) {
            errors.push(FieldError::new(
                path,
                format!("expected {}, got {}", describe_type(expected), json_type(value)),
            ));
            // Nested keywords are meaningless on the wrong type
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            errors.push(FieldError::new(path, format!("must be one of {}", Value::Array(options.clone()))));
        }
    }

    if let Some(constant) = schema.get("const") {
        if constant != value {
            errors.push(FieldError::new(path, format!("must equal {}", constant)));
        }
    }

    match value {
        Value::Object(object) => validate_object(schema, object, path, errors),
        Value::Array(items) => validate_array(schema, items, path, errors),
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    errors.push(FieldError::new(path, format!("must be at least {} characters", min)));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    errors.push(FieldError::new(path, format!("must be at most {} characters", max)));
                }
            }
        }
        Value::Number(n) => {
            let Some(n) = n.as_f64() else { return };
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    errors.push(FieldError::new(path, format!("must be >= {}", min)));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    errors.push(FieldError::new(path, format!("must be <= {}", max)));
                }
            }
        }
        _ => {}
    }
}

fn validate_object(
    schema: &Map<String, Value>,
    object: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<FieldError>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                errors.push(FieldError::new(child_path(path, field), "is required"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);

    for (key, value) in object {
        match properties.and_then(|p| p.get(key)) {
            Some(Value::Object(property_schema)) => {
                validate_at(property_schema, value, &child_path(path, key), errors)
            }
            Some(_) => {}
            None => {
                if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                    errors.push(FieldError::new(child_path(path, key), "is not allowed"));
                }
            }
        }
    }
}

fn validate_array(schema: &Map<String, Value>, items: &[Value], path: &str, errors: &mut Vec<FieldError>) {
    let len = items.len() as u64;
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if len < min {
            errors.push(FieldError::new(path, format!("must contain at least {} items", min)));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if len > max {
            errors.push(FieldError::new(path, format!("must contain at most {} items", max)));
        }
    }

    if let Some(Value::Object(item_schema)) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{}[{}]", path, i), errors);
        }
    }
}

fn child_path(parent: &str, key: &str) -> String {
    format!("{}.{}", parent, key)
}

fn matches_type(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => matches_named_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| matches_named_type(name, value)),
        // Unknown type declarations don't constrain anything
        _ => true,
    }
}

fn matches_named_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
