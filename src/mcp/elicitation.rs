//! Server-initiated elicitation
//!
//! MCP restricts elicitation schemas to flat objects of primitive
//! properties, so checking a response needs no general JSON Schema engine.

use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::mcp::protocol::{RequestContext, RequestOptions};
use crate::mcp::types::{methods, ElicitAction, ElicitRequestParams, ElicitResult};

const PRIMITIVE_TYPES: &[&str] = &["string", "number", "integer", "boolean"];

/// Send `elicitation/create` on behalf of an in-flight request and check the answer
pub(crate) async fn send_request(
    request: &RequestContext,
    params: ElicitRequestParams,
    timeout: Duration,
) -> Result<ElicitResult> {
    validate_requested_schema(&params.requested_schema)?;

    let options = RequestOptions::with_timeout(timeout);
    let value = request
        .request(methods::ELICIT, Some(serde_json::to_value(&params)?), options)
        .await?;
    let result: ElicitResult = serde_json::from_value(value)?;
    debug!(action = ?result.action, "elicitation answered");

    if result.action == ElicitAction::Accept {
        let content = result.content.clone().unwrap_or_default();
        validate_content(&params.requested_schema, &content)?;
    }
    Ok(result)
}

/// Check that a schema is something clients are allowed to render
pub fn validate_requested_schema(schema: &Value) -> std::result::Result<(), ValidationError> {
    let invalid = |message: String| ValidationError::InvalidElicitationSchema { message };

    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(invalid("root type must be \"object\"".to_string()));
    }
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("\"properties\" must be an object".to_string()))?;

    for (name, property) in properties {
        let kind = property.get("type").and_then(Value::as_str).unwrap_or("");
        if !PRIMITIVE_TYPES.contains(&kind) {
            return Err(invalid(format!(
                "property '{}' must have a primitive type, got '{}'",
                name, kind
            )));
        }
        if let Some(options) = property.get("enum") {
            let all_strings = options
                .as_array()
                .is_some_and(|o| o.iter().all(Value::is_string));
            if kind != "string" || !all_strings {
                return Err(invalid(format!(
                    "enum on '{}' must be a list of strings on a string property",
                    name
                )));
            }
        }
    }

    if let Some(required) = schema.get("required") {
        let listed = required
            .as_array()
            .ok_or_else(|| invalid("\"required\" must be an array".to_string()))?;
        for name in listed {
            match name.as_str() {
                Some(name) if properties.contains_key(name) => {}
                _ => {
                    return Err(invalid(format!(
                        "required entry {} is not a declared property",
                        name
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Check accepted content against the schema it was requested with
pub fn validate_content(
    schema: &Value,
    content: &Map<String, Value>,
) -> std::result::Result<(), ValidationError> {
    let mut errors = Vec::new();
    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !content.contains_key(name) {
                errors.push(format!("'{}' is required", name));
            }
        }
    }

    for (name, value) in content {
        if let Some(property) = properties.get(name) {
            check_property(name, property, value, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::ElicitationContent { errors })
    }
}

fn check_property(name: &str, property: &Value, value: &Value, errors: &mut Vec<String>) {
    let number = |key: &str| property.get(key).and_then(Value::as_f64);

    match property.get("type").and_then(Value::as_str) {
        Some("string") => {
            let Some(text) = value.as_str() else {
                errors.push(format!("'{}' must be a string", name));
                return;
            };
            let length = text.chars().count() as f64;
            if let Some(min) = number("minLength") {
                if length < min {
                    errors.push(format!("'{}' must be at least {} characters", name, min));
                }
            }
            if let Some(max) = number("maxLength") {
                if length > max {
                    errors.push(format!("'{}' must be at most {} characters", name, max));
                }
            }
            if let Some(options) = property.get("enum").and_then(Value::as_array) {
                if !options.iter().any(|o| o.as_str() == Some(text)) {
                    errors.push(format!("'{}' must be one of {}", name, Value::Array(options.clone())));
                }
            }
        }
        Some(kind @ ("number" | "integer")) => {
            let is_integer = value.is_i64() || value.is_u64();
            let Some(n) = value.as_f64().filter(|_| kind == "number" || is_integer) else {
                errors.push(format!("'{}' must be {}", name, if kind == "integer" { "an integer" } else { "a number" }));
                return;
            };
            if let Some(min) = number("minimum") {
                if n < min {
                    errors.push(format!("'{}' must be >= {}", name, min));
                }
            }
            if let Some(max) = number("maximum") {
                if n > max {
                    errors.push(format!("'{}' must be <= {}", name, max));
                }
            }
        }
        Some("boolean") => {
            if !value.is_boolean() {
                errors.push(format!("'{}' must be a boolean", name));
            }
        }
        _ => {}
    }
}
