//! `elicitation/create`: a server asks the client's user for structured
//! input described by a restricted JSON schema.
//!
//! The restriction is validated *before* the request leaves the server: the
//! schema must describe a flat object whose properties are all primitive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ErrorData, JsonObject};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateElicitationRequestParam {
    /// Message shown to the user alongside the input form.
    pub message: String,
    pub requested_schema: JsonObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateElicitationResult {
    pub action: ElicitationAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

const PRIMITIVE_TYPES: [&str; 4] = ["string", "number", "integer", "boolean"];
const STRING_FORMATS: [&str; 4] = ["email", "uri", "date", "date-time"];

fn invalid(message: String) -> ErrorData {
    ErrorData::invalid_params(message, None)
}

fn as_non_negative(property: &str, field: &str, value: &Value) -> Result<u64, ErrorData> {
    value
        .as_u64()
        .ok_or_else(|| invalid(format!("property {property}: {field} must be a non-negative integer")))
}

fn check_string_schema(name: &str, schema: &JsonObject) -> Result<(), ErrorData> {
    let min = schema
        .get("minLength")
        .map(|v| as_non_negative(name, "minLength", v))
        .transpose()?;
    let max = schema
        .get("maxLength")
        .map(|v| as_non_negative(name, "maxLength", v))
        .transpose()?;
    if let (Some(min), Some(max)) = (min, max) {
        if max < min {
            return Err(invalid(format!(
                "property {name}: maxLength must be >= minLength"
            )));
        }
    }
    if let Some(format) = schema.get("format") {
        let format = format
            .as_str()
            .ok_or_else(|| invalid(format!("property {name}: format must be a string")))?;
        if !STRING_FORMATS.contains(&format) {
            return Err(invalid(format!(
                "property {name}: unsupported string format {format:?}"
            )));
        }
    }
    Ok(())
}

fn check_numeric_schema(name: &str, schema: &JsonObject) -> Result<(), ErrorData> {
    let minimum = schema.get("minimum").map(Value::as_f64);
    let maximum = schema.get("maximum").map(Value::as_f64);
    if let Some(None) = minimum {
        return Err(invalid(format!("property {name}: minimum must be a number")));
    }
    if let Some(None) = maximum {
        return Err(invalid(format!("property {name}: maximum must be a number")));
    }
    if let (Some(Some(min)), Some(Some(max))) = (minimum, maximum) {
        if min > max {
            return Err(invalid(format!(
                "property {name}: minimum must be <= maximum"
            )));
        }
    }
    Ok(())
}

fn check_enum(name: &str, schema: &JsonObject) -> Result<(), ErrorData> {
    let enum_len = match schema.get("enum") {
        None => {
            if schema.contains_key("enumNames") {
                return Err(invalid(format!(
                    "property {name}: enumNames without enum"
                )));
            }
            return Ok(());
        }
        Some(Value::Array(values)) => values.len(),
        Some(_) => return Err(invalid(format!("property {name}: enum must be an array"))),
    };
    if let Some(names) = schema.get("enumNames") {
        let Value::Array(names) = names else {
            return Err(invalid(format!(
                "property {name}: enumNames must be an array of strings"
            )));
        };
        if names.iter().any(|n| !n.is_string()) {
            return Err(invalid(format!(
                "property {name}: enumNames must be an array of strings"
            )));
        }
        if names.len() != enum_len {
            return Err(invalid(format!(
                "property {name}: enumNames length must match enum length"
            )));
        }
    }
    Ok(())
}

/// Validate an elicitation schema against the restricted form: an object
/// whose direct properties are all primitive-typed, with enum/enumNames
/// agreement and ordered bounds. Called before the request is sent.
pub fn validate_elicitation_schema(schema: &JsonObject) -> Result<(), ErrorData> {
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {}
        Some(other) => {
            return Err(invalid(format!(
                "elicitation schema root must have type \"object\", got {other:?}"
            )));
        }
        None => {
            return Err(invalid(
                "elicitation schema root must have type \"object\"".to_string(),
            ));
        }
    }
    let properties = match schema.get("properties") {
        None => return Ok(()),
        Some(Value::Object(properties)) => properties,
        Some(_) => return Err(invalid("properties must be an object".to_string())),
    };
    for (name, property) in properties {
        let Value::Object(property) = property else {
            return Err(invalid(format!("property {name}: schema must be an object")));
        };
        let type_ = property
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("property {name}: missing primitive type")))?;
        if !PRIMITIVE_TYPES.contains(&type_) {
            return Err(invalid(format!(
                "property {name}: type must be one of string, number, integer or boolean, got {type_:?}"
            )));
        }
        check_enum(name, property)?;
        match type_ {
            "string" => check_string_schema(name, property)?,
            "number" | "integer" => check_numeric_schema(name, property)?,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn non_object_root_is_rejected() {
        let err = validate_elicitation_schema(&schema(json!({"type": "string"}))).unwrap_err();
        assert!(err.message.contains("object"));
    }

    #[test]
    fn nested_object_property_is_rejected() {
        let err = validate_elicitation_schema(&schema(json!({
            "type": "object",
            "properties": {"address": {"type": "object", "properties": {}}},
        })))
        .unwrap_err();
        assert!(err.message.contains("address"));
    }

    #[test]
    fn array_property_is_rejected() {
        let result = validate_elicitation_schema(&schema(json!({
            "type": "object",
            "properties": {"tags": {"type": "array", "items": {"type": "string"}}},
        })));
        assert!(result.is_err());
    }

    #[test]
    fn enum_with_matching_names_is_accepted() {
        validate_elicitation_schema(&schema(json!({
            "type": "object",
            "properties": {
                "country": {
                    "type": "string",
                    "enum": ["US", "UK"],
                    "enumNames": ["United States", "United Kingdom"],
                }
            },
        })))
        .unwrap();
    }

    #[test]
    fn enum_name_length_mismatch_is_rejected() {
        let result = validate_elicitation_schema(&schema(json!({
            "type": "object",
            "properties": {
                "country": {"type": "string", "enum": ["US", "UK"], "enumNames": ["United States"]}
            },
        })));
        assert!(result.is_err());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        assert!(
            validate_elicitation_schema(&schema(json!({
                "type": "object",
                "properties": {"age": {"type": "integer", "minimum": 10, "maximum": 5}},
            })))
            .is_err()
        );
        assert!(
            validate_elicitation_schema(&schema(json!({
                "type": "object",
                "properties": {"name": {"type": "string", "minLength": 10, "maxLength": 5}},
            })))
            .is_err()
        );
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let result = validate_elicitation_schema(&schema(json!({
            "type": "object",
            "properties": {"when": {"type": "string", "format": "duration"}},
        })));
        assert!(result.is_err());
    }

    #[test]
    fn full_valid_schema_passes() {
        validate_elicitation_schema(&schema(json!({
            "type": "object",
            "properties": {
                "email": {"type": "string", "format": "email", "minLength": 3, "maxLength": 100},
                "age": {"type": "integer", "minimum": 0, "maximum": 150},
                "newsletter": {"type": "boolean"},
            },
            "required": ["email"],
        })))
        .unwrap();
    }
}
