// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-Schema-subset validation for tool parameters.
//!
//! Covers the subset tools actually declare: `type` (including `null` unions
//! and `nullable`), `required`, `properties`, `additionalProperties`, length
//! and size bounds, `pattern`, `enum`, `const`, `multipleOf`, exclusive
//! bounds, `anyOf`/`oneOf`/`allOf`, the `email`/`uri`/`uuid` formats, and
//! optional type coercion (string→number, string→bool, number→string).
//!
//! Validation failures never become exceptions: the executor converts the
//! error list into an error tool result so the model can correct itself.

use regex::Regex;
use serde_json::{Map, Value};

/// Validate `value` against `schema`.  Returns the (possibly coerced) value
/// or a list of human-readable errors.
pub fn validate(schema: &Value, value: &Value, coerce: bool) -> Result<Value, Vec<String>> {
    let mut errors = Vec::new();
    let out = check(schema, value, "params", coerce, &mut errors);
    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

fn check(schema: &Value, value: &Value, path: &str, coerce: bool, errors: &mut Vec<String>) -> Value {
    let Some(schema_obj) = schema.as_object() else {
        // `true`, absent, or malformed subschemas are permissive.
        return value.clone();
    };

    if let Some(expected) = schema_obj.get("const") {
        if value != expected {
            errors.push(format!("{path}: must equal {expected}"));
        }
        return value.clone();
    }

    if let Some(variants) = schema_obj.get("enum").and_then(Value::as_array) {
        if !variants.contains(value) {
            let rendered: Vec<String> = variants.iter().map(Value::to_string).collect();
            errors.push(format!("{path}: must be one of {}", rendered.join(", ")));
        }
        return value.clone();
    }

    if let Some(subs) = schema_obj.get("anyOf").and_then(Value::as_array) {
        return check_any_of(subs, value, path, coerce, errors);
    }
    if let Some(subs) = schema_obj.get("oneOf").and_then(Value::as_array) {
        return check_one_of(subs, value, path, coerce, errors);
    }
    if let Some(subs) = schema_obj.get("allOf").and_then(Value::as_array) {
        let mut out = value.clone();
        for sub in subs {
            out = check(sub, &out, path, coerce, errors);
        }
        return out;
    }

    let allowed = allowed_types(schema_obj);
    let value = match coerce_value(&allowed, value, coerce) {
        Some(coerced) => coerced,
        None => value.clone(),
    };

    if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, &value)) {
        errors.push(format!(
            "{path}: expected {}, got {}",
            allowed.join(" or "),
            type_name(&value)
        ));
        return value;
    }

    match &value {
        Value::String(s) => check_string(schema_obj, s, path, errors),
        Value::Number(_) => check_number(schema_obj, &value, path, errors),
        Value::Array(items) => return check_array(schema_obj, items, path, coerce, errors),
        Value::Object(map) => return check_object(schema_obj, map, path, coerce, errors),
        _ => {}
    }
    value
}

fn check_any_of(
    subs: &[Value],
    value: &Value,
    path: &str,
    coerce: bool,
    errors: &mut Vec<String>,
) -> Value {
    for sub in subs {
        let mut sub_errors = Vec::new();
        let out = check(sub, value, path, coerce, &mut sub_errors);
        if sub_errors.is_empty() {
            return out;
        }
    }
    errors.push(format!("{path}: does not match any allowed schema"));
    value.clone()
}

fn check_one_of(
    subs: &[Value],
    value: &Value,
    path: &str,
    coerce: bool,
    errors: &mut Vec<String>,
) -> Value {
    let mut matched: Option<Value> = None;
    let mut matches = 0usize;
    for sub in subs {
        let mut sub_errors = Vec::new();
        let out = check(sub, value, path, coerce, &mut sub_errors);
        if sub_errors.is_empty() {
            matches += 1;
            matched = Some(out);
        }
    }
    match matches {
        1 => matched.unwrap(),
        0 => {
            errors.push(format!("{path}: does not match any allowed schema"));
            value.clone()
        }
        n => {
            errors.push(format!("{path}: matches {n} schemas, expected exactly one"));
            value.clone()
        }
    }
}

/// Types accepted by this schema: the `type` keyword (string or list) plus
/// `"null"` when `nullable: true`.
fn allowed_types(schema: &Map<String, Value>) -> Vec<String> {
    let mut types: Vec<String> = match schema.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => vec![],
    };
    if schema.get("nullable").and_then(Value::as_bool) == Some(true)
        && !types.iter().any(|t| t == "null")
    {
        types.push("null".into());
    }
    types
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value
            .as_f64()
            .map(|f| f.fract() == 0.0)
            .unwrap_or(false),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Caller-requested coercions applied before type checking.
fn coerce_value(allowed: &[String], value: &Value, coerce: bool) -> Option<Value> {
    if !coerce || allowed.is_empty() || allowed.iter().any(|t| type_matches(t, value)) {
        return None;
    }
    let wants = |t: &str| allowed.iter().any(|a| a == t);
    match value {
        Value::String(s) if wants("number") || wants("integer") => {
            s.trim().parse::<f64>().ok().and_then(|f| {
                if wants("integer") && f.fract() != 0.0 {
                    None
                } else {
                    serde_json::Number::from_f64(f).map(Value::Number)
                }
            })
        }
        Value::String(s) if wants("boolean") => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Value::Number(n) if wants("string") => Some(Value::String(n.to_string())),
        _ => None,
    }
}

fn check_string(schema: &Map<String, Value>, s: &str, path: &str, errors: &mut Vec<String>) {
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if (s.chars().count() as u64) < min {
            errors.push(format!("{path}: must be at least {min} characters"));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if (s.chars().count() as u64) > max {
            errors.push(format!("{path}: must be at most {max} characters"));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        if let Ok(re) = Regex::new(pattern) {
            if !re.is_match(s) {
                errors.push(format!("{path}: does not match pattern {pattern}"));
            }
        }
    }
    if let Some(format) = schema.get("format").and_then(Value::as_str) {
        let ok = match format {
            "email" => Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap().is_match(s),
            "uri" => Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*:").unwrap().is_match(s),
            "uuid" => Regex::new(
                r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
            )
            .unwrap()
            .is_match(s),
            // Unknown formats are annotations, not constraints.
            _ => true,
        };
        if !ok {
            errors.push(format!("{path}: is not a valid {format}"));
        }
    }
}

fn check_number(schema: &Map<String, Value>, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(n) = value.as_f64() else { return };
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            errors.push(format!("{path}: must be >= {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            errors.push(format!("{path}: must be <= {max}"));
        }
    }
    if let Some(min) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
        if n <= min {
            errors.push(format!("{path}: must be > {min}"));
        }
    }
    if let Some(max) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
        if n >= max {
            errors.push(format!("{path}: must be < {max}"));
        }
    }
    if let Some(step) = schema.get("multipleOf").and_then(Value::as_f64) {
        if step > 0.0 {
            let ratio = n / step;
            if (ratio - ratio.round()).abs() > 1e-9 {
                errors.push(format!("{path}: must be a multiple of {step}"));
            }
        }
    }
}

fn check_array(
    schema: &Map<String, Value>,
    items: &[Value],
    path: &str,
    coerce: bool,
    errors: &mut Vec<String>,
) -> Value {
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            errors.push(format!("{path}: must have at least {min} items"));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if (items.len() as u64) > max {
            errors.push(format!("{path}: must have at most {max} items"));
        }
    }
    let out: Vec<Value> = match schema.get("items") {
        Some(item_schema) => items
            .iter()
            .enumerate()
            .map(|(i, v)| check(item_schema, v, &format!("{path}[{i}]"), coerce, errors))
            .collect(),
        None => items.to_vec(),
    };
    Value::Array(out)
}

fn check_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    coerce: bool,
    errors: &mut Vec<String>,
) -> Value {
    if let Some(min) = schema.get("minProperties").and_then(Value::as_u64) {
        if (map.len() as u64) < min {
            errors.push(format!("{path}: must have at least {min} properties"));
        }
    }
    if let Some(max) = schema.get("maxProperties").and_then(Value::as_u64) {
        if (map.len() as u64) > max {
            errors.push(format!("{path}: must have at most {max} properties"));
        }
    }

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(key) {
                errors.push(format!("{path}.{key}: is required"));
            }
        }
    }

    let mut out = Map::new();
    for (key, v) in map {
        let child_path = format!("{path}.{key}");
        if let Some(prop_schema) = properties.get(key) {
            out.insert(key.clone(), check(prop_schema, v, &child_path, coerce, errors));
            continue;
        }
        match schema.get("additionalProperties") {
            Some(Value::Bool(false)) => {
                errors.push(format!("{child_path}: unknown property"));
            }
            Some(extra) if extra.is_object() => {
                out.insert(key.clone(), check(extra, v, &child_path, coerce, errors));
            }
            _ => {
                out.insert(key.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_schema(properties: Value, required: &[&str]) -> Value {
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    #[test]
    fn valid_object_passes_through() {
        let schema = object_schema(json!({ "expression": { "type": "string" } }), &["expression"]);
        let value = json!({ "expression": "1+1" });
        assert_eq!(validate(&schema, &value, false).unwrap(), value);
    }

    #[test]
    fn missing_required_field_is_reported() {
        let schema = object_schema(json!({ "expression": { "type": "string" } }), &["expression"]);
        let errs = validate(&schema, &json!({}), false).unwrap_err();
        assert_eq!(errs, vec!["params.expression: is required"]);
    }

    #[test]
    fn wrong_type_is_reported_with_both_types() {
        let schema = object_schema(json!({ "count": { "type": "integer" } }), &[]);
        let errs = validate(&schema, &json!({ "count": "three" }), false).unwrap_err();
        assert_eq!(errs, vec!["params.count: expected integer, got string"]);
    }

    #[test]
    fn null_union_accepts_null() {
        let schema = object_schema(json!({ "name": { "type": ["string", "null"] } }), &[]);
        assert!(validate(&schema, &json!({ "name": null }), false).is_ok());
        assert!(validate(&schema, &json!({ "name": "x" }), false).is_ok());
        assert!(validate(&schema, &json!({ "name": 5 }), false).is_err());
    }

    #[test]
    fn nullable_flag_behaves_like_null_union() {
        let schema = object_schema(
            json!({ "name": { "type": "string", "nullable": true } }),
            &[],
        );
        assert!(validate(&schema, &json!({ "name": null }), false).is_ok());
    }

    #[test]
    fn string_to_number_coercion_under_flag() {
        let schema = object_schema(json!({ "count": { "type": "number" } }), &[]);
        let out = validate(&schema, &json!({ "count": "42.5" }), true).unwrap();
        assert_eq!(out["count"], 42.5);
        // Without the flag the same input fails.
        assert!(validate(&schema, &json!({ "count": "42.5" }), false).is_err());
    }

    #[test]
    fn string_to_integer_coercion_rejects_fractions() {
        let schema = object_schema(json!({ "count": { "type": "integer" } }), &[]);
        assert_eq!(
            validate(&schema, &json!({ "count": "7" }), true).unwrap()["count"],
            7.0
        );
        assert!(validate(&schema, &json!({ "count": "7.5" }), true).is_err());
    }

    #[test]
    fn string_to_bool_and_number_to_string_coercions() {
        let schema = object_schema(
            json!({
                "flag": { "type": "boolean" },
                "id": { "type": "string" },
            }),
            &[],
        );
        let out = validate(&schema, &json!({ "flag": "true", "id": 7 }), true).unwrap();
        assert_eq!(out["flag"], true);
        assert_eq!(out["id"], "7");
    }

    #[test]
    fn length_bounds_check_characters() {
        let schema = object_schema(
            json!({ "name": { "type": "string", "minLength": 2, "maxLength": 4 } }),
            &[],
        );
        assert!(validate(&schema, &json!({ "name": "ab" }), false).is_ok());
        assert!(validate(&schema, &json!({ "name": "a" }), false).is_err());
        assert!(validate(&schema, &json!({ "name": "abcde" }), false).is_err());
    }

    #[test]
    fn pattern_constraint() {
        let schema = object_schema(
            json!({ "branch": { "type": "string", "pattern": "^[a-z-]+$" } }),
            &[],
        );
        assert!(validate(&schema, &json!({ "branch": "main-dev" }), false).is_ok());
        assert!(validate(&schema, &json!({ "branch": "Main Dev" }), false).is_err());
    }

    #[test]
    fn enum_and_const_constraints() {
        let schema = object_schema(
            json!({
                "mode": { "enum": ["fast", "slow"] },
                "version": { "const": 2 },
            }),
            &[],
        );
        assert!(validate(&schema, &json!({ "mode": "fast", "version": 2 }), false).is_ok());
        let errs = validate(&schema, &json!({ "mode": "medium", "version": 1 }), false)
            .unwrap_err();
        assert_eq!(errs.len(), 2);
        assert!(errs[0].contains("must be one of"));
        assert!(errs[1].contains("must equal 2"));
    }

    #[test]
    fn numeric_bounds_inclusive_and_exclusive() {
        let schema = object_schema(
            json!({ "n": { "type": "number", "minimum": 1, "exclusiveMaximum": 10 } }),
            &[],
        );
        assert!(validate(&schema, &json!({ "n": 1 }), false).is_ok());
        assert!(validate(&schema, &json!({ "n": 10 }), false).is_err());
        assert!(validate(&schema, &json!({ "n": 0.5 }), false).is_err());
    }

    #[test]
    fn multiple_of_constraint() {
        let schema = object_schema(json!({ "n": { "type": "number", "multipleOf": 0.5 } }), &[]);
        assert!(validate(&schema, &json!({ "n": 2.5 }), false).is_ok());
        assert!(validate(&schema, &json!({ "n": 2.3 }), false).is_err());
    }

    #[test]
    fn array_items_and_bounds() {
        let schema = object_schema(
            json!({ "tags": {
                "type": "array",
                "items": { "type": "string" },
                "minItems": 1,
                "maxItems": 2,
            }}),
            &[],
        );
        assert!(validate(&schema, &json!({ "tags": ["a"] }), false).is_ok());
        assert!(validate(&schema, &json!({ "tags": [] }), false).is_err());
        assert!(validate(&schema, &json!({ "tags": ["a", "b", "c"] }), false).is_err());
        let errs = validate(&schema, &json!({ "tags": ["a", 3] }), false).unwrap_err();
        assert_eq!(errs, vec!["params.tags[1]: expected string, got number"]);
    }

    #[test]
    fn additional_properties_false_rejects_unknown_keys() {
        let schema = json!({
            "type": "object",
            "properties": { "known": { "type": "string" } },
            "additionalProperties": false,
        });
        let errs = validate(&schema, &json!({ "known": "x", "extra": 1 }), false).unwrap_err();
        assert_eq!(errs, vec!["params.extra: unknown property"]);
    }

    #[test]
    fn additional_properties_schema_validates_unknown_keys() {
        let schema = json!({
            "type": "object",
            "additionalProperties": { "type": "number" },
        });
        assert!(validate(&schema, &json!({ "a": 1, "b": 2 }), false).is_ok());
        assert!(validate(&schema, &json!({ "a": "x" }), false).is_err());
    }

    #[test]
    fn any_of_first_match_wins_and_coerces() {
        let schema = object_schema(
            json!({ "v": { "anyOf": [
                { "type": "number" },
                { "type": "string" },
            ]}}),
            &[],
        );
        assert!(validate(&schema, &json!({ "v": 3 }), false).is_ok());
        assert!(validate(&schema, &json!({ "v": "x" }), false).is_ok());
        assert!(validate(&schema, &json!({ "v": [] }), false).is_err());
    }

    #[test]
    fn one_of_rejects_multiple_matches() {
        let schema = object_schema(
            json!({ "v": { "oneOf": [
                { "type": "number" },
                { "type": "number", "minimum": 0 },
            ]}}),
            &[],
        );
        let errs = validate(&schema, &json!({ "v": 3 }), false).unwrap_err();
        assert!(errs[0].contains("exactly one"));
    }

    #[test]
    fn all_of_accumulates_constraints() {
        let schema = object_schema(
            json!({ "v": { "allOf": [
                { "type": "number", "minimum": 0 },
                { "type": "number", "maximum": 10 },
            ]}}),
            &[],
        );
        assert!(validate(&schema, &json!({ "v": 5 }), false).is_ok());
        assert!(validate(&schema, &json!({ "v": 11 }), false).is_err());
    }

    #[test]
    fn formats_email_uri_uuid() {
        let schema = object_schema(
            json!({
                "mail": { "type": "string", "format": "email" },
                "link": { "type": "string", "format": "uri" },
                "id": { "type": "string", "format": "uuid" },
            }),
            &[],
        );
        let good = json!({
            "mail": "dev@example.com",
            "link": "https://example.com/x",
            "id": "6fa1afc1-90d2-4c31-8df2-1a0a48f0a2bb",
        });
        assert!(validate(&schema, &good, false).is_ok());

        let bad = json!({ "mail": "not-an-email", "link": "no scheme", "id": "1234" });
        let errs = validate(&schema, &bad, false).unwrap_err();
        assert_eq!(errs.len(), 3);
    }

    #[test]
    fn min_max_properties() {
        let schema = json!({ "type": "object", "minProperties": 1, "maxProperties": 2 });
        assert!(validate(&schema, &json!({}), false).is_err());
        assert!(validate(&schema, &json!({ "a": 1 }), false).is_ok());
        assert!(validate(&schema, &json!({ "a": 1, "b": 2, "c": 3 }), false).is_err());
    }

    #[test]
    fn permissive_when_schema_is_not_an_object() {
        assert!(validate(&json!(true), &json!({ "anything": 1 }), false).is_ok());
    }
}
