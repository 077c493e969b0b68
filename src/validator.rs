//! Request body validation against resource schemas.
//!
//! The validator classifies every declared field of a schema and reports
//! all violations at once rather than stopping at the first one. A valid
//! payload comes back normalized (integral floats become integers for
//! `integer` fields, the identifier field is dropped).

use crate::config::FieldKind;
use crate::schema::{FieldSchema, Format, ResourceSchema};
use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

/// Compile a regex literal that is known to be valid.
macro_rules! static_regex {
    ($pattern:expr, $name:expr) => {
        Regex::new($pattern)
            .unwrap_or_else(|_| panic!("Static regex '{}' failed to compile", $name))
    };
}

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| static_regex!(r"^[^@\s]+@[^@\s]+\.[^@\s]+$", "EMAIL_RE"));
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    static_regex!(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
        "UUID_RE"
    )
});
static URI_RE: LazyLock<Regex> =
    LazyLock::new(|| static_regex!(r"^[a-zA-Z][a-zA-Z0-9+.-]*://\S+$", "URI_RE"));
static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    static_regex!(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        "HOSTNAME_RE"
    )
});
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| static_regex!(r"^\+?[0-9 ().-]{7,20}$", "PHONE_RE"));

/// The constraint a violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    Required,
    Type,
    Format,
    Minimum,
    Maximum,
    MinLength,
    MaxLength,
    Pattern,
    Enum,
    MinItems,
    MaxItems,
    Unknown,
}

/// A single field-level problem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    /// Dotted / indexed path, e.g. `address.city` or `tags[2]`.
    pub field: String,
    pub constraint: Constraint,
    /// The offending value (absent for missing fields).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub message: String,
}

impl Violation {
    fn new(
        field: &str,
        constraint: Constraint,
        value: Option<&Value>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.to_string(),
            constraint,
            value: value.cloned(),
            message: message.into(),
        }
    }
}

/// Outcome of validating a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The normalized payload.
    Valid(Map<String, Value>),
    Invalid(Vec<Violation>),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid(_))
    }
}

/// Validation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Unknown fields are violations.
    pub strict: bool,
    /// Required fields may be absent (PATCH semantics).
    pub partial: bool,
}

/// Schema validator. Stateless; all compiled state lives in the schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a payload against a resource schema.
    pub fn validate(
        &self,
        schema: &ResourceSchema,
        payload: &Value,
        options: ValidationOptions,
    ) -> Verdict {
        let Some(object) = payload.as_object() else {
            return Verdict::Invalid(vec![Violation::new(
                "",
                Constraint::Type,
                Some(payload),
                "expected a JSON object",
            )]);
        };

        let mut violations = Vec::new();
        let mut normalized = Map::new();

        for field in &schema.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    // A partial payload may omit a required field but not null it out.
                    let cleared = object.contains_key(&field.name);
                    if field.schema.required && (cleared || !options.partial) {
                        violations.push(Violation::new(
                            &field.name,
                            Constraint::Required,
                            None,
                            format!("{} is required", field.name),
                        ));
                    } else if cleared {
                        normalized.insert(field.name.clone(), Value::Null);
                    }
                }
                Some(value) => {
                    if let Some(value) =
                        check_value(&field.name, &field.schema, value, options.strict, &mut violations)
                    {
                        normalized.insert(field.name.clone(), value);
                    }
                }
            }
        }

        for (key, value) in object {
            if key == &schema.id_field || schema.field(key).is_some() {
                continue;
            }
            if options.strict {
                violations.push(Violation::new(
                    key,
                    Constraint::Unknown,
                    Some(value),
                    format!("{} is not a field of {}", key, schema.name),
                ));
            } else {
                normalized.insert(key.clone(), value.clone());
            }
        }

        if violations.is_empty() {
            Verdict::Valid(normalized)
        } else {
            Verdict::Invalid(violations)
        }
    }
}

/// Check a single value against a field schema.
///
/// Returns the normalized value, or the violations found under `path`.
pub fn check_field(
    path: &str,
    schema: &FieldSchema,
    value: &Value,
    strict: bool,
) -> Result<Value, Vec<Violation>> {
    let mut violations = Vec::new();
    match check_value(path, schema, value, strict, &mut violations) {
        Some(value) if violations.is_empty() => Ok(value),
        _ => Err(violations),
    }
}

/// Returns `None` when the value has the wrong type; constraint violations
/// still yield the normalized value so nested paths are all reported.
fn check_value(
    path: &str,
    schema: &FieldSchema,
    value: &Value,
    strict: bool,
    violations: &mut Vec<Violation>,
) -> Option<Value> {
    let normalized = match schema.kind {
        FieldKind::String => {
            let Some(s) = value.as_str() else {
                violations.push(type_violation(path, schema.kind, value));
                return None;
            };
            check_string(path, schema, s, value, violations);
            value.clone()
        }
        FieldKind::Integer => {
            let Some(n) = as_integer(value) else {
                violations.push(type_violation(path, schema.kind, value));
                return None;
            };
            let normalized = Value::from(n);
            check_range(path, schema, n as f64, &normalized, violations);
            normalized
        }
        FieldKind::Number => {
            let Some(n) = value.as_f64() else {
                violations.push(type_violation(path, schema.kind, value));
                return None;
            };
            check_range(path, schema, n, value, violations);
            value.clone()
        }
        FieldKind::Boolean => {
            if !value.is_boolean() {
                violations.push(type_violation(path, schema.kind, value));
                return None;
            }
            value.clone()
        }
        FieldKind::Array => {
            let Some(items) = value.as_array() else {
                violations.push(type_violation(path, schema.kind, value));
                return None;
            };
            check_items(path, schema, items, strict, violations)
        }
        FieldKind::Object => {
            let Some(object) = value.as_object() else {
                violations.push(type_violation(path, schema.kind, value));
                return None;
            };
            check_object(path, schema, object, strict, violations)
        }
    };

    if !schema.constraints.enum_values.is_empty()
        && !schema
            .constraints
            .enum_values
            .iter()
            .any(|candidate| values_equal(candidate, &normalized))
    {
        violations.push(Violation::new(
            path,
            Constraint::Enum,
            Some(value),
            format!("{} must be one of {}", path, Value::from(schema.constraints.enum_values.clone())),
        ));
    }

    Some(normalized)
}

fn check_string(
    path: &str,
    schema: &FieldSchema,
    s: &str,
    value: &Value,
    violations: &mut Vec<Violation>,
) {
    let constraints = &schema.constraints;
    let len = s.chars().count();

    if let Some(format) = schema.format {
        if !format_matches(format, s) {
            violations.push(Violation::new(
                path,
                Constraint::Format,
                Some(value),
                format!("{} is not a valid {}", path, format.as_str()),
            ));
        }
    }
    if let Some(min) = constraints.min_length {
        if len < min {
            violations.push(Violation::new(
                path,
                Constraint::MinLength,
                Some(value),
                format!("{} must be at least {} characters", path, min),
            ));
        }
    }
    if let Some(max) = constraints.max_length {
        if len > max {
            violations.push(Violation::new(
                path,
                Constraint::MaxLength,
                Some(value),
                format!("{} must be at most {} characters", path, max),
            ));
        }
    }
    if let Some(pattern) = &constraints.pattern {
        if !pattern.regex().is_match(s) {
            violations.push(Violation::new(
                path,
                Constraint::Pattern,
                Some(value),
                format!("{} must match {}", path, pattern.source()),
            ));
        }
    }
}

fn check_range(
    path: &str,
    schema: &FieldSchema,
    n: f64,
    value: &Value,
    violations: &mut Vec<Violation>,
) {
    if let Some(min) = schema.constraints.minimum {
        if n < min {
            violations.push(Violation::new(
                path,
                Constraint::Minimum,
                Some(value),
                format!("{} must be >= {}", path, min),
            ));
        }
    }
    if let Some(max) = schema.constraints.maximum {
        if n > max {
            violations.push(Violation::new(
                path,
                Constraint::Maximum,
                Some(value),
                format!("{} must be <= {}", path, max),
            ));
        }
    }
}

fn check_items(
    path: &str,
    schema: &FieldSchema,
    items: &[Value],
    strict: bool,
    violations: &mut Vec<Violation>,
) -> Value {
    let constraints = &schema.constraints;
    if let Some(min) = constraints.min_items {
        if items.len() < min {
            violations.push(Violation::new(
                path,
                Constraint::MinItems,
                Some(&Value::from(items.len())),
                format!("{} must have at least {} items", path, min),
            ));
        }
    }
    if let Some(max) = constraints.max_items {
        if items.len() > max {
            violations.push(Violation::new(
                path,
                Constraint::MaxItems,
                Some(&Value::from(items.len())),
                format!("{} must have at most {} items", path, max),
            ));
        }
    }

    let Some(item_schema) = &schema.items else {
        return Value::Array(items.to_vec());
    };
    let normalized = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let item_path = format!("{}[{}]", path, i);
            check_value(&item_path, item_schema, item, strict, violations)
                .unwrap_or_else(|| item.clone())
        })
        .collect();
    Value::Array(normalized)
}

fn check_object(
    path: &str,
    schema: &FieldSchema,
    object: &Map<String, Value>,
    strict: bool,
    violations: &mut Vec<Violation>,
) -> Value {
    if schema.properties.is_empty() {
        return Value::Object(object.clone());
    }

    let mut normalized = Map::new();
    for property in &schema.properties {
        let property_path = format!("{}.{}", path, property.name);
        match object.get(&property.name) {
            None | Some(Value::Null) => {
                if property.schema.required {
                    violations.push(Violation::new(
                        &property_path,
                        Constraint::Required,
                        None,
                        format!("{} is required", property_path),
                    ));
                }
            }
            Some(value) => {
                if let Some(value) =
                    check_value(&property_path, &property.schema, value, strict, violations)
                {
                    normalized.insert(property.name.clone(), value);
                }
            }
        }
    }

    for (key, value) in object {
        if schema.properties.iter().any(|p| &p.name == key) {
            continue;
        }
        if strict {
            let property_path = format!("{}.{}", path, key);
            violations.push(Violation::new(
                &property_path,
                Constraint::Unknown,
                Some(value),
                format!("{} is not a declared property", property_path),
            ));
        } else {
            normalized.insert(key.clone(), value.clone());
        }
    }

    Value::Object(normalized)
}

fn type_violation(path: &str, expected: FieldKind, value: &Value) -> Violation {
    Violation::new(
        path,
        Constraint::Type,
        Some(value),
        format!("{} must be of type {}", path, expected.as_str()),
    )
}

fn as_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// JSON equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Whether a string satisfies a format.
pub fn format_matches(format: Format, s: &str) -> bool {
    match format {
        Format::Email => EMAIL_RE.is_match(s),
        Format::Uuid => UUID_RE.is_match(s),
        Format::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
        Format::DateTime => DateTime::parse_from_rfc3339(s).is_ok(),
        Format::Uri => URI_RE.is_match(s),
        Format::Ipv4 => s.parse::<Ipv4Addr>().is_ok(),
        Format::Ipv6 => s.parse::<Ipv6Addr>().is_ok(),
        Format::Hostname => s.len() <= 253 && HOSTNAME_RE.is_match(s),
        Format::Password => true,
        Format::Phone => PHONE_RE.is_match(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaDefinition;
    use serde_json::json;

    fn user_schema() -> ResourceSchema {
        let def: SchemaDefinition = serde_yaml::from_str(
            r#"
name: User
fields:
  name: string
  email:
    type: string
    format: email
    required: true
  age:
    type: integer
    minimum: 0
    maximum: 150
  role:
    type: string
    enum: [admin, member]
  tags:
    type: array
    max_items: 2
    items:
      type: string
      min_length: 2
  address:
    type: object
    properties:
      city:
        type: string
        required: true
"#,
        )
        .unwrap();
        ResourceSchema::compile(&def).unwrap()
    }

    fn violations(verdict: Verdict) -> Vec<Violation> {
        match verdict {
            Verdict::Invalid(v) => v,
            Verdict::Valid(map) => panic!("Expected violations, got {:?}", map),
        }
    }

    #[test]
    fn test_missing_required_field_is_single_violation() {
        let schema = user_schema();
        let verdict = Validator::new().validate(
            &schema,
            &json!({"name": "Ada"}),
            ValidationOptions::default(),
        );
        let v = violations(verdict);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].field, "email");
        assert_eq!(v[0].constraint, Constraint::Required);
        assert!(v[0].value.is_none());
    }

    #[test]
    fn test_null_counts_as_missing() {
        let schema = user_schema();
        let verdict = Validator::new().validate(
            &schema,
            &json!({"email": null}),
            ValidationOptions::default(),
        );
        let v = violations(verdict);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].constraint, Constraint::Required);
    }

    #[test]
    fn test_reports_every_violation() {
        let schema = user_schema();
        let verdict = Validator::new().validate(
            &schema,
            &json!({
                "email": "not-an-email",
                "age": 200,
                "role": "owner",
                "tags": ["a", "bb", "cc"],
                "address": {}
            }),
            ValidationOptions::default(),
        );
        let v = violations(verdict);
        let found: Vec<(&str, Constraint)> =
            v.iter().map(|v| (v.field.as_str(), v.constraint)).collect();
        assert!(found.contains(&("email", Constraint::Format)));
        assert!(found.contains(&("age", Constraint::Maximum)));
        assert!(found.contains(&("role", Constraint::Enum)));
        assert!(found.contains(&("tags", Constraint::MaxItems)));
        assert!(found.contains(&("tags[0]", Constraint::MinLength)));
        assert!(found.contains(&("address.city", Constraint::Required)));
        assert_eq!(v.len(), 6);
    }

    #[test]
    fn test_unknown_fields_only_rejected_in_strict_mode() {
        let schema = user_schema();
        let payload = json!({"email": "ada@example.com", "nickname": "ada"});

        match Validator::new().validate(&schema, &payload, ValidationOptions::default()) {
            Verdict::Valid(map) => assert_eq!(map["nickname"], "ada"),
            other => panic!("Expected valid, got {:?}", other),
        }

        let strict = ValidationOptions {
            strict: true,
            partial: false,
        };
        let v = violations(Validator::new().validate(&schema, &payload, strict));
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].constraint, Constraint::Unknown);
        assert_eq!(v[0].field, "nickname");
    }

    #[test]
    fn test_partial_skips_required() {
        let schema = user_schema();
        let partial = ValidationOptions {
            strict: false,
            partial: true,
        };
        assert!(Validator::new()
            .validate(&schema, &json!({"name": "Grace"}), partial)
            .is_valid());
    }

    #[test]
    fn test_partial_cannot_clear_required() {
        let schema = user_schema();
        let partial = ValidationOptions {
            strict: false,
            partial: true,
        };
        let v = violations(Validator::new().validate(&schema, &json!({"email": null}), partial));
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].field, "email");
        assert_eq!(v[0].constraint, Constraint::Required);

        match Validator::new().validate(&schema, &json!({"name": null}), partial) {
            Verdict::Valid(map) => assert_eq!(map["name"], Value::Null),
            other => panic!("Expected valid, got {:?}", other),
        }
    }

    #[test]
    fn test_normalizes_integral_floats_and_drops_id() {
        let schema = user_schema();
        let verdict = Validator::new().validate(
            &schema,
            &json!({"id": "client-chosen", "email": "a@b.io", "age": 42.0}),
            ValidationOptions::default(),
        );
        match verdict {
            Verdict::Valid(map) => {
                assert_eq!(map["age"], json!(42));
                assert!(map["age"].is_i64());
                assert!(!map.contains_key("id"));
            }
            other => panic!("Expected valid, got {:?}", other),
        }
    }

    #[test]
    fn test_type_mismatch() {
        let schema = user_schema();
        let v = violations(Validator::new().validate(
            &schema,
            &json!({"email": 7, "age": 1.5}),
            ValidationOptions::default(),
        ));
        assert_eq!(v.len(), 2);
        assert!(v.iter().all(|v| v.constraint == Constraint::Type));
    }

    #[test]
    fn test_non_object_payload() {
        let schema = user_schema();
        let v = violations(Validator::new().validate(
            &schema,
            &json!([1, 2]),
            ValidationOptions::default(),
        ));
        assert_eq!(v[0].constraint, Constraint::Type);
    }

    #[test]
    fn test_formats() {
        assert!(format_matches(Format::Email, "ada@example.com"));
        assert!(!format_matches(Format::Email, "ada@"));
        assert!(format_matches(Format::Uuid, "123e4567-e89b-42d3-a456-426614174000"));
        assert!(format_matches(Format::Date, "2024-02-29"));
        assert!(!format_matches(Format::Date, "2023-02-29"));
        assert!(format_matches(Format::DateTime, "2024-01-01T10:00:00Z"));
        assert!(format_matches(Format::Uri, "https://example.com/a"));
        assert!(format_matches(Format::Ipv4, "10.0.0.1"));
        assert!(!format_matches(Format::Ipv4, "10.0.0.256"));
        assert!(format_matches(Format::Ipv6, "::1"));
        assert!(format_matches(Format::Hostname, "api.example.com"));
        assert!(format_matches(Format::Phone, "+1 (555) 010-2030"));
    }

    #[test]
    fn test_values_equal_numbers() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!("1")));
    }
}
