//! Compiled resource schemas.
//!
//! A [`ResourceSchema`] is built once from a [`SchemaDefinition`] and never
//! changes afterwards. Both the validator and the fake data generator read
//! the same compiled form, and [`SchemaSet::build`] refuses any schema the
//! generator could not satisfy.

use crate::auth::AuthRequirement;
use crate::config::{FieldDefinition, FieldKind, IdStrategy, SchemaDefinition};
use crate::error::SchemaError;
use crate::generator::{FakeDataGenerator, GenerationContext};
use crate::pattern::PatternGenerator;
use crate::validator::check_field;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Deepest supported nesting of arrays and objects.
pub const MAX_DEPTH: usize = 5;

/// Generated samples checked per field at registration.
const SAMPLES_PER_FIELD: u64 = 8;

/// Fixed seed for registration samples so startup is reproducible.
const SAMPLE_SEED: u64 = 0x5eed;

/// String formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Email,
    Uuid,
    Date,
    DateTime,
    Uri,
    Ipv4,
    Ipv6,
    Hostname,
    Password,
    Phone,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "email" => Format::Email,
            "uuid" => Format::Uuid,
            "date" => Format::Date,
            "date-time" => Format::DateTime,
            "uri" | "url" => Format::Uri,
            "ipv4" => Format::Ipv4,
            "ipv6" => Format::Ipv6,
            "hostname" => Format::Hostname,
            "password" => Format::Password,
            "phone" => Format::Phone,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Email => "email",
            Format::Uuid => "uuid",
            Format::Date => "date",
            Format::DateTime => "date-time",
            Format::Uri => "uri",
            Format::Ipv4 => "ipv4",
            Format::Ipv6 => "ipv6",
            Format::Hostname => "hostname",
            Format::Password => "password",
            Format::Phone => "phone",
        }
    }

    /// Formats whose values order chronologically.
    pub fn is_temporal(&self) -> bool {
        matches!(self, Format::Date | Format::DateTime)
    }
}

/// A `pattern` constraint: the matcher plus the generator for it.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    generator: PatternGenerator,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, String> {
        let regex = Regex::new(source).map_err(|e| format!("invalid pattern: {}", e))?;
        let generator = PatternGenerator::parse(source).map_err(|e| e.to_string())?;
        Ok(Self {
            source: source.to_string(),
            regex,
            generator,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn generator(&self) -> &PatternGenerator {
        &self.generator
    }
}

/// Validation constraints of one field.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub pattern: Option<Pattern>,
    pub enum_values: Vec<Value>,
}

/// Compiled field definition.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub kind: FieldKind,
    pub required: bool,
    pub format: Option<Format>,
    /// Semantic generator hint; the field name is used when absent.
    pub hint: Option<String>,
    pub example: Option<Value>,
    /// Target schema for reference fields.
    pub references: Option<String>,
    pub constraints: Constraints,
    pub items: Option<Box<FieldSchema>>,
    pub properties: Vec<Field>,
}

/// A named field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub schema: FieldSchema,
}

impl FieldSchema {
    fn compile(subject: &str, def: &FieldDefinition, depth: usize) -> Result<Self, SchemaError> {
        if depth > MAX_DEPTH {
            return Err(SchemaError::new(
                subject,
                format!("nesting deeper than {} levels", MAX_DEPTH),
            ));
        }
        let kind = def.kind;
        let err = |reason: String| SchemaError::new(subject, reason);
        let only = |set: bool, name: &str, allowed: &[FieldKind]| -> Result<(), SchemaError> {
            if set && !allowed.contains(&kind) {
                return Err(err(format!(
                    "'{}' does not apply to {} fields",
                    name,
                    kind.as_str()
                )));
            }
            Ok(())
        };

        const STRING: &[FieldKind] = &[FieldKind::String];
        const NUMERIC: &[FieldKind] = &[FieldKind::Integer, FieldKind::Number];
        const ARRAY: &[FieldKind] = &[FieldKind::Array];
        const OBJECT: &[FieldKind] = &[FieldKind::Object];
        const IDENT: &[FieldKind] = &[FieldKind::String, FieldKind::Integer];

        only(def.format.is_some(), "format", STRING)?;
        only(def.pattern.is_some(), "pattern", STRING)?;
        only(def.min_length.is_some() || def.max_length.is_some(), "length", STRING)?;
        only(def.minimum.is_some() || def.maximum.is_some(), "minimum/maximum", NUMERIC)?;
        only(def.min_items.is_some() || def.max_items.is_some(), "items count", ARRAY)?;
        only(def.items.is_some(), "items", ARRAY)?;
        only(!def.properties.is_empty(), "properties", OBJECT)?;
        only(def.references.is_some(), "references", IDENT)?;

        if depth > 0 && def.references.is_some() {
            return Err(err("references are only supported on top-level fields".into()));
        }

        let format = match &def.format {
            Some(name) => {
                Some(Format::parse(name).ok_or_else(|| err(format!("unknown format '{}'", name)))?)
            }
            None => None,
        };

        if let (Some(min), Some(max)) = (def.minimum, def.maximum) {
            if min > max {
                return Err(err(format!("minimum {} exceeds maximum {}", min, max)));
            }
        }
        if let (Some(min), Some(max)) = (def.min_length, def.max_length) {
            if min > max {
                return Err(err(format!("min_length {} exceeds max_length {}", min, max)));
            }
        }
        if let (Some(min), Some(max)) = (def.min_items, def.max_items) {
            if min > max {
                return Err(err(format!("min_items {} exceeds max_items {}", min, max)));
            }
        }

        let pattern = match &def.pattern {
            Some(source) => Some(Pattern::compile(source).map_err(err)?),
            None => None,
        };

        let enum_values = match &def.enum_values {
            Some(values) if values.is_empty() => {
                return Err(err("enum must list at least one value".into()))
            }
            Some(values) => {
                if let Some(bad) = values.iter().find(|v| !kind_accepts(kind, v)) {
                    return Err(err(format!(
                        "enum value {} is not of type {}",
                        bad,
                        kind.as_str()
                    )));
                }
                values.clone()
            }
            None => Vec::new(),
        };

        let items = match &def.items {
            Some(spec) => Some(Box::new(Self::compile(
                &format!("{}[]", subject),
                &spec.to_definition(),
                depth + 1,
            )?)),
            None => None,
        };

        let properties = def
            .properties
            .iter()
            .map(|(name, spec)| {
                Ok(Field {
                    name: name.clone(),
                    schema: Self::compile(
                        &format!("{}.{}", subject, name),
                        &spec.to_definition(),
                        depth + 1,
                    )?,
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;

        let compiled = Self {
            kind,
            required: def.required,
            format,
            hint: def.generator.clone(),
            example: def.example.clone(),
            references: def.references.clone(),
            constraints: Constraints {
                minimum: def.minimum,
                maximum: def.maximum,
                min_length: def.min_length,
                max_length: def.max_length,
                min_items: def.min_items,
                max_items: def.max_items,
                pattern,
                enum_values,
            },
            items,
            properties,
        };

        if let Some(example) = &compiled.example {
            if let Err(violations) = check_field(subject, &compiled, example, false) {
                let reason = violations
                    .first()
                    .map(|v| v.message.clone())
                    .unwrap_or_default();
                return Err(err(format!("example does not validate: {}", reason)));
            }
        }

        Ok(compiled)
    }
}

/// Whether a JSON value has the shape of a field kind.
fn kind_accepts(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::String => value.is_string(),
        FieldKind::Integer => value.as_f64().is_some_and(|f| f.fract() == 0.0),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Array => value.is_array(),
        FieldKind::Object => value.is_object(),
    }
}

/// Compiled resource schema.
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub name: String,
    pub id_field: String,
    pub id_strategy: IdStrategy,
    /// Per-schema strict override.
    pub strict: Option<bool>,
    /// Collection base path, when CRUD routes are generated.
    pub base_path: Option<String>,
    pub auth: Option<AuthRequirement>,
    pub initial_records: usize,
    /// Declared fields, excluding the identifier field.
    pub fields: Vec<Field>,
}

impl ResourceSchema {
    /// Compile a definition, checking everything that does not need the
    /// other schemas.
    pub fn compile(def: &SchemaDefinition) -> Result<Self, SchemaError> {
        if def.name.is_empty() {
            return Err(SchemaError::new("<unnamed>", "schema name cannot be empty"));
        }
        if def.id_field.is_empty() {
            return Err(SchemaError::new(&def.name, "id_field cannot be empty"));
        }

        let mut fields = Vec::with_capacity(def.fields.len());
        for (name, spec) in &def.fields {
            if name == &def.id_field {
                continue;
            }
            let subject = format!("{}.{}", def.name, name);
            fields.push(Field {
                name: name.clone(),
                schema: FieldSchema::compile(&subject, &spec.to_definition(), 0)?,
            });
        }

        let base_path = def
            .path
            .as_ref()
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            name: def.name.clone(),
            id_field: def.id_field.clone(),
            id_strategy: def.id,
            strict: def.strict,
            base_path,
            auth: def.auth.clone(),
            initial_records: def.initial_records,
            fields,
        })
    }

    /// Look up a declared field.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields holding identifiers of another schema.
    pub fn references(&self) -> impl Iterator<Item = (&Field, &str)> {
        self.fields
            .iter()
            .filter_map(|f| f.schema.references.as_deref().map(|target| (f, target)))
    }
}

/// All registered schemas, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    schemas: Vec<Arc<ResourceSchema>>,
    by_name: HashMap<String, usize>,
}

impl SchemaSet {
    /// Compile and cross-check a set of definitions.
    ///
    /// Rejects duplicate names, references to unknown schemas or of the
    /// wrong identifier type, and fields whose generated samples do not
    /// satisfy their own constraints.
    pub fn build(defs: &[SchemaDefinition]) -> Result<Self, SchemaError> {
        let mut set = SchemaSet::default();
        for def in defs {
            let schema = ResourceSchema::compile(def)?;
            if set.by_name.contains_key(&schema.name) {
                return Err(SchemaError::new(&schema.name, "duplicate schema name"));
            }
            set.by_name.insert(schema.name.clone(), set.schemas.len());
            set.schemas.push(Arc::new(schema));
        }

        for schema in &set.schemas {
            for (field, target) in schema.references() {
                let subject = format!("{}.{}", schema.name, field.name);
                let Some(target_schema) = set.get(target) else {
                    return Err(SchemaError::new(
                        subject,
                        format!("references unknown schema '{}'", target),
                    ));
                };
                let expected = match target_schema.id_strategy {
                    IdStrategy::Uuid => FieldKind::String,
                    IdStrategy::Sequence => FieldKind::Integer,
                };
                if field.schema.kind != expected {
                    return Err(SchemaError::new(
                        subject,
                        format!(
                            "{} identifiers are {} values, field is {}",
                            target,
                            expected.as_str(),
                            field.schema.kind.as_str()
                        ),
                    ));
                }
            }
        }

        let sampler = FakeDataGenerator::new(Some(SAMPLE_SEED));
        for schema in &set.schemas {
            check_generatable(schema, &sampler)?;
        }

        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ResourceSchema>> {
        self.by_name.get(name).map(|&i| &self.schemas[i])
    }

    /// Schemas in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceSchema>> {
        self.schemas.iter()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn check_generatable(
    schema: &ResourceSchema,
    sampler: &FakeDataGenerator,
) -> Result<(), SchemaError> {
    for field in schema.fields.iter().filter(|f| f.schema.references.is_none()) {
        for salt in 0..SAMPLES_PER_FIELD {
            let ctx = GenerationContext::with_salt(salt);
            let Some(sample) = sampler.generate(schema, &field.name, &ctx) else {
                continue;
            };
            if let Err(violations) = check_field(&field.name, &field.schema, &sample, false) {
                let reason = violations
                    .first()
                    .map(|v| v.message.clone())
                    .unwrap_or_default();
                return Err(SchemaError::new(
                    format!("{}.{}", schema.name, field.name),
                    format!("constraints cannot be satisfied ({}, sample {})", reason, sample),
                ));
            }
        }
    }
    Ok(())
}
