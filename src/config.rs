//! Declarative input for the engine.
//!
//! Defines resource schemas, routes, chaos rules, proxy and replay settings.
//! This module only parses and sanity-checks the document; the engine
//! compiles it into registries and fails fast with
//! [`SchemaError`](crate::error::SchemaError) when it is inconsistent.

use crate::auth::AuthRequirement;
use crate::replay::{MatchMode, ReplayFallback};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Main configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Resource schemas
    #[serde(default)]
    pub schemas: Vec<SchemaDefinition>,

    /// Explicit routes, registered after the collection routes of each schema
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    /// Fault injection
    #[serde(default)]
    pub chaos: ChaosConfig,

    /// Upstream forwarding
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// Recorded interaction playback
    #[serde(default)]
    pub replay: Option<ReplayConfig>,

    /// Response for unmatched requests (instead of a 404)
    #[serde(default)]
    pub default_response: Option<ResponseDefinition>,
}

impl MockConfig {
    /// Load configuration from a YAML or JSON file (chosen by extension).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, schema) in self.schemas.iter().enumerate() {
            schema
                .validate()
                .map_err(|e| anyhow::anyhow!("Schema {}: {}", i, e))?;
        }
        for (i, route) in self.routes.iter().enumerate() {
            route
                .validate()
                .map_err(|e| anyhow::anyhow!("Route {}: {}", i, e))?;
        }
        for (i, rule) in self.chaos.rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("Chaos rule {}: {}", i, e))?;
        }
        if let Some(default) = &self.default_response {
            default.validate()?;
        }
        if let Some(proxy) = &self.proxy {
            if proxy.target.is_empty() {
                anyhow::bail!("Proxy target cannot be empty");
            }
        }
        Ok(())
    }
}

/// A resource schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDefinition {
    /// Schema name, e.g. `User`
    pub name: String,

    /// Collection base path; registers the CRUD routes when set
    #[serde(default)]
    pub path: Option<String>,

    /// Identifier strategy
    #[serde(default)]
    pub id: IdStrategy,

    /// Name of the identifier field in response bodies
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Reject unknown fields and invalid bodies for this schema
    #[serde(default)]
    pub strict: Option<bool>,

    /// Auth requirement for the generated collection routes
    #[serde(default)]
    pub auth: Option<AuthRequirement>,

    /// Number of generated records present at startup
    #[serde(default)]
    pub initial_records: usize,

    /// Field definitions
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl SchemaDefinition {
    /// Validate the schema definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Schema name cannot be empty");
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                anyhow::bail!("Collection path must start with '/': {}", path);
            }
        }
        Ok(())
    }
}

/// How record identifiers are assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Random v4-style UUIDs (deterministic when a seed is set)
    #[default]
    Uuid,
    /// Monotonic integers starting at 1
    Sequence,
}

/// Field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }
}

/// A field written either as a bare type (`name: string`) or in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    Kind(FieldKind),
    Full(Box<FieldDefinition>),
}

impl FieldSpec {
    pub fn to_definition(&self) -> FieldDefinition {
        match self {
            FieldSpec::Kind(kind) => FieldDefinition::of(*kind),
            FieldSpec::Full(def) => (**def).clone(),
        }
    }
}

/// Full field definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub kind: FieldKind,

    #[serde(default)]
    pub required: bool,

    /// String format (email, uuid, date, date-time, uri, ipv4, ...)
    #[serde(default)]
    pub format: Option<String>,

    /// Semantic generator hint (name, email, city, ...)
    #[serde(default)]
    pub generator: Option<String>,

    /// Value returned by the generator instead of a synthetic one
    #[serde(default)]
    pub example: Option<serde_json::Value>,

    /// Name of the schema whose identifiers this field holds
    #[serde(default)]
    pub references: Option<String>,

    #[serde(default)]
    pub minimum: Option<f64>,

    #[serde(default)]
    pub maximum: Option<f64>,

    #[serde(default)]
    pub min_length: Option<usize>,

    #[serde(default)]
    pub max_length: Option<usize>,

    #[serde(default)]
    pub min_items: Option<usize>,

    #[serde(default)]
    pub max_items: Option<usize>,

    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<serde_json::Value>>,

    /// Element definition for arrays
    #[serde(default)]
    pub items: Option<FieldSpec>,

    /// Property definitions for objects
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSpec>,
}

impl FieldDefinition {
    /// An unconstrained optional field of the given kind.
    pub fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            format: None,
            generator: None,
            example: None,
            references: None,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            min_items: None,
            max_items: None,
            pattern: None,
            enum_values: None,
            items: None,
            properties: BTreeMap::new(),
        }
    }
}

/// Route operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    Get,
    Create,
    Update,
    Delete,
    Custom,
}

impl Operation {
    /// Whether the operation carries a body that goes through validation.
    pub fn is_write(&self) -> bool {
        matches!(self, Operation::Create | Operation::Update)
    }

    /// Whether the last path parameter addresses a single record.
    pub fn targets_record(&self) -> bool {
        matches!(self, Operation::Get | Operation::Update | Operation::Delete)
    }
}

/// Validation mode override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Invalid bodies and unknown fields are rejected
    Strict,
    /// Violations are logged and the request proceeds
    Lenient,
}

/// A single route definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDefinition {
    /// Optional name used in logs
    #[serde(default)]
    pub name: Option<String>,

    /// HTTP method
    pub method: String,

    /// Path pattern, e.g. `/users/:id` or `/users/{id}`
    pub path: String,

    /// Bound resource schema
    #[serde(default)]
    pub resource: Option<String>,

    /// Operation kind
    pub operation: Operation,

    #[serde(default)]
    pub validation: Option<ValidationMode>,

    #[serde(default)]
    pub auth: Option<AuthRequirement>,

    /// Answer from the replay corpus first
    #[serde(default)]
    pub replay: bool,

    /// Always forward to the upstream
    #[serde(default)]
    pub proxy: bool,

    /// Responses selected with `Prefer: code=NNN`
    #[serde(default)]
    pub variants: BTreeMap<u16, ResponseDefinition>,

    /// Response for custom operations
    #[serde(default)]
    pub response: Option<ResponseDefinition>,
}

impl RouteDefinition {
    /// Validate the route definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.path.starts_with('/') {
            anyhow::bail!("Route path must start with '/': {}", self.path);
        }
        if self.method.is_empty() {
            anyhow::bail!("Route method cannot be empty");
        }
        for (code, variant) in &self.variants {
            if !(100..=599).contains(code) {
                anyhow::bail!("Invalid variant status code: {}", code);
            }
            variant.validate()?;
        }
        if let Some(response) = &self.response {
            response.validate()?;
        }
        Ok(())
    }
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Whether the body is a Handlebars template
    #[serde(default)]
    pub template: bool,
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        Ok(())
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_string(content)?.into_bytes()),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ResponseBody::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } => "application/octet-stream",
            ResponseBody::File { .. } => "application/octet-stream",
        }
    }
}

/// Delay/latency configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayConfig {
    /// Fixed delay in milliseconds
    #[serde(default)]
    pub fixed_ms: u64,

    /// Minimum delay for random range (ms)
    #[serde(default)]
    pub min_ms: u64,

    /// Maximum delay for random range (ms)
    #[serde(default)]
    pub max_ms: u64,
}

impl DelayConfig {
    /// Calculate the actual delay to apply.
    pub fn calculate(&self) -> u64 {
        self.sample(&mut rand::thread_rng())
    }

    /// Calculate the delay using the supplied random source.
    pub fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        if self.fixed_ms > 0 {
            return self.fixed_ms;
        }
        if self.max_ms > self.min_ms {
            return rng.gen_range(self.min_ms..=self.max_ms);
        }
        self.min_ms
    }
}

/// Chaos configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChaosConfig {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,

    /// Add the built-in rules (10% 500s, 20% latency spikes)
    #[serde(default)]
    pub preset: bool,

    /// Seed for chaos decisions (falls back to `settings.seed`)
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub rules: Vec<ChaosRuleDefinition>,
}

/// A chaos rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChaosRuleDefinition {
    pub id: String,

    /// Glob matched against the request path and the route pattern
    #[serde(default = "default_chaos_path")]
    pub path: String,

    /// Methods the rule applies to (empty = any)
    #[serde(default)]
    pub methods: Vec<String>,

    /// Probability (0.0 - 1.0) that the rule fires
    #[serde(default = "default_probability")]
    pub probability: f64,

    pub effect: ChaosEffectDefinition,
}

fn default_chaos_path() -> String {
    "**".to_string()
}

fn default_probability() -> f64 {
    1.0
}

impl ChaosRuleDefinition {
    /// Validate the rule.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Chaos rule id cannot be empty");
        }
        if !(0.0..=1.0).contains(&self.probability) {
            anyhow::bail!("Probability must be within 0.0 - 1.0: {}", self.probability);
        }
        globset::Glob::new(&self.path).map_err(|e| anyhow::anyhow!("Invalid glob: {}", e))?;
        if let ChaosEffectDefinition::Fail { status, .. } = &self.effect {
            if !(100..=599).contains(status) {
                anyhow::bail!("Invalid status code: {}", status);
            }
        }
        Ok(())
    }
}

/// What a chaos rule does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChaosEffectDefinition {
    /// Hold the response
    Delay(DelayConfig),
    /// Replace the response with an error
    Fail {
        status: u16,
        #[serde(default)]
        message: Option<String>,
    },
    /// Mangle the response body
    Corrupt {
        #[serde(default)]
        mode: CorruptionMode,
    },
}

/// Body corruption modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionMode {
    /// Cut the body in half
    #[default]
    Truncate,
    /// Replace the body with random printable bytes
    Garbage,
    /// Drop the body entirely
    Empty,
    /// Unbalanced JSON
    MalformedJson,
}

/// Upstream forwarding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Base URL of the real API
    pub target: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Forward unmatched requests instead of answering 404
    #[serde(default)]
    pub fallback: bool,

    /// File that proxied exchanges are written to on shutdown
    #[serde(default)]
    pub record: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// Replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    /// Recording file (JSON)
    pub recordings: PathBuf,

    /// Query comparison
    #[serde(default)]
    pub query: MatchMode,

    /// Body comparison
    #[serde(default = "default_body_mode")]
    pub body: MatchMode,

    /// What happens when no recording matches
    #[serde(default)]
    pub fallback: ReplayFallback,

    /// Arm replay for every route (and unmatched requests)
    #[serde(default)]
    pub all_routes: bool,
}

fn default_body_mode() -> MatchMode {
    MatchMode::Ignored
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log all matched routes
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Reject invalid bodies and unknown fields
    #[serde(default)]
    pub strict: bool,

    /// Skip auth simulation
    #[serde(default)]
    pub no_auth: bool,

    /// Auth requirement for routes that do not declare one
    #[serde(default)]
    pub auth: Option<AuthRequirement>,

    /// Seed for reproducible data (random when absent)
    #[serde(default)]
    pub seed: Option<u64>,

    /// Latency added to every request
    #[serde(default)]
    pub latency: Option<DelayConfig>,

    /// Answer CORS preflights and add CORS headers
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Default content type for bodiless custom responses
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Capacity of the resource event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_true() -> bool {
    true
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            strict: false,
            no_auth: false,
            auth: None,
            seed: None,
            latency: None,
            cors: true,
            default_content_type: default_content_type(),
            max_body_bytes: default_max_body_bytes(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_schema_with_shorthand_fields() {
        let yaml = r#"
schemas:
  - name: User
    path: /users
    fields:
      name: string
      email:
        type: string
        format: email
        required: true
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.schemas.len(), 1);
        let schema = &config.schemas[0];
        assert_eq!(schema.id, IdStrategy::Uuid);
        assert_eq!(schema.id_field, "id");

        let name = schema.fields["name"].to_definition();
        assert_eq!(name.kind, FieldKind::String);
        assert!(!name.required);

        let email = schema.fields["email"].to_definition();
        assert!(email.required);
        assert_eq!(email.format.as_deref(), Some("email"));
    }

    #[test]
    fn test_parse_nested_fields() {
        let yaml = r#"
schemas:
  - name: Order
    id: sequence
    fields:
      lines:
        type: array
        min_items: 1
        items:
          type: object
          properties:
            sku: string
            quantity:
              type: integer
              minimum: 1
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        let lines = config.schemas[0].fields["lines"].to_definition();
        assert_eq!(lines.kind, FieldKind::Array);
        let items = lines.items.unwrap().to_definition();
        assert_eq!(items.properties.len(), 2);
        assert_eq!(config.schemas[0].id, IdStrategy::Sequence);
    }

    #[test]
    fn test_parse_route_with_variants() {
        let yaml = r#"
routes:
  - method: GET
    path: /health
    operation: custom
    response:
      status: 200
      body:
        type: json
        content:
          status: ok
    variants:
      503:
        body:
          type: json
          content:
            status: down
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        let route = &config.routes[0];
        assert_eq!(route.operation, Operation::Custom);
        assert!(route.variants.contains_key(&503));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_chaos_rules() {
        let yaml = r#"
chaos:
  enabled: true
  rules:
    - id: slow
      path: /users/**
      probability: 0.5
      effect:
        type: delay
        min_ms: 10
        max_ms: 20
    - id: broken
      methods: [POST]
      effect:
        type: fail
        status: 503
    - id: mangled
      effect:
        type: corrupt
        mode: malformed_json
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.chaos.rules.len(), 3);
        assert_eq!(config.chaos.rules[1].probability, 1.0);
        assert_eq!(config.chaos.rules[1].path, "**");
        match &config.chaos.rules[2].effect {
            ChaosEffectDefinition::Corrupt { mode } => {
                assert_eq!(*mode, CorruptionMode::MalformedJson)
            }
            other => panic!("Expected corrupt effect, got {:?}", other),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let yaml = r#"
chaos:
  rules:
    - id: bad
      probability: 1.5
      effect:
        type: fail
        status: 500
"#;
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r#"
settings:
  strictness: high
"#;
        assert!(serde_yaml::from_str::<MockConfig>(yaml).is_err());
    }

    #[test]
    fn test_delay_calculation() {
        let fixed = DelayConfig {
            fixed_ms: 100,
            min_ms: 0,
            max_ms: 0,
        };
        assert_eq!(fixed.calculate(), 100);

        let range = DelayConfig {
            fixed_ms: 0,
            min_ms: 50,
            max_ms: 150,
        };
        let delay = range.calculate();
        assert!((50..=150).contains(&delay));
    }

    #[test]
    fn test_response_body_to_bytes() {
        let text = ResponseBody::Text {
            content: "hello".to_string(),
        };
        assert_eq!(text.to_bytes().unwrap(), b"hello");

        let json = ResponseBody::Json {
            content: serde_json::json!({"key": "value"}),
        };
        let bytes = json.to_bytes().unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("key"));
    }

    #[test]
    fn test_from_file_json_and_yaml() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(yaml, "settings:\n  seed: 7\n  strict: true").unwrap();
        let config = MockConfig::from_file(yaml.path()).unwrap();
        assert_eq!(config.settings.seed, Some(7));
        assert!(config.settings.strict);

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{"settings": {{"no_auth": true}}}}"#).unwrap();
        let config = MockConfig::from_file(json.path()).unwrap();
        assert!(config.settings.no_auth);
        assert!(config.settings.cors);
    }

    #[test]
    fn test_demo_config_parses() {
        let config: MockConfig =
            serde_yaml::from_str(include_str!("../demos/portblock.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.schemas.is_empty());
    }
}
