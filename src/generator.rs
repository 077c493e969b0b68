//! Fake data generation.
//!
//! Produces schema-conformant values for fields a client did not supply and
//! for records seeded at startup. With a base seed every value is a pure
//! function of (seed, schema, field, salt); without one, values are random.

use crate::config::FieldKind;
use crate::schema::{FieldSchema, Format, ResourceSchema, MAX_DEPTH};
use crate::validator::check_field;
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Attempts per value before the last candidate is returned as-is.
const MAX_ATTEMPTS: usize = 16;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Grace", "Linus", "Margaret", "Dennis", "Barbara", "Ken", "Frances", "Edsger",
    "Radia", "Donald", "Hedy", "John", "Katherine", "Tim", "Sophie", "Bjarne", "Anita", "Niklaus",
];
const LAST_NAMES: &[&str] = &[
    "Lovelace", "Turing", "Hopper", "Torvalds", "Hamilton", "Ritchie", "Liskov", "Thompson",
    "Allen", "Dijkstra", "Perlman", "Knuth", "Lamarr", "McCarthy", "Johnson", "Berners-Lee",
    "Wilson", "Stroustrup", "Borg", "Wirth",
];
const CITIES: &[&str] = &[
    "Lisbon", "Portland", "Kyoto", "Oslo", "Austin", "Melbourne", "Toronto", "Berlin", "Nairobi",
    "Montevideo", "Seoul", "Dublin",
];
const STATES: &[&str] = &[
    "California", "Oregon", "Texas", "Ontario", "Bavaria", "Victoria", "Quebec", "Hokkaido",
];
const COUNTRIES: &[&str] = &[
    "Portugal", "Japan", "Norway", "Canada", "Germany", "Australia", "Kenya", "Uruguay", "Ireland",
];
const STREETS: &[&str] = &["Main", "Oak", "Maple", "Harbor", "Mill", "Station", "Park", "Elm"];
const STREET_SUFFIXES: &[&str] = &["Street", "Avenue", "Road", "Lane", "Way"];
const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "labore", "dolore", "magna", "aliqua", "enim", "minim",
    "veniam", "quis", "nostrud", "ullamco", "laboris",
];
const COMPANY_WORDS: &[&str] = &[
    "Acme", "Globex", "Initech", "Umbrella", "Hooli", "Vandelay", "Stark", "Wayne", "Tyrell",
];
const COMPANY_SUFFIXES: &[&str] = &["Inc", "LLC", "Group", "Labs", "Systems"];
const JOB_TITLES: &[&str] = &[
    "Engineer", "Designer", "Product Manager", "Analyst", "Architect", "Consultant", "Director",
];
const INDUSTRIES: &[&str] = &["Retail", "Finance", "Logistics", "Healthcare", "Energy", "Media"];
const COLORS: &[&str] = &["red", "green", "blue", "teal", "orange", "purple", "black", "white"];
const CURRENCIES: &[&str] = &["USD", "EUR", "GBP", "JPY", "CAD", "AUD", "CHF"];
const LANGUAGES: &[&str] = &["English", "Portuguese", "Japanese", "German", "Spanish", "French"];
const STATUSES: &[&str] = &["active", "inactive", "pending", "completed", "archived"];
const TLDS: &[&str] = &["com", "io", "net", "org", "dev"];

/// Per-call inputs beyond the schema.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    /// Mixed into the per-value seed so repeated calls differ.
    pub salt: u64,
    /// Existing identifiers per schema name, used for reference fields.
    pub references: HashMap<String, Vec<Value>>,
}

impl GenerationContext {
    pub fn with_salt(salt: u64) -> Self {
        Self {
            salt,
            references: HashMap::new(),
        }
    }
}

/// Schema-driven fake data generator.
#[derive(Debug, Clone, Default)]
pub struct FakeDataGenerator {
    seed: Option<u64>,
}

impl FakeDataGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Generate a value for one field of a schema.
    ///
    /// Returns `None` for unknown fields and for reference fields when the
    /// context holds no candidate identifiers.
    pub fn generate(
        &self,
        schema: &ResourceSchema,
        field: &str,
        ctx: &GenerationContext,
    ) -> Option<Value> {
        let field = schema.field(field)?;
        let mut rng = self.rng_for(&schema.name, &field.name, ctx.salt);

        if let Some(target) = &field.schema.references {
            return ctx.references.get(target)?.choose(&mut rng).cloned();
        }

        let mut last = Value::Null;
        for _ in 0..MAX_ATTEMPTS {
            let candidate = value(&mut rng, &field.name, &field.schema, 0);
            match check_field(&field.name, &field.schema, &candidate, false) {
                Ok(normalized) => return Some(normalized),
                Err(_) => last = candidate,
            }
        }
        Some(last)
    }

    /// Generate every field of a record.
    pub fn generate_record(
        &self,
        schema: &ResourceSchema,
        ctx: &GenerationContext,
    ) -> Map<String, Value> {
        schema
            .fields
            .iter()
            .filter_map(|field| {
                self.generate(schema, &field.name, ctx)
                    .map(|value| (field.name.clone(), value))
            })
            .collect()
    }

    /// A v4-style UUID, reproducible when a seed is set.
    pub fn uuid(&self, scope: &str, salt: u64) -> String {
        uuid(&mut self.rng_for(scope, "$id", salt))
    }

    fn rng_for(&self, schema: &str, field: &str, salt: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(derive_seed(seed, schema, field, salt)),
            None => StdRng::from_entropy(),
        }
    }
}

fn derive_seed(seed: u64, schema: &str, field: &str, salt: u64) -> u64 {
    let mut h = seed;
    for c in schema.bytes().chain(std::iter::once(b'.')).chain(field.bytes()) {
        h = h.wrapping_mul(31).wrapping_add(c as u64);
    }
    h ^ salt.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

fn value(rng: &mut StdRng, name: &str, schema: &FieldSchema, depth: usize) -> Value {
    if let Some(choice) = schema.constraints.enum_values.choose(rng) {
        return choice.clone();
    }
    if let Some(example) = &schema.example {
        return example.clone();
    }

    match schema.kind {
        FieldKind::String => Value::String(string(rng, name, schema)),
        FieldKind::Integer => Value::from(integer(rng, name, schema)),
        FieldKind::Number => Value::from(number(rng, name, schema)),
        FieldKind::Boolean => Value::Bool(rng.gen_bool(0.5)),
        FieldKind::Array => {
            let c = &schema.constraints;
            let min = c.min_items.unwrap_or(1.min(c.max_items.unwrap_or(1)));
            let max = c.max_items.unwrap_or(min.max(3)).max(min);
            let count = rng.gen_range(min..=max);
            let item_name = name.strip_suffix('s').unwrap_or(name);
            let items = (0..count)
                .map(|_| match &schema.items {
                    Some(items) if depth < MAX_DEPTH => value(rng, item_name, items, depth + 1),
                    _ => Value::String(word(rng).to_string()),
                })
                .collect();
            Value::Array(items)
        }
        FieldKind::Object => {
            let mut object = Map::new();
            if depth < MAX_DEPTH {
                for property in &schema.properties {
                    object.insert(
                        property.name.clone(),
                        value(rng, &property.name, &property.schema, depth + 1),
                    );
                }
            }
            Value::Object(object)
        }
    }
}

fn string(rng: &mut StdRng, name: &str, schema: &FieldSchema) -> String {
    if let Some(pattern) = &schema.constraints.pattern {
        return pattern.generator().generate(rng);
    }
    if let Some(format) = schema.format {
        return formatted(rng, format);
    }
    let hint = schema.hint.as_deref().unwrap_or(name);
    let s = by_name(rng, hint).unwrap_or_else(|| sentence(rng, 3, 8));
    fit_length(rng, s, schema.constraints.min_length, schema.constraints.max_length)
}

fn integer(rng: &mut StdRng, name: &str, schema: &FieldSchema) -> i64 {
    let (mut lo, mut hi) = match name.to_lowercase().as_str() {
        "age" => (18, 90),
        "quantity" | "qty" | "count" | "stock" => (0, 100),
        "rating" | "stars" => (1, 5),
        "year" => (1990, 2030),
        "port" => (1024, 65535),
        _ => (1, 1000),
    };
    if let Some(min) = schema.constraints.minimum {
        lo = min.ceil() as i64;
        if hi < lo {
            hi = lo.saturating_add(1000);
        }
    }
    if let Some(max) = schema.constraints.maximum {
        hi = max.floor() as i64;
        if lo > hi {
            lo = hi.saturating_sub(1000);
        }
    }
    rng.gen_range(lo..=hi)
}

fn number(rng: &mut StdRng, name: &str, schema: &FieldSchema) -> f64 {
    let (mut lo, mut hi) = match name.to_lowercase().as_str() {
        "price" | "amount" | "cost" | "total" | "balance" => (1.0, 500.0),
        "latitude" | "lat" => (-90.0, 90.0),
        "longitude" | "lng" | "lon" => (-180.0, 180.0),
        "rating" | "score" => (0.0, 5.0),
        _ => (0.0, 1000.0),
    };
    if let Some(min) = schema.constraints.minimum {
        lo = min;
        if hi < lo {
            hi = lo + 1000.0;
        }
    }
    if let Some(max) = schema.constraints.maximum {
        hi = max;
        if lo > hi {
            lo = hi - 1000.0;
        }
    }
    let raw = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
    let rounded = (raw * 100.0).round() / 100.0;
    rounded.clamp(lo, hi)
}

fn formatted(rng: &mut StdRng, format: Format) -> String {
    match format {
        Format::Email => email(rng),
        Format::Uuid => uuid(rng),
        Format::Date => date(rng).format("%Y-%m-%d").to_string(),
        Format::DateTime => {
            let seconds = rng.gen_range(0..86_400);
            let at = date(rng).and_hms_opt(0, 0, 0).unwrap_or_default() + Duration::seconds(seconds);
            at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
        }
        Format::Uri => url(rng),
        Format::Ipv4 => ipv4(rng),
        Format::Ipv6 => (0..8)
            .map(|_| format!("{:x}", rng.gen::<u16>()))
            .collect::<Vec<_>>()
            .join(":"),
        Format::Hostname => hostname(rng),
        Format::Password => {
            const CHARSET: &[u8] =
                b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%&*";
            (0..12)
                .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
                .collect()
        }
        Format::Phone => phone(rng),
    }
}

/// Plausible values for semantically named fields.
fn by_name(rng: &mut StdRng, name: &str) -> Option<String> {
    let name = name.to_lowercase();
    let value = match name.as_str() {
        "name" | "full_name" | "fullname" => format!("{} {}", pick(rng, FIRST_NAMES), pick(rng, LAST_NAMES)),
        "first_name" | "firstname" | "given_name" => pick(rng, FIRST_NAMES).to_string(),
        "last_name" | "lastname" | "surname" | "family_name" => pick(rng, LAST_NAMES).to_string(),
        "username" | "user_name" | "handle" | "login" => format!(
            "{}{}",
            pick(rng, FIRST_NAMES).to_lowercase(),
            rng.gen_range(1..1000)
        ),
        "email" | "email_address" => email(rng),
        n if n.ends_with("_email") => email(rng),
        "phone" | "phone_number" | "mobile" | "tel" => phone(rng),
        "address" | "street" | "street_address" => format!(
            "{} {} {}",
            rng.gen_range(1..9999),
            pick(rng, STREETS),
            pick(rng, STREET_SUFFIXES)
        ),
        "city" => pick(rng, CITIES).to_string(),
        "state" | "province" | "region" => pick(rng, STATES).to_string(),
        "country" => pick(rng, COUNTRIES).to_string(),
        "zip" | "zip_code" | "zipcode" | "postal_code" => format!("{:05}", rng.gen_range(0..100_000)),
        "latitude" | "lat" => format!("{:.6}", rng.gen_range(-90.0..=90.0)),
        "longitude" | "lng" | "lon" => format!("{:.6}", rng.gen_range(-180.0..=180.0)),
        "title" | "subject" | "headline" => capitalize(&sentence(rng, 3, 6)),
        "description" | "summary" | "bio" | "about" => capitalize(&sentence(rng, 8, 15)) + ".",
        "body" | "content" | "text" | "message" => capitalize(&sentence(rng, 15, 30)) + ".",
        "comment" | "note" | "notes" => capitalize(&sentence(rng, 5, 10)) + ".",
        "url" | "website" | "link" | "homepage" => url(rng),
        "image" | "avatar" | "photo" | "picture" | "image_url" | "avatar_url" => format!(
            "https://picsum.photos/seed/{}/640/480",
            rng.gen_range(0..10_000)
        ),
        "domain" | "hostname" => hostname(rng),
        "ip" | "ip_address" => ipv4(rng),
        "slug" => format!("{}-{}", word(rng), word(rng)),
        "sku" | "code" | "product_code" => {
            let letters: String = (0..3).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
            format!("{}-{:04}", letters, rng.gen_range(0..10_000))
        }
        "color" | "colour" => pick(rng, COLORS).to_string(),
        "company" | "company_name" | "organization" | "org" => {
            format!("{} {}", pick(rng, COMPANY_WORDS), pick(rng, COMPANY_SUFFIXES))
        }
        "job" | "job_title" | "role" | "position" => pick(rng, JOB_TITLES).to_string(),
        "industry" | "sector" => pick(rng, INDUSTRIES).to_string(),
        "currency" | "currency_code" => pick(rng, CURRENCIES).to_string(),
        "language" | "lang" | "locale" => pick(rng, LANGUAGES).to_string(),
        "status" => pick(rng, STATUSES).to_string(),
        "type" | "kind" | "category" | "tag" | "label" => word(rng).to_string(),
        _ => return None,
    };
    Some(value)
}

fn pick<'a>(rng: &mut StdRng, list: &[&'a str]) -> &'a str {
    list.choose(rng).copied().unwrap_or("")
}

fn word(rng: &mut StdRng) -> &'static str {
    pick(rng, WORDS)
}

fn sentence(rng: &mut StdRng, min_words: usize, max_words: usize) -> String {
    let count = rng.gen_range(min_words..=max_words);
    (0..count).map(|_| word(rng)).collect::<Vec<_>>().join(" ")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn email(rng: &mut StdRng) -> String {
    format!(
        "{}.{}{}@example.{}",
        pick(rng, FIRST_NAMES).to_lowercase(),
        pick(rng, LAST_NAMES).to_lowercase().replace('-', ""),
        rng.gen_range(1..100),
        pick(rng, TLDS)
    )
}

fn phone(rng: &mut StdRng) -> String {
    format!(
        "+1-555-{:03}-{:04}",
        rng.gen_range(0..1000),
        rng.gen_range(0..10_000)
    )
}

fn hostname(rng: &mut StdRng) -> String {
    format!("{}.{}", word(rng), pick(rng, TLDS))
}

fn url(rng: &mut StdRng) -> String {
    format!("https://www.{}/{}", hostname(rng), word(rng))
}

fn ipv4(rng: &mut StdRng) -> String {
    format!(
        "{}.{}.{}.{}",
        rng.gen_range(1..=223),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen_range(1..=254)
    )
}

fn date(rng: &mut StdRng) -> NaiveDate {
    let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default();
    start + Duration::days(rng.gen_range(0..3650))
}

/// A random v4-style UUID drawn from `rng`.
pub fn uuid<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffff_ffff_ffff,
    )
}

/// Pad with letters or truncate so the string fits the length bounds.
fn fit_length(rng: &mut StdRng, mut s: String, min: Option<usize>, max: Option<usize>) -> String {
    if let Some(max) = max {
        if s.chars().count() > max {
            s = s.chars().take(max).collect::<String>().trim_end().to_string();
        }
    }
    if let Some(min) = min {
        while s.chars().count() < min {
            s.push(rng.gen_range(b'a'..=b'z') as char);
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaDefinition;
    use crate::validator::{ValidationOptions, Validator};

    fn schema(yaml: &str) -> ResourceSchema {
        let def: SchemaDefinition = serde_yaml::from_str(yaml).unwrap();
        ResourceSchema::compile(&def).unwrap()
    }

    fn user() -> ResourceSchema {
        schema(
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
    minimum: 21
    maximum: 30
  price: number
  role:
    type: string
    enum: [admin, member]
  sku:
    type: string
    pattern: '^[A-Z]{2}\d{3}$'
  nickname:
    type: string
    min_length: 40
    max_length: 45
  tags:
    type: array
    min_items: 2
    max_items: 4
    items: string
  address:
    type: object
    properties:
      city: string
      zip: string
"#,
        )
    }

    #[test]
    fn test_generated_record_validates() {
        let schema = user();
        let generator = FakeDataGenerator::new(Some(42));
        for salt in 0..20 {
            let record = generator.generate_record(&schema, &GenerationContext::with_salt(salt));
            let verdict = Validator::new().validate(
                &schema,
                &Value::Object(record.clone()),
                ValidationOptions {
                    strict: true,
                    partial: false,
                },
            );
            assert!(verdict.is_valid(), "{:?} -> {:?}", record, verdict);
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let schema = user();
        let ctx = GenerationContext::with_salt(3);
        let a = FakeDataGenerator::new(Some(7)).generate_record(&schema, &ctx);
        let b = FakeDataGenerator::new(Some(7)).generate_record(&schema, &ctx);
        assert_eq!(a, b);

        let other_salt = FakeDataGenerator::new(Some(7))
            .generate_record(&schema, &GenerationContext::with_salt(4));
        assert_ne!(a, other_salt);
    }

    #[test]
    fn test_semantic_names() {
        let schema = user();
        let generator = FakeDataGenerator::new(Some(1));
        let name = generator
            .generate(&schema, "name", &GenerationContext::default())
            .unwrap();
        let name = name.as_str().unwrap();
        assert!(name.contains(' '), "{}", name);
        assert!(FIRST_NAMES.iter().any(|first| name.starts_with(first)));

        let zip = generator
            .generate(&schema, "address", &GenerationContext::default())
            .unwrap();
        assert_eq!(zip["zip"].as_str().unwrap().len(), 5);
    }

    #[test]
    fn test_example_wins() {
        let schema = schema(
            r#"
name: Flag
fields:
  label:
    type: string
    example: fixed
"#,
        );
        let value = FakeDataGenerator::new(None)
            .generate(&schema, "label", &GenerationContext::default())
            .unwrap();
        assert_eq!(value, "fixed");
    }

    #[test]
    fn test_reference_fields_use_candidates() {
        let schema = schema(
            r#"
name: Post
fields:
  author_id:
    type: string
    references: User
"#,
        );
        let generator = FakeDataGenerator::new(Some(5));
        assert!(generator
            .generate(&schema, "author_id", &GenerationContext::default())
            .is_none());

        let mut ctx = GenerationContext::default();
        ctx.references
            .insert("User".to_string(), vec![Value::from("u-1"), Value::from("u-2")]);
        let chosen = generator.generate(&schema, "author_id", &ctx).unwrap();
        assert!(chosen == "u-1" || chosen == "u-2");
    }

    #[test]
    fn test_unknown_field_is_none() {
        let generator = FakeDataGenerator::new(None);
        assert!(generator
            .generate(&user(), "missing", &GenerationContext::default())
            .is_none());
    }

    #[test]
    fn test_uuid_shape_and_seeding() {
        let generator = FakeDataGenerator::new(Some(9));
        let id = generator.uuid("User", 1);
        assert_eq!(id.len(), 36);
        assert_eq!(&id[14..15], "4");
        assert_eq!(id, FakeDataGenerator::new(Some(9)).uuid("User", 1));
        assert_ne!(id, generator.uuid("User", 2));
    }
}
