//! In-memory resource store.
//!
//! One [`Collection`] per schema, each behind its own `parking_lot::RwLock`.
//! The set of collections is fixed at construction, so unrelated schemas
//! never contend. Reference checks read target collections before the
//! writer's own lock is taken; two collection locks are never held at once.

use crate::config::{FieldKind, IdStrategy};
use crate::error::StoreError;
use crate::events::{ChangeKind, EventSink, ResourceEvent};
use crate::generator::{FakeDataGenerator, GenerationContext};
use crate::schema::{ResourceSchema, SchemaSet};
use crate::validator::values_equal;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    /// 1 on create, +1 on every update.
    pub revision: u64,
    /// Field values, excluding the identifier.
    pub fields: Map<String, Value>,
}

impl Record {
    /// The record as returned to clients, identifier included.
    pub fn to_json(&self, schema: &ResourceSchema) -> Value {
        let mut object = self.fields.clone();
        object.insert(schema.id_field.clone(), id_value(schema, &self.id));
        Value::Object(object)
    }

    /// Strong entity tag carrying the revision.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.revision)
    }

    /// A field value, treating the identifier field as a field.
    fn value<'a>(&'a self, schema: &ResourceSchema, field: &str) -> Option<std::borrow::Cow<'a, Value>> {
        if field == schema.id_field {
            Some(std::borrow::Cow::Owned(id_value(schema, &self.id)))
        } else {
            self.fields.get(field).map(std::borrow::Cow::Borrowed)
        }
    }
}

/// JSON form of an identifier: numbers for sequence ids, strings otherwise.
pub fn id_value(schema: &ResourceSchema, id: &str) -> Value {
    match schema.id_strategy {
        IdStrategy::Sequence => id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(id)),
        IdStrategy::Uuid => Value::from(id),
    }
}

/// Identifier string of a JSON value used as a reference.
fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse an `If-Match` value into an expected revision.
///
/// `*` and unparsable tags mean "no precondition".
pub fn parse_if_match(header: &str) -> Option<u64> {
    let tag = header.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.trim_matches('"').parse().ok()
}

#[derive(Debug)]
struct Collection {
    /// id -> insertion sequence
    index: HashMap<String, u64>,
    /// insertion sequence -> record
    order: BTreeMap<u64, Arc<Record>>,
    next_seq: u64,
    next_id: u64,
}

impl Collection {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            next_id: 1,
        }
    }

    fn get(&self, id: &str) -> Option<(u64, &Arc<Record>)> {
        let seq = *self.index.get(id)?;
        self.order.get(&seq).map(|record| (seq, record))
    }
}

/// Comparison applied by a list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Gt,
    Lte,
    Lt,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Value(Value),
    Number(f64),
    Instant(DateTime<Utc>),
    Text(String),
}

/// One list filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    operand: Operand,
}

impl Filter {
    /// Equality on a field value.
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            operand: Operand::Value(value),
        }
    }

    fn accepts(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match (&self.operand, self.op) {
            (Operand::Value(expected), _) => match value {
                Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
                other => values_equal(other, expected),
            },
            (Operand::Text(needle), _) => value
                .as_str()
                .is_some_and(|s| s.to_lowercase().contains(needle)),
            (Operand::Number(bound), op) => value
                .as_f64()
                .and_then(|n| n.partial_cmp(bound))
                .is_some_and(|ord| range_accepts(op, ord)),
            (Operand::Instant(bound), op) => value
                .as_str()
                .and_then(parse_instant)
                .is_some_and(|at| range_accepts(op, at.cmp(bound))),
        }
    }
}

fn range_accepts(op: FilterOp, ord: CmpOrdering) -> bool {
    match op {
        FilterOp::Gte => ord != CmpOrdering::Less,
        FilterOp::Gt => ord == CmpOrdering::Greater,
        FilterOp::Lte => ord != CmpOrdering::Greater,
        FilterOp::Lt => ord == CmpOrdering::Less,
        FilterOp::Eq | FilterOp::Like => ord == CmpOrdering::Equal,
    }
}

/// RFC 3339 timestamps, or plain dates at midnight UTC.
fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|at| at.and_utc())
}

/// Sort order for a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Filtering, sorting and pagination for [`ResourceStore::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub filters: Vec<Filter>,
    pub sort: Option<SortKey>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ListQuery {
    /// Parse query parameters against a schema.
    ///
    /// Keys that name neither a field nor a paging/sorting control are
    /// ignored; values that cannot be interpreted are an error.
    pub fn parse(schema: &ResourceSchema, pairs: &[(String, String)]) -> Result<Self, StoreError> {
        let mut query = ListQuery::default();
        for (key, raw) in pairs {
            match key.as_str() {
                "offset" => query.offset = parse_count(key, raw)?,
                "limit" => query.limit = Some(parse_count(key, raw)?),
                "sort" => {
                    let (field, descending) = match raw.strip_prefix('-') {
                        Some(field) => (field, true),
                        None => (raw.strip_prefix('+').unwrap_or(raw), false),
                    };
                    if field != schema.id_field && schema.field(field).is_none() {
                        return Err(invalid(key, format!("unknown sort field '{}'", field)));
                    }
                    query.sort = Some(SortKey {
                        field: field.to_string(),
                        descending,
                    });
                }
                _ => {
                    if let Some(filter) = parse_filter(schema, key, raw)? {
                        query.filters.push(filter);
                    }
                }
            }
        }
        Ok(query)
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

fn invalid(param: &str, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidQuery {
        param: param.to_string(),
        reason: reason.into(),
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize, StoreError> {
    raw.parse()
        .map_err(|_| invalid(key, format!("'{}' is not a non-negative integer", raw)))
}

fn parse_filter(
    schema: &ResourceSchema,
    key: &str,
    raw: &str,
) -> Result<Option<Filter>, StoreError> {
    if key == schema.id_field {
        return Ok(Some(Filter::equals(key, id_value(schema, raw))));
    }
    if let Some(field) = schema.field(key) {
        let value = match field.schema.kind {
            FieldKind::String => Value::from(raw),
            FieldKind::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid(key, format!("'{}' is not an integer", raw)))?,
            FieldKind::Number => raw
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| invalid(key, format!("'{}' is not a number", raw)))?,
            FieldKind::Boolean => raw
                .parse::<bool>()
                .map(Value::from)
                .map_err(|_| invalid(key, format!("'{}' is not a boolean", raw)))?,
            FieldKind::Array => {
                serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw))
            }
            FieldKind::Object => {
                return Err(invalid(key, "object fields cannot be filtered by value"))
            }
        };
        return Ok(Some(Filter::equals(key, value)));
    }

    const SUFFIXES: &[(&str, FilterOp)] = &[
        ("_gte", FilterOp::Gte),
        ("_gt", FilterOp::Gt),
        ("_lte", FilterOp::Lte),
        ("_lt", FilterOp::Lt),
        ("_like", FilterOp::Like),
    ];
    let Some((name, op, field)) = SUFFIXES.iter().find_map(|(suffix, op)| {
        let name = key.strip_suffix(suffix)?;
        schema.field(name).map(|field| (name, *op, field))
    }) else {
        return Ok(None);
    };

    let kind = field.schema.kind;
    let temporal = field.schema.format.is_some_and(|f| f.is_temporal());
    let operand = match op {
        FilterOp::Like if kind == FieldKind::String => Operand::Text(raw.to_lowercase()),
        FilterOp::Like => return Err(invalid(key, "substring filters apply to strings")),
        _ if matches!(kind, FieldKind::Integer | FieldKind::Number) => Operand::Number(
            raw.parse()
                .map_err(|_| invalid(key, format!("'{}' is not a number", raw)))?,
        ),
        _ if temporal => Operand::Instant(
            parse_instant(raw).ok_or_else(|| invalid(key, format!("'{}' is not a date", raw)))?,
        ),
        _ => return Err(invalid(key, "range filters apply to numbers and dates")),
    };
    Ok(Some(Filter {
        field: name.to_string(),
        op,
        operand,
    }))
}

/// A finite, restartable view over a snapshot of a collection.
///
/// The snapshot is taken when the listing is created; filters run each time
/// [`Listing::iter`] is called.
#[derive(Debug, Clone)]
pub struct Listing {
    schema: Arc<ResourceSchema>,
    records: Vec<Arc<Record>>,
    query: ListQuery,
}

impl Listing {
    fn matching(&self) -> impl Iterator<Item = &Arc<Record>> + '_ {
        self.records.iter().filter(move |record| {
            self.query.filters.iter().all(|filter| {
                filter.accepts(record.value(&self.schema, &filter.field).as_deref())
            })
        })
    }

    /// Matching records after sorting and pagination.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Arc<Record>> + '_> {
        let offset = self.query.offset;
        let limit = self.query.limit.unwrap_or(usize::MAX);
        match &self.query.sort {
            None => Box::new(self.matching().skip(offset).take(limit)),
            Some(key) => {
                let mut sorted: Vec<&Arc<Record>> = self.matching().collect();
                sorted.sort_by(|a, b| {
                    let ord = compare_values(
                        a.value(&self.schema, &key.field).as_deref(),
                        b.value(&self.schema, &key.field).as_deref(),
                    );
                    if key.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                Box::new(sorted.into_iter().skip(offset).take(limit))
            }
        }
    }

    /// Number of matching records before pagination.
    pub fn total(&self) -> usize {
        self.matching().count()
    }

    /// The page as a JSON array.
    pub fn to_json(&self) -> Value {
        Value::Array(self.iter().map(|r| r.to_json(&self.schema)).collect())
    }
}

/// Missing values sort last; mixed types compare by type rank.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 5,
            Value::Bool(_) => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Array(_) => 3,
            Value::Object(_) => 4,
        }
    }
    match (a, b) {
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Greater,
        (Some(_), None) => CmpOrdering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(CmpOrdering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

/// The store.
pub struct ResourceStore {
    schemas: SchemaSet,
    collections: HashMap<String, RwLock<Collection>>,
    generator: FakeDataGenerator,
    events: Arc<dyn EventSink>,
    salt: AtomicU64,
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("collections", &self.collections.len())
            .field("generator", &self.generator)
            .finish()
    }
}

impl ResourceStore {
    pub fn new(
        schemas: &SchemaSet,
        generator: FakeDataGenerator,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let collections = schemas
            .iter()
            .map(|schema| (schema.name.clone(), RwLock::new(Collection::new())))
            .collect();
        Self {
            schemas: schemas.clone(),
            collections,
            generator,
            events,
            salt: AtomicU64::new(0),
        }
    }

    pub fn schema(&self, name: &str) -> Result<&Arc<ResourceSchema>, StoreError> {
        self.schemas
            .get(name)
            .ok_or_else(|| StoreError::UnknownSchema(name.to_string()))
    }

    fn collection(&self, name: &str) -> Result<&RwLock<Collection>, StoreError> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownSchema(name.to_string()))
    }

    /// Create a record. Omitted required fields are generated; identifiers
    /// in the payload are ignored.
    pub fn create(&self, schema: &str, partial: Map<String, Value>) -> Result<Arc<Record>, StoreError> {
        let schema = self.schema(schema)?.clone();
        let mut fields = clean(&schema, partial);
        self.check_references(&schema, &fields)?;

        let missing: Vec<&str> = schema
            .fields
            .iter()
            .filter(|f| f.schema.required && !fields.contains_key(&f.name))
            .map(|f| f.name.as_str())
            .collect();
        if !missing.is_empty() {
            let ctx = self.generation_context(&schema)?;
            for name in missing {
                if let Some(value) = self.generator.generate(&schema, name, &ctx) {
                    fields.insert(name.to_string(), value);
                }
            }
        }

        self.insert(&schema, fields)
    }

    /// Fetch a record.
    pub fn get(&self, schema: &str, id: &str) -> Result<Arc<Record>, StoreError> {
        let collection = self.collection(schema)?.read();
        collection
            .get(id)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| not_found(schema, id))
    }

    /// List records matching a query.
    pub fn list(&self, schema: &str, query: ListQuery) -> Result<Listing, StoreError> {
        let resource = self.schema(schema)?.clone();
        let records = self
            .collection(schema)?
            .read()
            .order
            .values()
            .cloned()
            .collect();
        Ok(Listing {
            schema: resource,
            records,
            query,
        })
    }

    /// Merge fields into a record. `null` removes a field.
    pub fn update(
        &self,
        schema: &str,
        id: &str,
        patch: Map<String, Value>,
        expected_revision: Option<u64>,
    ) -> Result<Arc<Record>, StoreError> {
        let resource = self.schema(schema)?.clone();
        let patch = strip_id(&resource, patch);
        self.check_references(&resource, &patch)?;

        let mut collection = self.collection(schema)?.write();
        let (seq, current) = collection.get(id).ok_or_else(|| not_found(schema, id))?;
        check_revision(schema, id, current.revision, expected_revision)?;

        let mut fields = current.fields.clone();
        for (key, value) in patch {
            if value.is_null() {
                fields.remove(&key);
            } else {
                fields.insert(key, value);
            }
        }
        let record = Arc::new(Record {
            id: id.to_string(),
            revision: current.revision + 1,
            fields,
        });
        collection.order.insert(seq, record.clone());
        self.events.emit(ResourceEvent::new(
            schema,
            id,
            ChangeKind::Updated,
            record.revision,
        ));
        debug!(schema, id, revision = record.revision, "Record updated");
        Ok(record)
    }

    /// Remove a record, returning it.
    pub fn delete(
        &self,
        schema: &str,
        id: &str,
        expected_revision: Option<u64>,
    ) -> Result<Arc<Record>, StoreError> {
        let mut collection = self.collection(schema)?.write();
        let (seq, current) = collection.get(id).ok_or_else(|| not_found(schema, id))?;
        check_revision(schema, id, current.revision, expected_revision)?;
        let revision = current.revision + 1;

        collection.index.remove(id);
        let record = collection
            .order
            .remove(&seq)
            .ok_or_else(|| not_found(schema, id))?;
        self.events
            .emit(ResourceEvent::new(schema, id, ChangeKind::Deleted, revision));
        debug!(schema, id, "Record deleted");
        Ok(record)
    }

    /// Insert `count` fully generated records.
    pub fn seed(&self, schema: &str, count: usize) -> Result<usize, StoreError> {
        let resource = self.schema(schema)?.clone();
        for _ in 0..count {
            let ctx = self.generation_context(&resource)?;
            let fields = self.generator.generate_record(&resource, &ctx);
            self.insert(&resource, fields)?;
        }
        Ok(count)
    }

    /// Number of records in a collection.
    pub fn len(&self, schema: &str) -> Result<usize, StoreError> {
        Ok(self.collection(schema)?.read().index.len())
    }

    fn insert(
        &self,
        schema: &ResourceSchema,
        fields: Map<String, Value>,
    ) -> Result<Arc<Record>, StoreError> {
        let mut collection = self.collection(&schema.name)?.write();

        let id = loop {
            let n = collection.next_id;
            collection.next_id += 1;
            let candidate = match schema.id_strategy {
                IdStrategy::Sequence => n.to_string(),
                IdStrategy::Uuid => self.generator.uuid(&schema.name, n),
            };
            if !collection.index.contains_key(&candidate) {
                break candidate;
            }
        };

        let record = Arc::new(Record {
            id: id.clone(),
            revision: 1,
            fields,
        });
        let seq = collection.next_seq;
        collection.next_seq += 1;
        collection.index.insert(id.clone(), seq);
        collection.order.insert(seq, record.clone());

        self.events
            .emit(ResourceEvent::new(&schema.name, &id, ChangeKind::Created, 1));
        debug!(schema = %schema.name, id = %id, "Record created");
        Ok(record)
    }

    /// Every reference value present must name an existing target record.
    fn check_references(
        &self,
        schema: &ResourceSchema,
        fields: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        for (field, target) in schema.references() {
            let Some(value) = fields.get(&field.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let id = id_key(value).unwrap_or_else(|| value.to_string());
            let exists = self.collection(target)?.read().index.contains_key(&id);
            if !exists {
                return Err(StoreError::DanglingReference {
                    field: field.name.clone(),
                    target: target.to_string(),
                    id,
                });
            }
        }
        Ok(())
    }

    /// Generation context with candidate identifiers for required references.
    fn generation_context(&self, schema: &ResourceSchema) -> Result<GenerationContext, StoreError> {
        let mut ctx = GenerationContext::with_salt(self.salt.fetch_add(1, Ordering::Relaxed));
        for (field, target) in schema.references() {
            if !field.schema.required || ctx.references.contains_key(target) {
                continue;
            }
            let target_schema = self.schema(target)?;
            let ids = self
                .collection(target)?
                .read()
                .order
                .values()
                .map(|record| id_value(target_schema, &record.id))
                .collect();
            ctx.references.insert(target.to_string(), ids);
        }
        Ok(ctx)
    }
}

fn not_found(schema: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        schema: schema.to_string(),
        id: id.to_string(),
    }
}

fn check_revision(
    schema: &str,
    id: &str,
    current: u64,
    expected: Option<u64>,
) -> Result<(), StoreError> {
    match expected {
        Some(expected) if expected != current => Err(StoreError::RevisionMismatch {
            schema: schema.to_string(),
            id: id.to_string(),
            expected,
            current,
        }),
        _ => Ok(()),
    }
}

fn strip_id(schema: &ResourceSchema, mut fields: Map<String, Value>) -> Map<String, Value> {
    fields.remove(&schema.id_field);
    fields
}

/// Drop the identifier and null values from a create payload.
fn clean(schema: &ResourceSchema, fields: Map<String, Value>) -> Map<String, Value> {
    strip_id(schema, fields)
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .collect()
}
