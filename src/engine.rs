//! The request pipeline.
//!
//! [`Engine::handle`] takes one [`MockRequest`] through
//! `Received → Resolved → (Replayed | Validated) → Stored → Chaosed →
//! (Proxied) → Composed → Sent` and always produces a response; per-request
//! failures become [`ApiError`] bodies.

use crate::chaos::{ChaosDecision, ChaosInjector};
use crate::config::{
    FieldKind, GlobalSettings, IdStrategy, MockConfig, Operation, ResponseBody,
    ResponseDefinition, ValidationMode,
};
use crate::error::{ApiError, EngineError, NoMatch, SchemaError};
use crate::events::{EventSink, NullSink};
use crate::exchange::{MockRequest, MockResponse, RequestContext, ResponseSource, Stage};
use crate::generator::{FakeDataGenerator, GenerationContext};
use crate::negotiate::{negotiate, prefer_code, ContentType};
use crate::proxy::{Forwarder, HttpForwarder, UpstreamTarget};
use crate::registry::{Route, RouteRegistry};
use crate::replay::{Recorder, ReplayEntry, ReplayFallback, ReplayMatcher};
use crate::schema::{ResourceSchema, SchemaSet};
use crate::store::{parse_if_match, Filter, ListQuery, ResourceStore};
use crate::template::{TemplateContext, TemplateEngine};
use crate::validator::{ValidationOptions, Validator, Verdict};
use bytes::Bytes;
use hyper::{Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CORS_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const CORS_HEADERS: &str = "Content-Type, Authorization, Prefer, Accept, If-Match";

/// Request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub requests_rejected: u64,
    pub chaos_injected: u64,
    pub drift_detected: u64,
}

struct Upstream {
    target: UpstreamTarget,
    forwarder: Arc<dyn Forwarder>,
    fallback: bool,
    recorder: Option<Recorder>,
}

struct Replay {
    matcher: ReplayMatcher,
    fallback: ReplayFallback,
    all_routes: bool,
}

/// Assembles an [`Engine`] with optional injected strategies.
pub struct EngineBuilder {
    config: MockConfig,
    forwarder: Option<Arc<dyn Forwarder>>,
    replay_entries: Option<Vec<ReplayEntry>>,
    events: Option<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            forwarder: None,
            replay_entries: None,
            events: None,
        }
    }

    /// Use this forwarder instead of the HTTP client.
    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Use these recordings instead of reading `replay.recordings`.
    pub fn with_replay_entries(mut self, entries: Vec<ReplayEntry>) -> Self {
        self.replay_entries = Some(entries);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let schemas = SchemaSet::build(&config.schemas)?;
        let registry = RouteRegistry::from_config(&schemas, &config.routes)?;

        for route in registry.routes() {
            if route.options.proxy && config.proxy.is_none() {
                return Err(SchemaError::new(route.label(), "route is proxied but no proxy is configured").into());
            }
            if route.options.replay && config.replay.is_none() {
                return Err(SchemaError::new(route.label(), "route replays but no recordings are configured").into());
            }
        }

        let generator = FakeDataGenerator::new(config.settings.seed);
        let events = self.events.unwrap_or_else(|| Arc::new(NullSink));
        let store = ResourceStore::new(&schemas, generator.clone(), events);
        seed_initial(&store, &schemas)?;

        let chaos = ChaosInjector::from_config(&config.chaos, config.settings.seed)?;

        let upstream = match &config.proxy {
            Some(proxy) => {
                let forwarder = match self.forwarder {
                    Some(forwarder) => forwarder,
                    None => Arc::new(HttpForwarder::new()?),
                };
                Some(Upstream {
                    target: UpstreamTarget::new(&proxy.target, Duration::from_millis(proxy.timeout_ms))?,
                    forwarder,
                    fallback: proxy.fallback,
                    recorder: proxy.record.as_ref().map(Recorder::new),
                })
            }
            None => None,
        };

        let replay = match &config.replay {
            Some(replay) => {
                let matcher = match self.replay_entries {
                    Some(entries) => ReplayMatcher::new(entries, replay.query, replay.body),
                    None => ReplayMatcher::load(&replay.recordings, replay.query, replay.body)?,
                };
                Some(Replay {
                    matcher,
                    fallback: replay.fallback,
                    all_routes: replay.all_routes,
                })
            }
            None => None,
        };

        info!(
            schemas = schemas.len(),
            routes = registry.len(),
            chaos_rules = chaos.rule_count(),
            proxy = upstream.as_ref().map(|u| u.target.base_url()).unwrap_or("-"),
            recordings = replay.as_ref().map_or(0, |r| r.matcher.len()),
            "Mock engine initialized"
        );

        Ok(Engine {
            settings: config.settings,
            registry,
            store,
            generator,
            validator: Validator::new(),
            templates: TemplateEngine::new(),
            chaos,
            upstream,
            replay,
            default_response: config.default_response,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            chaos_injected: AtomicU64::new(0),
            drift_detected: AtomicU64::new(0),
        })
    }
}

/// Seed `initial_records`, referenced schemas before the schemas that point at them.
fn seed_initial(store: &ResourceStore, schemas: &SchemaSet) -> Result<(), EngineError> {
    let mut pending: Vec<&Arc<ResourceSchema>> =
        schemas.iter().filter(|s| s.initial_records > 0).collect();
    let mut seeded: HashSet<&str> = HashSet::new();

    while !pending.is_empty() {
        let next = pending
            .iter()
            .position(|schema| {
                schema.references().all(|(_, target)| {
                    target == schema.name
                        || seeded.contains(target)
                        || schemas.get(target).map_or(true, |t| t.initial_records == 0)
                })
            })
            .unwrap_or(0);
        let schema = pending.remove(next);
        store
            .seed(&schema.name, schema.initial_records)
            .map_err(|e| SchemaError::new(&schema.name, e.to_string()))?;
        debug!(schema = %schema.name, records = schema.initial_records, "Seeded collection");
        seeded.insert(schema.name.as_str());
    }
    Ok(())
}

/// The mock engine.
pub struct Engine {
    settings: GlobalSettings,
    registry: RouteRegistry,
    store: ResourceStore,
    generator: FakeDataGenerator,
    validator: Validator,
    templates: TemplateEngine,
    chaos: ChaosInjector,
    upstream: Option<Upstream>,
    replay: Option<Replay>,
    default_response: Option<ResponseDefinition>,
    /// Total requests processed.
    requests_total: AtomicU64,
    /// Requests that resolved to a route.
    requests_matched: AtomicU64,
    /// Requests no route matched.
    requests_unmatched: AtomicU64,
    /// Requests rejected by strict validation.
    requests_rejected: AtomicU64,
    /// Requests a chaos rule failed or corrupted.
    chaos_injected: AtomicU64,
    /// Proxied exchanges that disagreed with the route's schema.
    drift_detected: AtomicU64,
}

impl Engine {
    /// Build an engine with the default strategies.
    pub fn new(config: MockConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: MockConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Recorder capturing proxied exchanges, if recording is configured.
    pub fn recorder(&self) -> Option<&Recorder> {
        self.upstream.as_ref().and_then(|u| u.recorder.as_ref())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_matched: self.requests_matched.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            chaos_injected: self.chaos_injected.load(Ordering::Relaxed),
            drift_detected: self.drift_detected.load(Ordering::Relaxed),
        }
    }

    /// Handle one request.
    pub async fn handle(&self, request: MockRequest) -> MockResponse {
        let started = Instant::now();
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let mut ctx = RequestContext::new(request);
        let response = match self.process(&mut ctx).await {
            Ok(response) => response,
            Err(err) => error_response(&err, ResponseSource::Error),
        };
        let response = self.finish(&mut ctx, response);

        debug!(
            method = %ctx.request.method,
            path = %ctx.request.path,
            status = response.status.as_u16(),
            source = ?response.source,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
        response
    }

    async fn process(&self, ctx: &mut RequestContext) -> Result<MockResponse, ApiError> {
        if self.settings.cors && ctx.request.method == Method::OPTIONS {
            return Ok(MockResponse::new(StatusCode::NO_CONTENT, ResponseSource::Preflight));
        }

        if let Some(latency) = &self.settings.latency {
            let delay_ms = latency.calculate();
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        let (route, params) = match self.registry.resolve(&ctx.request.method, &ctx.request.path) {
            Ok(found) => found,
            Err(no_match) => return self.unmatched(ctx, no_match).await,
        };
        self.requests_matched.fetch_add(1, Ordering::Relaxed);
        if self.settings.log_matches {
            info!(
                route = %route.label(),
                method = %ctx.request.method,
                path = %ctx.request.path,
                "Matched route"
            );
        }
        ctx.route = Some(route.clone());
        ctx.params = params;
        ctx.advance(Stage::Resolved);

        self.authorize(&route, &ctx.request)?;

        if self.replay_armed(&route) {
            if let Some(response) = self.replay(ctx)? {
                return Ok(response);
            }
        }

        if route.options.proxy {
            return self.proxy_route(ctx, &route).await;
        }

        let accept = negotiate(ctx.request.header("accept")).ok_or_else(ApiError::not_acceptable)?;

        let payload = match (&route.schema, route.operation) {
            (Some(schema), Operation::Create | Operation::Update) => {
                Some(self.validate(ctx, &route, schema)?)
            }
            _ => None,
        };

        let variant = prefer_code(ctx.request.header("prefer"));
        let mut response = match variant {
            Some(code) => match route.options.variants.get(&code) {
                Some(definition) => {
                    self.compose_definition(definition, ctx, None, accept, ResponseSource::Variant)?
                }
                None => MockResponse::new(
                    StatusCode::from_u16(code).unwrap_or(StatusCode::OK),
                    ResponseSource::Variant,
                ),
            },
            None => {
                let response = self.execute(ctx, &route, payload, accept)?;
                ctx.advance(Stage::Stored);
                response
            }
        };

        match self.chaos.decide(&route, ctx) {
            ChaosDecision::None => {}
            ChaosDecision::Delay(delay) => {
                debug!(route = %route.label(), delay_ms = delay.as_millis() as u64, "Chaos delay");
                tokio::time::sleep(delay).await;
            }
            ChaosDecision::Fail { rule, status, message } => {
                self.chaos_injected.fetch_add(1, Ordering::Relaxed);
                warn!(route = %route.label(), rule = %rule, status = status.as_u16(), "Chaos failure injected");
                ctx.advance(Stage::Chaosed);
                return Ok(error_response(&ApiError::chaos(status, message), ResponseSource::Chaos));
            }
            ChaosDecision::Corrupt { rule, mode } => {
                self.chaos_injected.fetch_add(1, Ordering::Relaxed);
                warn!(route = %route.label(), rule = %rule, mode = ?mode, "Chaos corruption injected");
                response.body = self.chaos.corrupt(mode, &response.body);
            }
        }
        ctx.advance(Stage::Chaosed);
        ctx.advance(Stage::Composed);
        Ok(response)
    }

    /// No route matched: replay, forward, default response or 404/405.
    async fn unmatched(&self, ctx: &mut RequestContext, no_match: NoMatch) -> Result<MockResponse, ApiError> {
        self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
        if self.settings.log_unmatched {
            info!(
                method = %ctx.request.method,
                path = %ctx.request.path,
                "No route matched request"
            );
        }

        if let Some(replay) = self.replay.as_ref().filter(|r| r.all_routes) {
            if let Ok(entry) = replay.matcher.lookup(&ctx.request) {
                ctx.advance(Stage::Replayed);
                return Ok(entry.response.to_response());
            }
        }

        if let Some(upstream) = self.upstream.as_ref().filter(|u| u.fallback) {
            return self.forward(ctx, upstream).await;
        }

        if let Some(default) = &self.default_response {
            let accept = negotiate(ctx.request.header("accept")).unwrap_or(ContentType::Json);
            return self.compose_definition(default, ctx, None, accept, ResponseSource::Default);
        }

        Err(no_match.into())
    }

    fn authorize(&self, route: &Route, request: &MockRequest) -> Result<(), ApiError> {
        if self.settings.no_auth {
            return Ok(());
        }
        match route.options.auth.as_ref().or(self.settings.auth.as_ref()) {
            Some(requirement) => requirement.check(request).inspect_err(|_| {
                debug!(route = %route.label(), "Missing credentials");
            }),
            None => Ok(()),
        }
    }

    fn replay_armed(&self, route: &Route) -> bool {
        self.replay
            .as_ref()
            .is_some_and(|r| r.all_routes || route.options.replay)
    }

    /// `Ok(None)` means no recording matched and the mock pipeline continues.
    fn replay(&self, ctx: &mut RequestContext) -> Result<Option<MockResponse>, ApiError> {
        let Some(replay) = &self.replay else {
            return Ok(None);
        };
        match replay.matcher.lookup(&ctx.request) {
            Ok(entry) => {
                ctx.advance(Stage::Replayed);
                Ok(Some(entry.response.to_response()))
            }
            Err(miss) => match replay.fallback {
                ReplayFallback::Mock => {
                    debug!(method = %miss.method, path = %miss.path, "No recording, falling back to mock");
                    Ok(None)
                }
                ReplayFallback::Fail => Err(ApiError::no_recording(&miss)),
            },
        }
    }

    /// Proxy-armed route: chaos first, then the upstream.
    async fn proxy_route(&self, ctx: &mut RequestContext, route: &Route) -> Result<MockResponse, ApiError> {
        let Some(upstream) = &self.upstream else {
            return Err(ApiError::new(
                "upstream_unreachable",
                "no upstream configured",
                StatusCode::BAD_GATEWAY,
            ));
        };

        let mut corruption = None;
        match self.chaos.decide(route, ctx) {
            ChaosDecision::None => {}
            ChaosDecision::Delay(delay) => tokio::time::sleep(delay).await,
            ChaosDecision::Fail { rule, status, message } => {
                self.chaos_injected.fetch_add(1, Ordering::Relaxed);
                warn!(route = %route.label(), rule = %rule, status = status.as_u16(), "Chaos failure injected");
                ctx.advance(Stage::Chaosed);
                return Ok(error_response(&ApiError::chaos(status, message), ResponseSource::Chaos));
            }
            ChaosDecision::Corrupt { rule, mode } => {
                self.chaos_injected.fetch_add(1, Ordering::Relaxed);
                warn!(route = %route.label(), rule = %rule, mode = ?mode, "Chaos corruption injected");
                corruption = Some(mode);
            }
        }
        ctx.advance(Stage::Chaosed);

        let mut response = self.forward(ctx, upstream).await?;
        self.check_drift(route, &ctx.request, &response);
        if let Some(mode) = corruption {
            response.body = self.chaos.corrupt(mode, &response.body);
        }
        Ok(response)
    }

    async fn forward(&self, ctx: &mut RequestContext, upstream: &Upstream) -> Result<MockResponse, ApiError> {
        let response = upstream
            .forwarder
            .forward(&ctx.request, &upstream.target)
            .await
            .map_err(|err| {
                warn!(upstream = %upstream.target.base_url(), error = %err, "Upstream request failed");
                ApiError::from(err)
            })?;
        if let Some(recorder) = &upstream.recorder {
            recorder.record(&ctx.request, &response);
        }
        ctx.advance(Stage::Proxied);
        Ok(response)
    }

    /// Compare a proxied exchange against the route's schema and log every
    /// disagreement. The relay is never blocked.
    fn check_drift(&self, route: &Route, request: &MockRequest, response: &MockResponse) {
        let Some(schema) = &route.schema else {
            return;
        };
        let strict = self.strict_for(route, schema);

        if route.operation.is_write() && !request.body.is_empty() {
            let options = ValidationOptions {
                strict,
                partial: request.method == Method::PATCH,
            };
            match serde_json::from_slice::<Value>(&request.body) {
                Ok(body) => self.report_drift(route, "request", self.validator.validate(schema, &body, options)),
                Err(e) => {
                    self.drift_detected.fetch_add(1, Ordering::Relaxed);
                    warn!(route = %route.label(), direction = "request", error = %e, "Proxied body is not JSON");
                }
            }
        }

        if !response.status.is_success() || response.body.is_empty() {
            return;
        }
        let options = ValidationOptions {
            strict,
            partial: false,
        };
        match response.json() {
            Some(Value::Array(items)) => {
                for item in &items {
                    self.report_drift(route, "response", self.validator.validate(schema, item, options));
                }
            }
            Some(record) => self.report_drift(route, "response", self.validator.validate(schema, &record, options)),
            None => {
                self.drift_detected.fetch_add(1, Ordering::Relaxed);
                warn!(route = %route.label(), direction = "response", "Upstream body is not JSON");
            }
        }
    }

    fn report_drift(&self, route: &Route, direction: &str, verdict: Verdict) {
        let Verdict::Invalid(violations) = verdict else {
            return;
        };
        self.drift_detected.fetch_add(1, Ordering::Relaxed);
        for violation in &violations {
            warn!(
                route = %route.label(),
                direction,
                field = %violation.field,
                constraint = ?violation.constraint,
                "Upstream drift: {}",
                violation.message
            );
        }
    }

    /// Route setting, then schema setting, then the global default.
    fn strict_for(&self, route: &Route, schema: &ResourceSchema) -> bool {
        match route.options.validation {
            Some(ValidationMode::Strict) => true,
            Some(ValidationMode::Lenient) => false,
            None => schema.strict.unwrap_or(self.settings.strict),
        }
    }

    /// Validate a create/update body; returns the fields to store.
    fn validate(
        &self,
        ctx: &mut RequestContext,
        route: &Route,
        schema: &ResourceSchema,
    ) -> Result<Map<String, Value>, ApiError> {
        let payload: Value = if ctx.request.body.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(&ctx.request.body)
                .map_err(|e| ApiError::bad_request(format!("Request body is not valid JSON: {}", e)))?
        };
        let Value::Object(fields) = &payload else {
            return Err(ApiError::bad_request("Request body must be a JSON object"));
        };

        let strict = self.strict_for(route, schema);
        let options = ValidationOptions {
            strict,
            partial: ctx.request.method == Method::PATCH,
        };

        let verdict = self.validator.validate(schema, &payload, options);
        ctx.verdict = Some(verdict.clone());
        match verdict {
            Verdict::Valid(normalized) => {
                ctx.advance(Stage::Validated);
                Ok(normalized)
            }
            Verdict::Invalid(violations) if strict => {
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                info!(
                    route = %route.label(),
                    violations = violations.len(),
                    "Rejected invalid payload"
                );
                ctx.advance(Stage::Rejected);
                Err(ApiError::validation_failed(violations))
            }
            Verdict::Invalid(violations) => {
                for violation in &violations {
                    warn!(
                        route = %route.label(),
                        field = %violation.field,
                        constraint = ?violation.constraint,
                        "{}",
                        violation.message
                    );
                }
                ctx.advance(Stage::Validated);
                Ok(fields.clone())
            }
        }
    }

    /// Run the route's operation against the store.
    fn execute(
        &self,
        ctx: &RequestContext,
        route: &Route,
        payload: Option<Map<String, Value>>,
        accept: ContentType,
    ) -> Result<MockResponse, ApiError> {
        let Some(schema) = &route.schema else {
            return self.custom(ctx, route, None, accept);
        };
        let id_param = route
            .operation
            .targets_record()
            .then(|| route.pattern.id_param())
            .flatten();
        let scope = scope_fields(schema, &ctx.params, id_param);
        let expected = ctx.request.header("if-match").and_then(parse_if_match);

        match route.operation {
            Operation::List => {
                let mut query = ListQuery::parse(schema, &ctx.request.query_pairs())?;
                for (field, value) in scope {
                    query = query.with_filter(Filter::equals(field, value));
                }
                let listing = self.store.list(&schema.name, query)?;
                Ok(render(StatusCode::OK, ResponseSource::Store, accept, &listing.to_json())
                    .with_header("X-Total-Count", listing.total().to_string()))
            }
            Operation::Create => {
                let mut fields = payload.unwrap_or_default();
                fields.extend(scope);
                let record = self.store.create(&schema.name, fields)?;
                let location = format!("{}/{}", ctx.request.path.trim_end_matches('/'), record.id);
                Ok(render(StatusCode::CREATED, ResponseSource::Store, accept, &record.to_json(schema))
                    .with_header("Location", location)
                    .with_header("ETag", record.etag()))
            }
            Operation::Get | Operation::Update | Operation::Delete => {
                let id = id_param
                    .and_then(|name| ctx.params.get(name))
                    .ok_or_else(|| ApiError::bad_request("Missing record identifier"))?;
                let current = self.store.get(&schema.name, id)?;
                let in_scope = scope
                    .iter()
                    .all(|(field, value)| current.fields.get(field) == Some(value));
                if !in_scope {
                    return Err(crate::error::StoreError::NotFound {
                        schema: schema.name.clone(),
                        id: id.clone(),
                    }
                    .into());
                }

                match route.operation {
                    Operation::Get => Ok(render(StatusCode::OK, ResponseSource::Store, accept, &current.to_json(schema))
                        .with_header("ETag", current.etag())),
                    Operation::Update => {
                        let record = self.store.update(&schema.name, id, payload.unwrap_or_default(), expected)?;
                        Ok(render(StatusCode::OK, ResponseSource::Store, accept, &record.to_json(schema))
                            .with_header("ETag", record.etag()))
                    }
                    _ => {
                        self.store.delete(&schema.name, id, expected)?;
                        Ok(MockResponse::new(StatusCode::NO_CONTENT, ResponseSource::Store))
                    }
                }
            }
            Operation::Custom => {
                let record = self.sample_record(schema, ctx);
                self.custom(ctx, route, Some(record), accept)
            }
        }
    }

    /// Custom routes answer with their configured response, else the sample
    /// record, else 204.
    fn custom(
        &self,
        ctx: &RequestContext,
        route: &Route,
        record: Option<Value>,
        accept: ContentType,
    ) -> Result<MockResponse, ApiError> {
        match (&route.options.response, record) {
            (Some(definition), record) => {
                self.compose_definition(definition, ctx, record, accept, ResponseSource::Custom)
            }
            (None, Some(record)) => Ok(render(StatusCode::OK, ResponseSource::Custom, accept, &record)),
            (None, None) => Ok(MockResponse::new(StatusCode::NO_CONTENT, ResponseSource::Custom)),
        }
    }

    /// A generated record for custom routes, stable per path under a seed.
    fn sample_record(&self, schema: &ResourceSchema, ctx: &RequestContext) -> Value {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        ctx.request.path.hash(&mut hasher);
        let salt = hasher.finish();

        let mut record = self
            .generator
            .generate_record(schema, &GenerationContext::with_salt(salt));
        let id = match ctx.params.get(&schema.id_field) {
            Some(id) => crate::store::id_value(schema, id),
            None => match schema.id_strategy {
                IdStrategy::Uuid => Value::from(self.generator.uuid(&schema.name, salt)),
                IdStrategy::Sequence => Value::from(salt % 1000 + 1),
            },
        };
        record.insert(schema.id_field.clone(), id);
        Value::Object(record)
    }

    /// Build a response from a configured definition.
    fn compose_definition(
        &self,
        definition: &ResponseDefinition,
        ctx: &RequestContext,
        record: Option<Value>,
        accept: ContentType,
        source: ResponseSource,
    ) -> Result<MockResponse, ApiError> {
        let status = StatusCode::from_u16(definition.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let explicit_type = definition
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone());

        let body = match &definition.body {
            Some(body) if definition.template => {
                let mut tctx = TemplateContext::from_request(&ctx.request, &ctx.params);
                if let Some(record) = record {
                    tctx = tctx.with_record(record);
                }
                self.templates
                    .render_body(body, &tctx)
                    .map_err(|e| ApiError::new("template_error", e.to_string(), StatusCode::INTERNAL_SERVER_ERROR))?
            }
            Some(body) => Bytes::from(
                body.to_bytes()
                    .map_err(|e| ApiError::new("body_error", e.to_string(), StatusCode::INTERNAL_SERVER_ERROR))?,
            ),
            None => Bytes::new(),
        };

        // JSON bodies follow content negotiation unless the type is pinned.
        let (content_type, body) = match (&definition.body, explicit_type) {
            (_, Some(pinned)) => (pinned, body),
            (Some(ResponseBody::Json { .. }), None) if accept == ContentType::Xml => {
                let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                (accept.mime().to_string(), accept.render(&value))
            }
            (Some(body_def), None) => (body_def.content_type().to_string(), body),
            (None, None) => (self.settings.default_content_type.clone(), body),
        };

        let mut response = MockResponse::new(status, source).with_body(body);
        if !response.body.is_empty() {
            response.set_header("Content-Type", content_type);
        }
        for (name, value) in &definition.headers {
            if !name.eq_ignore_ascii_case("content-type") {
                response.set_header(name.clone(), value.clone());
            }
        }
        Ok(response)
    }

    fn finish(&self, ctx: &mut RequestContext, mut response: MockResponse) -> MockResponse {
        if self.settings.cors {
            response.set_header("Access-Control-Allow-Origin", "*");
            response.set_header("Access-Control-Allow-Methods", CORS_METHODS);
            response.set_header("Access-Control-Allow-Headers", CORS_HEADERS);
            response.set_header("Access-Control-Expose-Headers", "ETag, Location, X-Total-Count");
        }
        if ctx.request.method == Method::HEAD {
            response.body = Bytes::new();
        }
        ctx.advance(Stage::Sent);
        response
    }
}

/// Path parameters (other than the record identifier) that name schema
/// fields, as typed values.
fn scope_fields(
    schema: &ResourceSchema,
    params: &HashMap<String, String>,
    id_param: Option<&str>,
) -> Vec<(String, Value)> {
    let mut scope: Vec<(String, Value)> = params
        .iter()
        .filter(|(name, _)| Some(name.as_str()) != id_param)
        .filter_map(|(name, raw)| {
            let field = schema.field(name)?;
            let value = match field.schema.kind {
                FieldKind::Integer => raw.parse::<i64>().map(Value::from).ok()?,
                FieldKind::Number => raw.parse::<f64>().map(Value::from).ok()?,
                _ => Value::from(raw.as_str()),
            };
            Some((name.clone(), value))
        })
        .collect();
    scope.sort_by(|a, b| a.0.cmp(&b.0));
    scope
}

fn render(status: StatusCode, source: ResponseSource, accept: ContentType, value: &Value) -> MockResponse {
    MockResponse::new(status, source)
        .with_header("Content-Type", accept.mime())
        .with_body(accept.render(value))
}

/// Error responses are always JSON.
pub(crate) fn error_response(err: &ApiError, source: ResponseSource) -> MockResponse {
    let mut response = MockResponse::new(err.status, source)
        .with_header("Content-Type", "application/json")
        .with_body(err.body().to_string());
    for (name, value) in &err.headers {
        response.set_header(name.clone(), value.clone());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(yaml: &str) -> Engine {
        let config: MockConfig = serde_yaml::from_str(yaml).unwrap();
        Engine::new(config).unwrap()
    }

    const USERS: &str = r#"
settings:
  seed: 42
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

    #[tokio::test]
    async fn test_create_and_get() {
        let engine = engine(USERS);
        let created = engine
            .handle(MockRequest::new(Method::POST, "/users").with_json(&json!({"name": "Ann"})))
            .await;
        assert_eq!(created.status, StatusCode::CREATED);
        assert_eq!(created.header("etag"), Some("\"1\""));
        let body = created.json().unwrap();
        let id = body["id"].as_str().unwrap().to_string();
        assert_eq!(created.header("location"), Some(format!("/users/{}", id).as_str()));

        let fetched = engine.handle(MockRequest::new(Method::GET, &format!("/users/{}", id))).await;
        assert_eq!(fetched.status, StatusCode::OK);
        assert_eq!(fetched.json().unwrap(), body);
    }

    #[tokio::test]
    async fn test_preflight_and_cors() {
        let engine = engine(USERS);
        let response = engine.handle(MockRequest::new(Method::OPTIONS, "/anything")).await;
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(response.source, ResponseSource::Preflight);
        assert_eq!(response.header("access-control-allow-methods"), Some(CORS_METHODS));
    }

    #[tokio::test]
    async fn test_not_found_and_method_not_allowed() {
        let engine = engine(USERS);
        let missing = engine.handle(MockRequest::new(Method::GET, "/orders")).await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_eq!(missing.json().unwrap()["error"], "route_not_found");

        let wrong = engine.handle(MockRequest::new(Method::DELETE, "/users")).await;
        assert_eq!(wrong.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(wrong.header("allow"), Some("GET, POST"));
        assert_eq!(engine.stats().requests_unmatched, 2);
    }

    #[tokio::test]
    async fn test_head_strips_body() {
        let engine = engine(USERS);
        let response = engine.handle(MockRequest::new(Method::HEAD, "/users")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.body.is_empty());
        assert_eq!(response.header("x-total-count"), Some("0"));
    }

    #[tokio::test]
    async fn test_not_acceptable() {
        let engine = engine(USERS);
        let response = engine
            .handle(MockRequest::new(Method::GET, "/users").with_header("Accept", "text/html"))
            .await;
        assert_eq!(response.status, StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_xml_listing() {
        let engine = engine(USERS);
        engine
            .handle(MockRequest::new(Method::POST, "/users").with_json(&json!({"name": "Ann"})))
            .await;
        let response = engine
            .handle(MockRequest::new(Method::GET, "/users").with_header("Accept", "application/xml"))
            .await;
        assert_eq!(response.header("content-type"), Some("application/xml"));
        let xml = String::from_utf8(response.body.to_vec()).unwrap();
        assert!(xml.contains("<root><item>"));
        assert!(xml.contains("<name>Ann</name>"));
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let engine = engine(USERS);
        let response = engine
            .handle(MockRequest::new(Method::POST, "/users").with_body("{not json"))
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);

        let response = engine
            .handle(MockRequest::new(Method::POST, "/users").with_json(&json!([1, 2])))
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_proxy_route_requires_proxy_config() {
        let config: MockConfig = serde_yaml::from_str(
            r#"
routes:
  - method: GET
    path: /live
    operation: custom
    proxy: true
"#,
        )
        .unwrap();
        assert!(matches!(Engine::new(config), Err(EngineError::Schema(_))));
    }

    #[test]
    fn test_build_validates_configuration() {
        let mut config: MockConfig = serde_yaml::from_str(
            r#"
chaos:
  enabled: true
  rules:
    - id: flaky
      path: "**"
      effect:
        type: fail
        status: 500
"#,
        )
        .unwrap();
        config.chaos.rules[0].probability = f64::NAN;
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_initial_records_seeded_in_reference_order() {
        let engine = engine(
            r#"
settings:
  seed: 3
schemas:
  - name: Post
    initial_records: 4
    fields:
      author_id:
        type: string
        required: true
        references: User
  - name: User
    initial_records: 2
    fields:
      name: string
"#,
        );
        assert_eq!(engine.store().len("User").unwrap(), 2);
        let posts = engine.store().list("Post", ListQuery::default()).unwrap();
        assert_eq!(posts.total(), 4);
        for post in posts.iter() {
            let author = post.fields["author_id"].as_str().unwrap();
            assert!(engine.store().get("User", author).is_ok());
        }
    }
}
