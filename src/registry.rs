//! Route registry: path patterns and route resolution.
//!
//! Patterns are `/`-separated segments, each a literal or a parameter
//! written as `:name` or `{name}`. Resolution compares segments left to
//! right; at the first position where two candidates differ a literal
//! outranks a parameter, and among equals the earliest registration wins.

use crate::auth::AuthRequirement;
use crate::config::{Operation, ResponseDefinition, RouteDefinition, ValidationMode};
use crate::error::{ConflictError, EngineError, NoMatch, SchemaError};
use crate::exchange::percent_decode;
use crate::schema::{ResourceSchema, SchemaSet};
use hyper::Method;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    canonical: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, SchemaError> {
        if !pattern.starts_with('/') {
            return Err(SchemaError::new(pattern, "path must start with '/'"));
        }

        let mut segments = Vec::new();
        for raw in split_path(pattern) {
            let name = raw
                .strip_prefix(':')
                .or_else(|| raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')));
            let segment = match name {
                Some("") => return Err(SchemaError::new(pattern, "empty parameter name")),
                Some(name) => {
                    let duplicate = segments
                        .iter()
                        .any(|s| matches!(s, Segment::Param(p) if p == name));
                    if duplicate {
                        return Err(SchemaError::new(
                            pattern,
                            format!("duplicate parameter '{}'", name),
                        ));
                    }
                    Segment::Param(name.to_string())
                }
                None if raw.contains(['{', '}']) => {
                    return Err(SchemaError::new(
                        pattern,
                        format!("parameters must span a whole segment: '{}'", raw),
                    ))
                }
                None => Segment::Literal(percent_decode(raw, false)),
            };
            segments.push(segment);
        }

        let canonical = if segments.is_empty() {
            "/".to_string()
        } else {
            segments
                .iter()
                .map(|s| match s {
                    Segment::Literal(l) => format!("/{}", l),
                    Segment::Param(p) => format!("/:{}", p),
                })
                .collect()
        };

        Ok(Self {
            canonical,
            segments,
        })
    }

    /// Normalized pattern text (`:name` parameters, no trailing slash).
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Parameter names in path order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(p) => Some(p.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// The identifier parameter: the last one in the path.
    pub fn id_param(&self) -> Option<&str> {
        self.params().last()
    }

    /// Match decoded path segments, returning the parameters.
    fn matches(&self, segments: &[String]) -> Option<HashMap<String, String>> {
        if segments.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (pattern, actual) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Literal(literal) if literal == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if actual.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), actual.clone());
                }
            }
        }
        Some(params)
    }

    /// Whether `self` outranks `other` (both matching the same path).
    fn outranks(&self, other: &PathPattern) -> bool {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match (a, b) {
                (Segment::Literal(_), Segment::Param(_)) => return true,
                (Segment::Param(_), Segment::Literal(_)) => return false,
                _ => {}
            }
        }
        false
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Raw segments of a path, ignoring leading and trailing slashes.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    trimmed.split('/').filter(move |_| !trimmed.is_empty())
}

/// Per-route behaviour switches.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub name: Option<String>,
    pub validation: Option<ValidationMode>,
    pub auth: Option<AuthRequirement>,
    pub replay: bool,
    pub proxy: bool,
    pub variants: BTreeMap<u16, ResponseDefinition>,
    pub response: Option<ResponseDefinition>,
}

/// A registered route.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub pattern: PathPattern,
    pub schema: Option<Arc<ResourceSchema>>,
    pub operation: Operation,
    pub options: RouteOptions,
}

impl Route {
    pub fn new(
        method: Method,
        pattern: PathPattern,
        schema: Option<Arc<ResourceSchema>>,
        operation: Operation,
    ) -> Self {
        Self {
            method,
            pattern,
            schema,
            operation,
            options: RouteOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RouteOptions) -> Self {
        self.options = options;
        self
    }

    /// Name used in logs.
    pub fn label(&self) -> String {
        match &self.options.name {
            Some(name) => name.clone(),
            None => format!("{} {}", self.method, self.pattern),
        }
    }
}

/// All routes, in registration order.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: Vec<Arc<Route>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry: collection routes of every schema with a base
    /// path first, then the explicit routes in declaration order.
    pub fn from_config(
        schemas: &SchemaSet,
        routes: &[RouteDefinition],
    ) -> Result<Self, EngineError> {
        let mut registry = Self::new();

        for schema in schemas.iter() {
            let Some(base) = &schema.base_path else {
                continue;
            };
            let item = format!("{}/:id", base);
            let collection_routes = [
                (Method::GET, base.as_str(), Operation::List),
                (Method::POST, base.as_str(), Operation::Create),
                (Method::GET, item.as_str(), Operation::Get),
                (Method::PUT, item.as_str(), Operation::Update),
                (Method::PATCH, item.as_str(), Operation::Update),
                (Method::DELETE, item.as_str(), Operation::Delete),
            ];
            for (method, path, operation) in collection_routes {
                let options = RouteOptions {
                    auth: schema.auth.clone(),
                    ..RouteOptions::default()
                };
                let route = Route::new(
                    method,
                    PathPattern::parse(path)?,
                    Some(schema.clone()),
                    operation,
                )
                .with_options(options);
                registry.register(route)?;
            }
        }

        for def in routes {
            registry.register(compile_route(schemas, def)?)?;
        }

        Ok(registry)
    }

    /// Register a route; an identical method and pattern is a conflict.
    pub fn register(&mut self, route: Route) -> Result<(), ConflictError> {
        let conflict = self
            .routes
            .iter()
            .any(|r| r.method == route.method && r.pattern.as_str() == route.pattern.as_str());
        if conflict {
            return Err(ConflictError {
                method: route.method,
                pattern: route.pattern.as_str().to_string(),
            });
        }
        self.routes.push(Arc::new(route));
        Ok(())
    }

    /// Resolve a request to its best route and decoded path parameters.
    ///
    /// `HEAD` falls back to `GET` routes when no `HEAD` route matches.
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
    ) -> Result<(Arc<Route>, HashMap<String, String>), NoMatch> {
        let segments: Vec<String> = split_path(path)
            .map(|s| percent_decode(s, false))
            .collect();

        let mut allowed: Vec<Method> = Vec::new();
        let mut best: Option<(&Arc<Route>, HashMap<String, String>)> = None;
        let mut best_get: Option<(&Arc<Route>, HashMap<String, String>)> = None;

        for route in &self.routes {
            let Some(params) = route.pattern.matches(&segments) else {
                continue;
            };
            if !allowed.contains(&route.method) {
                allowed.push(route.method.clone());
            }
            let slot = if &route.method == method {
                &mut best
            } else if *method == Method::HEAD && route.method == Method::GET {
                &mut best_get
            } else {
                continue;
            };
            let better = match slot {
                Some((current, _)) => route.pattern.outranks(&current.pattern),
                None => true,
            };
            if better {
                *slot = Some((route, params));
            }
        }

        match best.or(best_get) {
            Some((route, params)) => Ok((route.clone(), params)),
            None => Err(NoMatch {
                method: method.clone(),
                path: path.to_string(),
                allowed,
            }),
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn compile_route(schemas: &SchemaSet, def: &RouteDefinition) -> Result<Route, SchemaError> {
    let subject = format!("{} {}", def.method, def.path);
    let method = Method::from_bytes(def.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| SchemaError::new(&subject, "invalid HTTP method"))?;
    let pattern = PathPattern::parse(&def.path)?;

    let schema = match &def.resource {
        Some(name) => Some(schemas.get(name).cloned().ok_or_else(|| {
            SchemaError::new(&subject, format!("unknown resource schema '{}'", name))
        })?),
        None => None,
    };
    if schema.is_none() && def.operation != Operation::Custom {
        return Err(SchemaError::new(
            &subject,
            "only custom routes may omit the resource",
        ));
    }
    if def.operation.targets_record() && pattern.id_param().is_none() {
        return Err(SchemaError::new(
            &subject,
            "operation needs an identifier parameter in the path",
        ));
    }
    if def.proxy && def.replay {
        return Err(SchemaError::new(&subject, "a route cannot be both proxied and replayed"));
    }

    let options = RouteOptions {
        name: def.name.clone(),
        validation: def.validation,
        auth: def.auth.clone().or_else(|| schema.as_ref().and_then(|s| s.auth.clone())),
        replay: def.replay,
        proxy: def.proxy,
        variants: def.variants.clone(),
        response: def.response.clone(),
    };
    Ok(Route::new(method, pattern, schema, def.operation).with_options(options))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: Method, path: &str) -> Route {
        Route::new(method, PathPattern::parse(path).unwrap(), None, Operation::Custom)
    }

    fn registry(routes: &[(Method, &str)]) -> RouteRegistry {
        let mut registry = RouteRegistry::new();
        for (method, path) in routes {
            registry.register(route(method.clone(), path)).unwrap();
        }
        registry
    }

    #[test]
    fn test_pattern_syntax() {
        let colon = PathPattern::parse("/users/:id/posts/").unwrap();
        let braces = PathPattern::parse("/users/{id}/posts").unwrap();
        assert_eq!(colon, braces);
        assert_eq!(colon.as_str(), "/users/:id/posts");
        assert_eq!(colon.id_param(), Some("id"));

        assert!(PathPattern::parse("users").is_err());
        assert!(PathPattern::parse("/users/{id}.json").is_err());
        assert!(PathPattern::parse("/a/:x/b/:x").is_err());
        assert!(PathPattern::parse("/a/:").is_err());
        assert_eq!(PathPattern::parse("/").unwrap().as_str(), "/");
    }

    #[test]
    fn test_literal_beats_param_regardless_of_order() {
        let registry = registry(&[(Method::GET, "/users/:id"), (Method::GET, "/users/me")]);
        let (route, params) = registry.resolve(&Method::GET, "/users/me").unwrap();
        assert_eq!(route.pattern.as_str(), "/users/me");
        assert!(params.is_empty());

        let (route, params) = registry.resolve(&Method::GET, "/users/42").unwrap();
        assert_eq!(route.pattern.as_str(), "/users/:id");
        assert_eq!(params["id"], "42");
    }

    #[test]
    fn test_first_differing_segment_decides() {
        let registry = registry(&[
            (Method::GET, "/:org/repos"),
            (Method::GET, "/acme/:section"),
        ]);
        let (route, _) = registry.resolve(&Method::GET, "/acme/repos").unwrap();
        assert_eq!(route.pattern.as_str(), "/acme/:section");
    }

    #[test]
    fn test_tie_goes_to_first_registered() {
        let registry = registry(&[(Method::GET, "/items/:a"), (Method::GET, "/items/:b")]);
        let (route, params) = registry.resolve(&Method::GET, "/items/1").unwrap();
        assert_eq!(route.pattern.as_str(), "/items/:a");
        assert_eq!(params["a"], "1");
    }

    #[test]
    fn test_trailing_slash_and_decoding() {
        let registry = registry(&[(Method::GET, "/files/:name")]);
        let (_, params) = registry.resolve(&Method::GET, "/files/a%20b%2Fc/").unwrap();
        assert_eq!(params["name"], "a b/c");
        assert!(registry.resolve(&Method::GET, "/files/").is_err());
    }

    #[test]
    fn test_conflict() {
        let mut registry = registry(&[(Method::GET, "/users/:id")]);
        let err = registry.register(route(Method::GET, "/users/{id}")).unwrap_err();
        assert_eq!(err.pattern, "/users/:id");
        assert!(registry.register(route(Method::DELETE, "/users/:id")).is_ok());
    }

    #[test]
    fn test_no_match_reports_allowed_methods() {
        let registry = registry(&[(Method::GET, "/users"), (Method::POST, "/users")]);
        let err = registry.resolve(&Method::DELETE, "/users").unwrap_err();
        assert_eq!(err.allowed, vec![Method::GET, Method::POST]);

        let err = registry.resolve(&Method::GET, "/nothing").unwrap_err();
        assert!(err.allowed.is_empty());
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let registry = registry(&[(Method::GET, "/health")]);
        let (route, _) = registry.resolve(&Method::HEAD, "/health").unwrap();
        assert_eq!(route.method, Method::GET);
    }

    #[test]
    fn test_from_config_generates_collection_routes() {
        let schemas = SchemaSet::build(
            &serde_yaml::from_str::<Vec<crate::config::SchemaDefinition>>(
                "- name: User\n  path: /users\n",
            )
            .unwrap(),
        )
        .unwrap();
        let routes: Vec<RouteDefinition> = serde_yaml::from_str(
            r#"
- method: get
  path: /users/me
  resource: User
  operation: custom
"#,
        )
        .unwrap();
        let registry = RouteRegistry::from_config(&schemas, &routes).unwrap();
        assert_eq!(registry.len(), 7);

        let (route, _) = registry.resolve(&Method::PATCH, "/users/1").unwrap();
        assert_eq!(route.operation, Operation::Update);
        let (route, _) = registry.resolve(&Method::GET, "/users/me").unwrap();
        assert_eq!(route.operation, Operation::Custom);
    }

    #[test]
    fn test_from_config_rejects_bad_routes() {
        let schemas = SchemaSet::build(&[]).unwrap();
        let cases = [
            "{method: GET, path: /x, operation: list}",
            "{method: GET, path: /x, resource: Ghost, operation: custom}",
            "{method: 'GE T', path: /x, operation: custom}",
        ];
        for case in cases {
            let def: RouteDefinition = serde_yaml::from_str(case).unwrap();
            assert!(
                matches!(
                    RouteRegistry::from_config(&schemas, &[def]),
                    Err(EngineError::Schema(_))
                ),
                "case {}",
                case
            );
        }

        let defs: Vec<RouteDefinition> = serde_yaml::from_str(
            "[{method: GET, path: /x, operation: custom}, {method: GET, path: /x/, operation: custom}]",
        )
        .unwrap();
        assert!(matches!(
            RouteRegistry::from_config(&schemas, &defs),
            Err(EngineError::Conflict(_))
        ));
    }
}
