//! Fault injection.
//!
//! Rules fire independently with their configured probability; the most
//! severe effect that fired is applied (`Fail > Corrupt > Delay`).

use crate::config::{ChaosConfig, ChaosEffectDefinition, ChaosRuleDefinition, CorruptionMode, DelayConfig};
use crate::error::SchemaError;
use crate::exchange::RequestContext;
use crate::registry::Route;
use bytes::Bytes;
use globset::{GlobBuilder, GlobMatcher};
use hyper::{Method, StatusCode};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// What the injector decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaosDecision {
    None,
    Delay(Duration),
    Corrupt {
        rule: String,
        mode: CorruptionMode,
    },
    Fail {
        rule: String,
        status: StatusCode,
        message: String,
    },
}

impl ChaosDecision {
    fn severity(&self) -> u8 {
        match self {
            ChaosDecision::None => 0,
            ChaosDecision::Delay(_) => 1,
            ChaosDecision::Corrupt { .. } => 2,
            ChaosDecision::Fail { .. } => 3,
        }
    }

    /// Whether `other` should replace `self`.
    fn yields_to(&self, other: &ChaosDecision) -> bool {
        match (self, other) {
            (ChaosDecision::Delay(current), ChaosDecision::Delay(candidate)) => candidate > current,
            _ => other.severity() > self.severity(),
        }
    }
}

#[derive(Debug)]
struct ChaosRule {
    id: String,
    glob: GlobMatcher,
    methods: Vec<Method>,
    probability: f64,
    effect: ChaosEffectDefinition,
}

impl ChaosRule {
    fn compile(def: &ChaosRuleDefinition) -> Result<Self, SchemaError> {
        if !(0.0..=1.0).contains(&def.probability) {
            return Err(SchemaError::new(
                format!("chaos rule '{}'", def.id),
                format!("probability must be within 0.0 - 1.0, got {}", def.probability),
            ));
        }
        let glob = GlobBuilder::new(&def.path)
            .literal_separator(true)
            .build()
            .map_err(|e| SchemaError::new(format!("chaos rule '{}'", def.id), e.to_string()))?
            .compile_matcher();
        let methods = def
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                    SchemaError::new(format!("chaos rule '{}'", def.id), format!("invalid method '{}'", m))
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            id: def.id.clone(),
            glob,
            methods,
            probability: def.probability,
            effect: def.effect.clone(),
        })
    }

    fn applies(&self, route: &Route, ctx: &RequestContext) -> bool {
        let method_ok = self.methods.is_empty() || self.methods.contains(&ctx.request.method);
        method_ok
            && (self.glob.is_match(&ctx.request.path) || self.glob.is_match(route.pattern.as_str()))
    }
}

/// Rules applied when chaos is switched on without explicit rules.
fn preset_rules() -> Vec<ChaosRuleDefinition> {
    vec![
        ChaosRuleDefinition {
            id: "preset-failure".to_string(),
            path: "**".to_string(),
            methods: Vec::new(),
            probability: 0.1,
            effect: ChaosEffectDefinition::Fail {
                status: 500,
                message: Some("chaos mode struck".to_string()),
            },
        },
        ChaosRuleDefinition {
            id: "preset-latency".to_string(),
            path: "**".to_string(),
            methods: Vec::new(),
            probability: 0.2,
            effect: ChaosEffectDefinition::Delay(DelayConfig {
                fixed_ms: 0,
                min_ms: 0,
                max_ms: 2000,
            }),
        },
    ]
}

/// Decides and applies chaos effects.
#[derive(Debug)]
pub struct ChaosInjector {
    rules: Vec<ChaosRule>,
    rng: Mutex<StdRng>,
}

impl ChaosInjector {
    /// An injector that never fires.
    pub fn disabled() -> Self {
        Self {
            rules: Vec::new(),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Compile the configured rules. `fallback_seed` is used when the chaos
    /// section has no seed of its own.
    pub fn from_config(config: &ChaosConfig, fallback_seed: Option<u64>) -> Result<Self, SchemaError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let mut definitions = config.rules.clone();
        if config.preset || definitions.is_empty() {
            definitions.extend(preset_rules());
        }
        let rules = definitions
            .iter()
            .map(ChaosRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let rng = match config.seed.or(fallback_seed) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            rules,
            rng: Mutex::new(rng),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Roll every applicable rule and keep the most severe effect.
    pub fn decide(&self, route: &Route, ctx: &RequestContext) -> ChaosDecision {
        let mut decision = ChaosDecision::None;
        let mut rng = self.rng.lock();
        for rule in self.rules.iter().filter(|r| r.applies(route, ctx)) {
            if !rng.gen_bool(rule.probability) {
                continue;
            }
            let candidate = match &rule.effect {
                ChaosEffectDefinition::Delay(delay) => {
                    ChaosDecision::Delay(Duration::from_millis(delay.sample(&mut *rng)))
                }
                ChaosEffectDefinition::Corrupt { mode } => ChaosDecision::Corrupt {
                    rule: rule.id.clone(),
                    mode: *mode,
                },
                ChaosEffectDefinition::Fail { status, message } => ChaosDecision::Fail {
                    rule: rule.id.clone(),
                    status: StatusCode::from_u16(*status)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    message: message
                        .clone()
                        .unwrap_or_else(|| format!("injected by chaos rule '{}'", rule.id)),
                },
            };
            if decision.yields_to(&candidate) {
                decision = candidate;
            }
        }
        decision
    }

    /// Mangle a response body.
    pub fn corrupt(&self, mode: CorruptionMode, body: &Bytes) -> Bytes {
        match mode {
            CorruptionMode::Empty => Bytes::new(),
            CorruptionMode::Truncate => body.slice(..body.len() / 2),
            CorruptionMode::MalformedJson => {
                let mut out = b"{\"data\": ".to_vec();
                out.extend_from_slice(&body[..body.len() / 2]);
                Bytes::from(out)
            }
            CorruptionMode::Garbage => {
                let mut rng = self.rng.lock();
                let len = body.len().max(16);
                let garbage: Vec<u8> = (0..len).map(|_| rng.gen_range(b'!'..=b'~')).collect();
                Bytes::from(garbage)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Operation;
    use crate::exchange::MockRequest;
    use crate::registry::PathPattern;

    fn rule(id: &str, path: &str, effect: ChaosEffectDefinition) -> ChaosRuleDefinition {
        ChaosRuleDefinition {
            id: id.to_string(),
            path: path.to_string(),
            methods: Vec::new(),
            probability: 1.0,
            effect,
        }
    }

    fn route() -> Route {
        Route::new(
            Method::GET,
            PathPattern::parse("/users/{id}").unwrap(),
            None,
            Operation::Get,
        )
    }

    fn ctx(method: Method, path: &str) -> RequestContext {
        RequestContext::new(MockRequest::new(method, path))
    }

    fn injector(rules: Vec<ChaosRuleDefinition>) -> ChaosInjector {
        let config = ChaosConfig {
            enabled: true,
            preset: false,
            seed: Some(7),
            rules,
        };
        ChaosInjector::from_config(&config, None).unwrap()
    }

    fn delay(ms: u64) -> ChaosEffectDefinition {
        ChaosEffectDefinition::Delay(DelayConfig {
            fixed_ms: ms,
            ..Default::default()
        })
    }

    #[test]
    fn test_fail_beats_delay() {
        let chaos = injector(vec![
            rule("slow", "**", delay(100)),
            rule(
                "boom",
                "/users/*",
                ChaosEffectDefinition::Fail {
                    status: 503,
                    message: None,
                },
            ),
        ]);
        match chaos.decide(&route(), &ctx(Method::GET, "/users/1")) {
            ChaosDecision::Fail { rule, status, .. } => {
                assert_eq!(rule, "boom");
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_first_fail_wins_and_longest_delay_wins() {
        let chaos = injector(vec![
            rule("first", "**", ChaosEffectDefinition::Fail { status: 500, message: None }),
            rule("second", "**", ChaosEffectDefinition::Fail { status: 502, message: None }),
        ]);
        assert!(matches!(
            chaos.decide(&route(), &ctx(Method::GET, "/users/1")),
            ChaosDecision::Fail { rule, .. } if rule == "first"
        ));

        let chaos = injector(vec![rule("a", "**", delay(10)), rule("b", "**", delay(50))]);
        assert_eq!(
            chaos.decide(&route(), &ctx(Method::GET, "/users/1")),
            ChaosDecision::Delay(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_corrupt_beats_delay() {
        let chaos = injector(vec![
            rule("slow", "**", delay(10)),
            rule("mangle", "**", ChaosEffectDefinition::Corrupt { mode: CorruptionMode::Empty }),
        ]);
        assert!(matches!(
            chaos.decide(&route(), &ctx(Method::GET, "/users/1")),
            ChaosDecision::Corrupt { mode: CorruptionMode::Empty, .. }
        ));
    }

    #[test]
    fn test_rule_scoping() {
        let mut writes = rule("writes", "/orders/**", ChaosEffectDefinition::Fail { status: 500, message: None });
        writes.methods = vec!["post".to_string()];
        let chaos = injector(vec![writes]);

        assert_eq!(chaos.decide(&route(), &ctx(Method::GET, "/users/1")), ChaosDecision::None);
        assert_eq!(chaos.decide(&route(), &ctx(Method::GET, "/orders/1")), ChaosDecision::None);
        assert!(matches!(
            chaos.decide(&route(), &ctx(Method::POST, "/orders/1/lines")),
            ChaosDecision::Fail { .. }
        ));
    }

    #[test]
    fn test_route_pattern_matches() {
        let chaos = injector(vec![rule("by-pattern", "/users/:id", delay(5))]);
        assert_eq!(
            chaos.decide(&route(), &ctx(Method::GET, "/users/42")),
            ChaosDecision::Delay(Duration::from_millis(5))
        );
    }

    #[test]
    fn test_zero_probability_never_fires() {
        let mut never = rule("never", "**", ChaosEffectDefinition::Fail { status: 500, message: None });
        never.probability = 0.0;
        let chaos = injector(vec![never]);
        for _ in 0..100 {
            assert_eq!(chaos.decide(&route(), &ctx(Method::GET, "/users/1")), ChaosDecision::None);
        }
    }

    #[test]
    fn test_non_finite_probability_rejected() {
        let mut broken = rule("broken", "**", delay(10));
        broken.probability = f64::NAN;
        let config = ChaosConfig {
            enabled: true,
            preset: false,
            seed: Some(7),
            rules: vec![broken],
        };
        assert!(ChaosInjector::from_config(&config, None).is_err());
    }

    #[test]
    fn test_disabled_and_preset() {
        let disabled = ChaosInjector::from_config(&ChaosConfig::default(), Some(1)).unwrap();
        assert!(!disabled.is_enabled());

        let preset = ChaosInjector::from_config(
            &ChaosConfig {
                enabled: true,
                ..Default::default()
            },
            Some(1),
        )
        .unwrap();
        assert_eq!(preset.rule_count(), 2);
    }

    #[test]
    fn test_corrupt_modes() {
        let chaos = ChaosInjector::disabled();
        let body = Bytes::from_static(br#"{"name":"Ada"}"#);
        assert_eq!(chaos.corrupt(CorruptionMode::Empty, &body), Bytes::new());
        assert_eq!(chaos.corrupt(CorruptionMode::Truncate, &body).len(), body.len() / 2);
        let malformed = chaos.corrupt(CorruptionMode::MalformedJson, &body);
        assert!(serde_json::from_slice::<serde_json::Value>(&malformed).is_err());
        let garbage = chaos.corrupt(CorruptionMode::Garbage, &body);
        assert_eq!(garbage.len(), 16);
        assert!(garbage.iter().all(|b| b.is_ascii_graphic()));
    }
}
