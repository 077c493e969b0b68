//! portblock: a stateful mock API engine.
//!
//! Schemas declared in a YAML or JSON document become live, in-memory CRUD
//! collections. Requests are resolved against generated and explicit
//! routes, validated, applied to the store and answered with realistic fake
//! data. Chaos rules, upstream forwarding and recorded-interaction replay
//! plug into the same pipeline.
//!
//! # Features
//!
//! - **Resource Store**: per-collection locks, revisions, `ETag`/`If-Match`,
//!   reference checks, filtering, sorting and paging
//! - **Fake Data**: schema-driven values honoring formats, patterns and bounds,
//!   reproducible under a seed
//! - **Validation**: strict or lenient, one violation per failed constraint
//! - **Chaos**: probabilistic delays, failures and body corruption
//! - **Proxy and Replay**: forward to a real API, record, and play back
//! - **Negotiation**: JSON or XML via `Accept`, status variants via `Prefer`
//!
//! # Example Configuration
//!
//! ```yaml
//! schemas:
//!   - name: User
//!     path: /users
//!     initial_records: 5
//!     fields:
//!       name: string
//!       email:
//!         type: string
//!         format: email
//!         required: true
//! ```

pub mod auth;
pub mod chaos;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod generator;
pub mod negotiate;
pub mod pattern;
pub mod proxy;
pub mod registry;
pub mod replay;
pub mod schema;
pub mod server;
pub mod store;
pub mod template;
pub mod validator;

pub use config::MockConfig;
pub use engine::{Engine, EngineBuilder, EngineStats};
pub use error::{ApiError, EngineError};
pub use exchange::{MockRequest, MockResponse};
