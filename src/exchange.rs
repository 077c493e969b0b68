//! Transport-independent request and response values.
//!
//! The engine works on these instead of hyper types so it can be driven
//! directly from tests; `server.rs` converts at the edge.

use crate::config::Operation;
use crate::registry::Route;
use crate::validator::Verdict;
use bytes::Bytes;
use hyper::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;

/// An inbound request.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: Method,
    /// Path without the query string.
    pub path: String,
    /// Raw query string (without `?`).
    pub query: Option<String>,
    /// Headers with lowercased names.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl MockRequest {
    /// Build a request from a method and a request target (`/path?query`).
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach a JSON body and its content type.
    pub fn with_json(self, body: &serde_json::Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(body.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Decoded query parameters in order of appearance.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(parse_query_string)
            .unwrap_or_default()
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Value of a cookie from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    /// Path plus query string, as sent on the wire.
    pub fn target(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Which stage of the pipeline produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Store,
    Custom,
    Variant,
    Replay,
    Proxy,
    Chaos,
    Default,
    Error,
    Preflight,
}

/// An outbound response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl MockResponse {
    pub fn new(status: StatusCode, source: ResponseSource) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            source,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a header, replacing any existing value (case-insensitive).
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Resolved,
    Replayed,
    Validated,
    Rejected,
    Stored,
    Chaosed,
    Proxied,
    Composed,
    Sent,
}

/// Per-request state carried through the pipeline.
#[derive(Debug)]
pub struct RequestContext {
    pub request: MockRequest,
    pub route: Option<Arc<Route>>,
    pub params: HashMap<String, String>,
    pub verdict: Option<Verdict>,
    pub stage: Stage,
}

impl RequestContext {
    pub fn new(request: MockRequest) -> Self {
        Self {
            request,
            route: None,
            params: HashMap::new(),
            verdict: None,
            stage: Stage::Received,
        }
    }

    pub fn advance(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn operation(&self) -> Option<Operation> {
        self.route.as_ref().map(|r| r.operation)
    }
}

/// Split a query string into decoded pairs.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key, true), percent_decode(value, true)),
            None => (percent_decode(part, true), String::new()),
        })
        .collect()
}

/// Percent-decode a string; `plus_as_space` applies form encoding rules.
pub fn percent_decode(s: &str, plus_as_space: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b'+' if plus_as_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_splits_query() {
        let request = MockRequest::new(Method::GET, "/users?limit=10&name=Ada%20L");
        assert_eq!(request.path, "/users");
        assert_eq!(request.query_param("limit").as_deref(), Some("10"));
        assert_eq!(request.query_param("name").as_deref(), Some("Ada L"));
        assert_eq!(request.target(), "/users?limit=10&name=Ada%20L");
    }

    #[test]
    fn test_parse_query_string() {
        let pairs = parse_query_string("a=1&b=hello+world&flag&&c=%3D");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "hello world".to_string()),
                ("flag".to_string(), String::new()),
                ("c".to_string(), "=".to_string()),
            ]
        );
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("caf%C3%A9", false), "café");
        assert_eq!(percent_decode("a+b", false), "a+b");
        assert_eq!(percent_decode("100%", false), "100%");
        assert_eq!(percent_decode("%zz", false), "%zz");
    }

    #[test]
    fn test_headers_case_insensitive() {
        let request = MockRequest::new(Method::GET, "/").with_header("X-Trace", "1");
        assert_eq!(request.header("x-trace"), Some("1"));
        assert_eq!(request.header("X-TRACE"), Some("1"));

        let mut response = MockResponse::new(StatusCode::OK, ResponseSource::Store)
            .with_header("Content-Type", "text/plain");
        response.set_header("content-type", "application/json");
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.header("CONTENT-TYPE"), Some("application/json"));
    }
}
