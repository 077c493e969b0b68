//! Upstream forwarding.

use crate::error::{EngineError, ProxyError};
use crate::exchange::{MockRequest, MockResponse, ResponseSource};
use async_trait::async_trait;
use hyper::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers that describe a single connection and are never relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn relayed(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    !HOP_BY_HOP.contains(&name.as_str()) && name != "content-length" && name != "host"
}

/// Where proxied requests go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    base_url: String,
    pub timeout: Duration,
}

impl UpstreamTarget {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(EngineError::Upstream(format!(
                "URL must start with http:// or https://, got: {}",
                base_url
            )));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upstream URL for a request (path and query are preserved).
    pub fn url_for(&self, request: &MockRequest) -> String {
        format!("{}{}", self.base_url, request.target())
    }
}

/// Relays a request to an upstream server.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        request: &MockRequest,
        target: &UpstreamTarget,
    ) -> Result<MockResponse, ProxyError>;
}

/// `reqwest`-backed forwarder.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| EngineError::Upstream(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        request: &MockRequest,
        target: &UpstreamTarget,
    ) -> Result<MockResponse, ProxyError> {
        let url = target.url_for(request);
        debug!(method = %request.method, url = %url, "Forwarding request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(target.timeout);
        for (name, value) in request.headers.iter().filter(|(n, _)| relayed(n)) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| transport_error(e, &url, target))?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| relayed(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, &url, target))?;

        let mut relayed_response = MockResponse::new(status, ResponseSource::Proxy).with_body(body);
        relayed_response.headers = headers;
        Ok(relayed_response)
    }
}

fn transport_error(err: reqwest::Error, url: &str, target: &UpstreamTarget) -> ProxyError {
    warn!(url = %url, error = %err, "Upstream request failed");
    if err.is_timeout() {
        ProxyError::UpstreamTimeout {
            target: target.base_url.clone(),
            timeout_ms: target.timeout.as_millis() as u64,
        }
    } else {
        ProxyError::UpstreamUnreachable {
            target: target.base_url.clone(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    #[test]
    fn test_target_validation() {
        assert!(UpstreamTarget::new("ftp://example.com", Duration::from_secs(1)).is_err());
        let target = UpstreamTarget::new("http://api.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(target.base_url(), "http://api.local");

        let request = MockRequest::new(Method::GET, "/users?limit=2");
        assert_eq!(target.url_for(&request), "http://api.local/users?limit=2");
    }

    #[test]
    fn test_hop_by_hop_headers_dropped() {
        assert!(!relayed("Connection"));
        assert!(!relayed("transfer-encoding"));
        assert!(!relayed("Content-Length"));
        assert!(!relayed("host"));
        assert!(relayed("content-type"));
        assert!(relayed("x-request-id"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        // Port 9 on localhost is reserved (discard) and normally closed.
        let target = UpstreamTarget::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let forwarder = HttpForwarder::new().unwrap();
        let err = forwarder
            .forward(&MockRequest::new(Method::GET, "/"), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnreachable { .. }));
    }
}
