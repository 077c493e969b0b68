//! HTTP front end: hyper connection handling around [`Engine::handle`].

use crate::engine::{error_response, Engine};
use crate::error::{ApiError, ServerError};
use crate::exchange::{MockRequest, MockResponse, ResponseSource};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Socket address; unparsable hosts fall back to all interfaces.
    pub fn socket_addr(&self) -> SocketAddr {
        let host: std::net::IpAddr = self.host.parse().unwrap_or([0, 0, 0, 0].into());
        SocketAddr::new(host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
        }
    }
}

/// Bind the listener.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr = config.socket_addr();
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, engine: Arc<Engine>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let local = listener.local_addr()?;
    info!(addr = %local, "Mock server listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, remote_addr) = result?;
                let io = TokioIo::new(stream);
                let engine = Arc::clone(&engine);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let engine = Arc::clone(&engine);
                        async move { Ok::<_, Infallible>(handle(req, engine).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        if !e.is_incomplete_message() {
                            warn!(remote = %remote_addr, error = %e, "HTTP connection error");
                        }
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Mock server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle(req: Request<Incoming>, engine: Arc<Engine>) -> Response<Full<Bytes>> {
    let limit = engine.settings().max_body_bytes;
    match to_mock_request(req, limit).await {
        Ok(request) => to_http_response(engine.handle(request).await),
        Err(err) => to_http_response(error_response(&err, ResponseSource::Error)),
    }
}

/// Convert a hyper request, collecting at most `limit` body bytes.
pub async fn to_mock_request<B>(req: Request<B>, limit: usize) -> Result<MockRequest, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();

    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        // Cookie pairs are `;`-separated; every other list header uses `,`.
        let separator = if *name == hyper::header::COOKIE { "; " } else { ", " };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(separator);
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|err| {
            if err.is::<http_body_util::LengthLimitError>() {
                ApiError::payload_too_large(limit)
            } else {
                debug!(error = %err, "Failed to read request body");
                ApiError::bad_request("Failed to read request body")
            }
        })?
        .to_bytes();

    Ok(MockRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        body,
    })
}

/// Convert an engine response into a hyper response.
pub fn to_http_response(response: MockResponse) -> Response<Full<Bytes>> {
    let mut http = Response::new(Full::new(response.body));
    *http.status_mut() = response.status;
    for (name, value) in response.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().append(name, value);
            }
            _ => debug!(header = %name, "Dropping invalid response header"),
        }
    }
    http
}
