//! Connection pool for forwarding requests to backends
//!
//! Request and response bodies are streamed through untouched; nothing here
//! buffers a body, so token-by-token completions reach the client as the
//! backend produces them.

use crate::registry::Backend;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl PoolError {
    /// The backend could not be reached at all
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests handed to a backend
    pub total_requests: AtomicU64,
    /// Requests that failed before a response head arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP client shared by all backends
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `backend`, preserving method, query, headers and body.
    ///
    /// Resolves as soon as the backend's response head arrives; the returned
    /// body streams from the backend connection.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        backend: &Backend,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = upstream_uri(backend, req.uri())?;

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        // The client derives Host from the upstream URI
        parts.headers.remove(HOST);
        parts.uri = uri;
        parts.version = hyper::Version::HTTP_11;

        let backend_req = Request::from_parts(parts, body);

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Build the backend URI for a client request URI
fn upstream_uri(backend: &Backend, uri: &Uri) -> Result<Uri, PoolError> {
    let path = backend.upstream_path(uri.path());
    let target = match uri.query() {
        Some(query) => format!("{}{}?{}", backend.base_url, path, query),
        None => format!("{}{}", backend.base_url, path),
    };
    target
        .parse()
        .map_err(|e| PoolError::RequestBuild(format!("invalid upstream URI '{}': {}", target, e)))
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
