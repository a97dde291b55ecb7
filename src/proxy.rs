use crate::error::{json_error_response, waking_response, ProxyErrorCode};
use crate::gateway::Gateway;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Methods the gateway forwards
fn is_forwarded_method(method: &Method) -> bool {
    [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::HEAD,
        Method::PATCH,
    ]
    .contains(method)
}

/// Client-facing router: resolves the backend, wakes it if needed, forwards
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, backends = self.gateway.registry.len(), "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if !is_forwarded_method(req.method()) {
        return Ok(json_error_response(
            ProxyErrorCode::MethodNotAllowed,
            format!("Method {} is not supported", req.method()),
        ));
    }

    let path = req.uri().path().to_string();
    let backend = match gateway.registry.resolve(&path) {
        Some(backend) => Arc::clone(backend),
        None => {
            debug!(path, request_id, "No backend owns path");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownRoute,
                format!("No backend serves '{}'", path),
            ));
        }
    };

    debug!(backend = %backend.name, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    // Traffic here predicts traffic there
    for other in &backend.also_wake {
        gateway.lifecycle.wake_if_needed(other);
    }

    if backend.is_managed() && !gateway.lifecycle.is_ready(&backend).await {
        let dispatched = gateway.lifecycle.dispatch_wake(&backend);
        info!(backend = %backend.name, dispatched, request_id, "Backend not ready, asking client to retry");
        return Ok(waking_response(&backend.name, gateway.retry_after_secs));
    }

    // Security: We overwrite X-Forwarded-* headers rather than appending to prevent
    // client spoofing. The gateway is assumed to be the first trusted hop.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let request_timeout = backend.request_timeout;
    let result = tokio::time::timeout(request_timeout, gateway.pool.forward(req, &backend)).await;

    match result {
        Ok(Ok(response)) => {
            // Only a backend that actually answered counts as active
            gateway.activity.record_activity(&backend.name);
            debug!(backend = %backend.name, status = %response.status(), request_id, "Forwarded request");
            Ok(response)
        }
        Ok(Err(e)) if e.is_connect() => {
            warn!(backend = %backend.name, url = %backend.base_url, error = %e, request_id, "Backend unreachable");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Backend '{}' is unreachable", backend.name),
            ))
        }
        Ok(Err(e)) => {
            error!(backend = %backend.name, error = %e, request_id, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::InternalError,
                format!("proxy error: {}", e),
            ))
        }
        Err(_) => {
            warn!(
                backend = %backend.name,
                timeout_secs = request_timeout.as_secs(),
                request_id,
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Backend '{}' did not answer within {} seconds",
                    backend.name,
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_methods() {
        assert!(is_forwarded_method(&Method::GET));
        assert!(is_forwarded_method(&Method::POST));
        assert!(is_forwarded_method(&Method::PATCH));
        assert!(!is_forwarded_method(&Method::TRACE));
        assert!(!is_forwarded_method(&Method::CONNECT));
        assert!(!is_forwarded_method(&Method::from_bytes(b"PROPFIND").unwrap()));
    }
}
