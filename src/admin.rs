use crate::gateway::Gateway;
use crate::lifecycle::{LifecycleError, LifecycleState};
use crate::registry::Backend;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Operator view of one backend
#[derive(Debug, Serialize)]
struct BackendStatus<'a> {
    name: &'a str,
    url: &'a str,
    state: LifecycleState,
    waking: bool,
    sleep_api: bool,
    container: Option<&'a str>,
    /// Seconds since the last served request, `None` if never used
    idle_secs: Option<u64>,
    sleep_after_secs: Option<u64>,
    stop_after_secs: Option<u64>,
}

/// Internal admin API for operators: inspection and manual lifecycle control.
/// Binds to loopback only.
pub struct AdminServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
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

    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, gateway).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let gateway = Arc::clone(&gateway);
        async move { handle_admin_request(req, gateway).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/backends") => list_backends(&gateway).await,

        (&Method::GET, "/stats") => {
            let stats = gateway.pool.stats();
            let body = serde_json::json!({
                "forwarded_requests": stats.get_total_requests(),
                "failed_requests": stats.get_failed_requests(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/sweep") => {
            let body = serde_json::json!({ "last_sweep": gateway.lifecycle.last_sweep() });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, "/sweep") => {
            let report = gateway.lifecycle.sweep().await;
            info!(
                slept = ?report.slept,
                stopped = ?report.stopped,
                skipped = report.skipped,
                "Manual sweep finished"
            );
            match serde_json::to_string(&report) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }

        // Lifecycle actions: POST /backends/{name}/{wake|sleep|stop}
        (&Method::POST, path) if path.starts_with("/backends/") => {
            match path.strip_prefix("/backends/").and_then(|rest| rest.split_once('/')) {
                Some((name, action)) => backend_action(&gateway, name, action).await,
                None => response(StatusCode::BAD_REQUEST, "expected /backends/{name}/{action}"),
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn list_backends(gateway: &Gateway) -> Response<Full<Bytes>> {
    let mut backends = Vec::with_capacity(gateway.registry.len());
    for backend in gateway.registry.iter() {
        backends.push(BackendStatus {
            name: &backend.name,
            url: &backend.base_url,
            state: gateway.lifecycle.state(backend).await,
            waking: gateway.lifecycle.is_waking(&backend.name),
            sleep_api: backend.sleep_api,
            container: backend.container.as_deref(),
            idle_secs: gateway.activity.idle_duration(&backend.name).map(|d| d.as_secs()),
            sleep_after_secs: backend.sleep_after.map(|d| d.as_secs()),
            stop_after_secs: backend.stop_after.map(|d| d.as_secs()),
        });
    }

    let body = serde_json::json!({
        "backends": backends,
        "count": backends.len(),
    });
    json_response(StatusCode::OK, body.to_string())
}

async fn backend_action(gateway: &Arc<Gateway>, name: &str, action: &str) -> Response<Full<Bytes>> {
    let Some(backend) = gateway.registry.get(name).cloned() else {
        return response(StatusCode::NOT_FOUND, "unknown backend");
    };

    match action {
        "wake" => {
            let dispatched = gateway.lifecycle.dispatch_wake(&backend);
            info!(backend = name, dispatched, "Wake requested via admin API");
            let body = serde_json::json!({ "backend": name, "dispatched": dispatched });
            json_response(StatusCode::ACCEPTED, body.to_string())
        }
        "sleep" => action_result(&backend, "sleep", gateway.lifecycle.sleep(&backend).await),
        "stop" => action_result(&backend, "stop", gateway.lifecycle.stop(&backend).await),
        _ => response(StatusCode::NOT_FOUND, "unknown action"),
    }
}

fn action_result(backend: &Backend, action: &str, result: Result<(), LifecycleError>) -> Response<Full<Bytes>> {
    match result {
        Ok(()) => {
            info!(backend = %backend.name, action, "Lifecycle action via admin API");
            let body = serde_json::json!({ "backend": backend.name, "action": action });
            json_response(StatusCode::OK, body.to_string())
        }
        Err(e @ LifecycleError::Unsupported { .. }) => response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => {
            warn!(backend = %backend.name, action, error = %e, "Lifecycle action failed");
            response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}
