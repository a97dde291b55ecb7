use gpugate::admin::{AdminServer, PKG_NAME, VERSION};
use gpugate::config::Config;
use gpugate::container::{DockerControl, SharedProcessControl, Unavailable};
use gpugate::gateway::Gateway;
use gpugate::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gpugate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; the built-in deployment applies when the file is absent
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gpugate.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    if config_path.exists() {
        info!(path = %config_path.display(), "Configuration loaded");
    } else {
        info!(path = %config_path.display(), "No configuration file, using built-in backends");
    }

    print_startup_banner(&config);

    let process = connect_process_control(&config).await;
    let gateway = Gateway::new(&config, process)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(proxy_addr, Arc::clone(&gateway), shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Admin server is internal only (port 0 disables it)
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));
        let admin_server = AdminServer::new(admin_addr, Arc::clone(&gateway), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Spawn idle sweep
    let sweep_handle = tokio::spawn(
        Arc::clone(&gateway.lifecycle).run(config.server.sweep_interval(), shutdown_rx.clone()),
    );

    wait_for_shutdown_signal().await?;

    // Signal shutdown; backends are left in whatever state they are in
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
        let _ = sweep_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Connect to Docker when any backend names a container. Without a runtime
/// those backends can still be slept and woken, but never started or stopped.
async fn connect_process_control(config: &Config) -> SharedProcessControl {
    let containers: Vec<&str> = config
        .backends
        .values()
        .filter_map(|b| b.container.as_deref())
        .collect();

    if containers.is_empty() {
        return Arc::new(Unavailable);
    }

    match DockerControl::connect(config.server.docker_host.as_deref()).await {
        Ok(docker) => {
            info!(containers = ?containers, "Container control enabled");
            Arc::new(docker)
        }
        Err(e) => {
            warn!(error = %e, "Container runtime unavailable, start/stop disabled");
            Arc::new(Unavailable)
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting inference gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        retry_after_secs = config.server.retry_after_secs,
        sweep_interval_secs = config.server.sweep_interval().as_secs(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        sleep_after_secs = config.defaults.sleep_after_secs,
        stop_after_secs = config.defaults.stop_after_secs,
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        request_timeout_secs = config.defaults.request_timeout_secs,
        "Lifecycle defaults"
    );

    let mut names: Vec<&String> = config.backends.keys().collect();
    names.sort();
    for name in names {
        let backend = &config.backends[name];
        info!(
            backend = %name,
            url = %backend.url,
            paths = ?backend.paths,
            prefixes = ?backend.prefixes,
            sleep_api = backend.sleep_api,
            container = ?backend.container,
            "Configured backend"
        );
    }
}
