//! Start/stop/inspect capability for backends that run in containers

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, StartContainerOptions, StopContainerOptions};
use bollard::Docker;
use std::sync::Arc;
use tracing::{debug, info};

/// Errors from the container runtime
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("cannot connect to container runtime: {0}")]
    Connect(String),
    #[error("container '{name}' not found")]
    NotFound { name: String },
    #[error("container runtime error for '{name}': {message}")]
    Runtime { name: String, message: String },
}

/// Opaque process control used for backends without (or in addition to) a sleep API.
///
/// All calls are best-effort and return as soon as the runtime has accepted
/// the command; callers poll [`ProcessControl::is_running`] for progress.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn is_running(&self, name: &str) -> Result<bool, ContainerError>;
    async fn start(&self, name: &str) -> Result<(), ContainerError>;
    async fn stop(&self, name: &str) -> Result<(), ContainerError>;
}

pub type SharedProcessControl = Arc<dyn ProcessControl>;

/// Grace period passed to `docker stop` before the runtime kills the container
const STOP_GRACE_SECS: i64 = 10;

/// Docker-backed process control for pre-created containers
pub struct DockerControl {
    client: Docker,
}

impl DockerControl {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Platform default socket
    pub async fn connect(docker_host: Option<&str>) -> Result<Self, ContainerError> {
        let client = match docker_host
            .map(String::from)
            .or_else(|| std::env::var("DOCKER_HOST").ok())
        {
            Some(host) => Self::connect_to_host(&host)?,
            None => Docker::connect_with_socket_defaults()
                .map_err(|e| ContainerError::Connect(e.to_string()))?,
        };

        client.ping().await.map_err(|e| {
            ContainerError::Connect(format!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            ))
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> Result<Docker, ContainerError> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(
                |e| ContainerError::Connect(format!("Unix socket '{}': {}", socket_path, e)),
            )
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ContainerError::Connect(format!("TCP endpoint '{}': {}", host, e)))
        } else {
            Err(ContainerError::Connect(format!(
                "invalid docker_host '{}', expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    fn runtime_error(name: &str, err: bollard::errors::Error) -> ContainerError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => ContainerError::NotFound {
                name: name.to_string(),
            },
            e => ContainerError::Runtime {
                name: name.to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl ProcessControl for DockerControl {
    async fn is_running(&self, name: &str) -> Result<bool, ContainerError> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) => Err(Self::runtime_error(name, e)),
        }
    }

    async fn start(&self, name: &str) -> Result<(), ContainerError> {
        match self
            .client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(container = name, "Started container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = name, "Container was already running");
                Ok(())
            }
            Err(e) => Err(Self::runtime_error(name, e)),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.client.stop_container(name, Some(options)).await {
            Ok(()) => {
                info!(container = name, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = name, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(Self::runtime_error(name, e)),
        }
    }
}

/// Process control for deployments without a container runtime; every
/// container is reported as not found
pub struct Unavailable;

#[async_trait]
impl ProcessControl for Unavailable {
    async fn is_running(&self, name: &str) -> Result<bool, ContainerError> {
        Err(ContainerError::NotFound {
            name: name.to_string(),
        })
    }

    async fn start(&self, name: &str) -> Result<(), ContainerError> {
        Err(ContainerError::NotFound {
            name: name.to_string(),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        Err(ContainerError::NotFound {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_docker_host() {
        let err = DockerControl::connect_to_host("ftp://example").unwrap_err();
        assert!(err.to_string().contains("invalid docker_host"));
    }

    #[test]
    fn test_not_found_mapping() {
        let err = DockerControl::runtime_error(
            "vllm-agent",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(matches!(err, ContainerError::NotFound { ref name } if name == "vllm-agent"));
    }

    #[tokio::test]
    async fn test_unavailable_reports_not_found() {
        let control = Unavailable;
        assert!(control.is_running("faster-whisper").await.is_err());
        assert!(control.start("faster-whisper").await.is_err());
        assert!(control.stop("faster-whisper").await.is_err());
    }
}
