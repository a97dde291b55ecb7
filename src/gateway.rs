//! Shared state built once at startup and handed to every server task

use crate::activity::ActivityTracker;
use crate::config::Config;
use crate::container::SharedProcessControl;
use crate::lifecycle::{ControllerSettings, LifecycleController};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

pub struct Gateway {
    pub registry: Arc<Registry>,
    pub activity: Arc<ActivityTracker>,
    pub lifecycle: Arc<LifecycleController>,
    pub pool: Arc<ConnectionPool>,
    /// Seconds advertised in `Retry-After` while a backend wakes
    pub retry_after_secs: u64,
}

impl Gateway {
    pub fn new(config: &Config, process: SharedProcessControl) -> anyhow::Result<Arc<Self>> {
        let registry = Arc::new(Registry::from_config(config)?);
        let activity = Arc::new(ActivityTracker::new(registry.names()));
        let lifecycle = LifecycleController::new(
            Arc::clone(&registry),
            Arc::clone(&activity),
            process,
            ControllerSettings::from_defaults(&config.defaults),
        )?;
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        }));

        Ok(Arc::new(Self {
            registry,
            activity,
            lifecycle,
            pool,
            retry_after_secs: config.server.retry_after_secs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Unavailable;

    #[test]
    fn test_gateway_from_builtin_config() {
        let gateway = Gateway::new(&Config::default(), Arc::new(Unavailable)).unwrap();

        assert_eq!(gateway.registry.len(), 3);
        assert_eq!(gateway.retry_after_secs, 2);
        assert!(gateway.activity.idle_duration("chat").is_none());
    }

    #[test]
    fn test_gateway_rejects_invalid_config() {
        let mut config = Config::default();
        config.backends.get_mut("chat").unwrap().url = "not a url".to_string();
        assert!(Gateway::new(&config, Arc::new(Unavailable)).is_err());
    }
}
