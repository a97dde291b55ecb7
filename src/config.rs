use hyper::Uri;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for backends
    #[serde(default)]
    pub defaults: BackendDefaults,

    /// Inference backends keyed by their logical name
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for client traffic (default: 9000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API, bound to 127.0.0.1 (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Seconds a client is told to wait before retrying a waking backend
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,

    /// Interval between idle sweeps in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Docker host URL (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            retry_after_secs: default_retry_after(),
            sweep_interval_secs: default_sweep_interval(),
            docker_host: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendDefaults {
    /// Idle seconds before a backend with a sleep API is put to sleep (0 disables)
    #[serde(default = "default_sleep_after")]
    pub sleep_after_secs: u64,

    /// Idle seconds before a backend's container is stopped (0 disables)
    #[serde(default = "default_stop_after")]
    pub stop_after_secs: u64,

    /// Seconds to wait for a started container to report running
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between running checks while a container starts, in milliseconds
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,

    /// Max seconds to wait for a backend to answer a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for the `is_sleeping` probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Timeout for wake/sleep/reset control calls in seconds
    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            sleep_after_secs: default_sleep_after(),
            stop_after_secs: default_stop_after(),
            startup_timeout_secs: default_startup_timeout(),
            startup_poll_interval_ms: default_startup_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            control_timeout_secs: default_control_timeout(),
        }
    }
}

/// Configuration for a single inference backend
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:8002`
    pub url: String,

    /// Request paths owned by this backend (exact match)
    #[serde(default)]
    pub paths: Vec<String>,

    /// Path prefixes owned by this backend (`/chat` matches `/chat` and `/chat/...`)
    #[serde(default)]
    pub prefixes: Vec<String>,

    /// Remove the matched prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,

    /// Backend exposes `/is_sleeping`, `/sleep` and `/wake_up`
    #[serde(default)]
    pub sleep_api: bool,

    /// Container backing this backend, if the gateway may start and stop it
    pub container: Option<String>,

    /// Other backends to wake whenever this backend receives a request
    #[serde(default)]
    pub also_wake: Vec<String>,

    /// Call `/reset_prefix_cache` after every wake-up
    #[serde(default)]
    pub reset_cache_on_wake: bool,

    /// Idle sleep threshold in seconds (overrides default, 0 disables)
    pub sleep_after_secs: Option<u64>,

    /// Idle stop threshold in seconds (overrides default, 0 disables)
    pub stop_after_secs: Option<u64>,

    /// Startup timeout in seconds (overrides default)
    pub startup_timeout_secs: Option<u64>,

    /// Request timeout in seconds (overrides default)
    pub request_timeout_secs: Option<u64>,
}

impl BackendConfig {
    /// Create a pass-through backend with no lifecycle control
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            paths: Vec::new(),
            prefixes: Vec::new(),
            strip_prefix: false,
            sleep_api: false,
            container: None,
            also_wake: Vec::new(),
            reset_cache_on_wake: false,
            sleep_after_secs: None,
            stop_after_secs: None,
            startup_timeout_secs: None,
            request_timeout_secs: None,
        }
    }

    /// Set exact paths (builder pattern)
    pub fn with_paths(mut self, paths: &[&str]) -> Self {
        self.paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set path prefixes (builder pattern)
    pub fn with_prefixes(mut self, prefixes: &[&str]) -> Self {
        self.prefixes = prefixes.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Enable the software sleep API (builder pattern)
    pub fn with_sleep_api(mut self) -> Self {
        self.sleep_api = true;
        self
    }

    /// Attach a container for start/stop control (builder pattern)
    pub fn with_container(mut self, name: &str) -> Self {
        self.container = Some(name.to_string());
        self
    }

    pub fn sleep_after(&self, defaults: &BackendDefaults) -> Option<Duration> {
        if !self.sleep_api {
            return None;
        }
        match self.sleep_after_secs.unwrap_or(defaults.sleep_after_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn stop_after(&self, defaults: &BackendDefaults) -> Option<Duration> {
        self.container.as_ref()?;
        match self.stop_after_secs.unwrap_or(defaults.stop_after_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn startup_timeout(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.unwrap_or(defaults.startup_timeout_secs))
    }

    pub fn request_timeout(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
        )
    }

    /// Validate the backend configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        match self.url.parse::<Uri>() {
            Ok(uri) if uri.scheme_str() == Some("http") && uri.authority().is_some() => {}
            _ => {
                return Err(format!(
                    "Backend '{}': 'url' must be an http:// URL with a host, got '{}'",
                    name, self.url
                ));
            }
        }

        if self.paths.is_empty() && self.prefixes.is_empty() {
            return Err(format!(
                "Backend '{}': at least one entry in 'paths' or 'prefixes' is required",
                name
            ));
        }

        if let Some(route) = self
            .paths
            .iter()
            .chain(self.prefixes.iter())
            .find(|r| !r.starts_with('/'))
        {
            return Err(format!(
                "Backend '{}': route '{}' must start with '/'",
                name, route
            ));
        }

        if self.strip_prefix && self.prefixes.is_empty() {
            return Err(format!(
                "Backend '{}': 'strip_prefix' requires at least one prefix",
                name
            ));
        }

        if self.reset_cache_on_wake && !self.sleep_api {
            return Err(format!(
                "Backend '{}': 'reset_cache_on_wake' requires 'sleep_api'",
                name
            ));
        }

        if self.also_wake.iter().any(|other| other == name) {
            return Err(format!("Backend '{}': 'also_wake' cannot name itself", name));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    9000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9001
}

fn default_retry_after() -> u64 {
    2
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_sleep_after() -> u64 {
    300 // 5 minutes
}

fn default_stop_after() -> u64 {
    3600 // 1 hour
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_startup_poll_interval() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    1800 // long transcriptions
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_control_timeout() -> u64 {
    3
}

/// Environment variables read by [`Config::apply_env`]
pub const ENV_SLEEP_AFTER: &str = "INACTIVITY_SLEEP_SECONDS";
pub const ENV_STOP_AFTER: &str = "INACTIVITY_STOP_SECONDS";
pub const ENV_REQUEST_TIMEOUT: &str = "PROXY_TIMEOUT";
pub const ENV_SWEEP_INTERVAL: &str = "SWEEP_INTERVAL_SECONDS";
pub const ENV_PORT: &str = "GPUGATE_PORT";

impl Default for Config {
    /// The stock three-backend deployment: embeddings, chat and speech on one GPU
    fn default() -> Self {
        let mut backends = HashMap::new();

        backends.insert(
            "embedding".to_string(),
            BackendConfig::new("http://127.0.0.1:8001").with_paths(&["/v1/embeddings"]),
        );

        let mut chat = BackendConfig::new("http://127.0.0.1:8002")
            .with_paths(&["/v1/chat/completions", "/wake_up"])
            .with_sleep_api()
            .with_container("vllm-agent");
        chat.reset_cache_on_wake = true;
        backends.insert("chat".to_string(), chat);

        let mut speech = BackendConfig::new("http://127.0.0.1:8003")
            .with_paths(&["/transcribe", "/transcribe_url"])
            .with_container("faster-whisper");
        speech.also_wake = vec!["chat".to_string()];
        backends.insert("speech".to_string(), speech);

        Self {
            server: ServerConfig::default(),
            defaults: BackendDefaults::default(),
            backends,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to the built-in deployment,
    /// then apply environment overrides
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    ///
    /// Besides the global knobs, `GPUGATE_<NAME>_URL` replaces the URL of the
    /// backend `<name>` (upper-cased, `-` and `.` mapped to `_`).
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> anyhow::Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, value))
        }

        if let Some(v) = lookup(ENV_SLEEP_AFTER) {
            self.defaults.sleep_after_secs = parse(ENV_SLEEP_AFTER, v)?;
        }
        if let Some(v) = lookup(ENV_STOP_AFTER) {
            self.defaults.stop_after_secs = parse(ENV_STOP_AFTER, v)?;
        }
        if let Some(v) = lookup(ENV_REQUEST_TIMEOUT) {
            // Accepts fractional seconds, e.g. "1800.0"
            let secs: f64 = parse(ENV_REQUEST_TIMEOUT, v)?;
            self.defaults.request_timeout_secs = secs.ceil() as u64;
        }
        if let Some(v) = lookup(ENV_SWEEP_INTERVAL) {
            self.server.sweep_interval_secs = parse(ENV_SWEEP_INTERVAL, v)?;
        }
        if let Some(v) = lookup(ENV_PORT) {
            self.server.port = parse(ENV_PORT, v)?;
        }

        for (name, backend) in self.backends.iter_mut() {
            if let Some(url) = lookup(&backend_url_env(name)) {
                backend.url = url;
            }
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let mut claimed: HashMap<&str, &str> = HashMap::new();

        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();

        for name in names {
            let backend = &self.backends[name];
            if let Err(e) = backend.validate(name) {
                errors.push(e);
            }

            for other in &backend.also_wake {
                if !self.backends.contains_key(other) {
                    errors.push(format!(
                        "Backend '{}': 'also_wake' names unknown backend '{}'",
                        name, other
                    ));
                }
            }

            let mut seen = HashSet::new();
            for route in backend.paths.iter().chain(backend.prefixes.iter()) {
                if !seen.insert(route.as_str()) {
                    continue;
                }
                if let Some(owner) = claimed.insert(route.as_str(), name.as_str()) {
                    errors.push(format!(
                        "Route '{}' is claimed by both '{}' and '{}'",
                        route, owner, name
                    ));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Environment variable that overrides a backend's URL
pub fn backend_url_env(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("GPUGATE_{}_URL", normalized)
}
