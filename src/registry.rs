//! Static registry of inference backends and the request paths they own

use crate::config::Config;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// An inference backend, immutable once the registry is built
#[derive(Debug, Clone)]
pub struct Backend {
    /// Logical name, e.g. `chat`
    pub name: String,
    /// Base URL without trailing slash, e.g. `http://127.0.0.1:8002`
    pub base_url: String,
    /// Exact paths owned by this backend
    pub paths: Vec<String>,
    /// Path prefixes owned by this backend
    pub prefixes: Vec<String>,
    /// Remove the matched prefix before forwarding
    pub strip_prefix: bool,
    /// Backend exposes the software sleep API
    pub sleep_api: bool,
    /// Container the gateway may start and stop
    pub container: Option<String>,
    pub sleep_after: Option<Duration>,
    pub stop_after: Option<Duration>,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
    /// Backends woken alongside this one
    pub also_wake: Vec<String>,
    pub reset_cache_on_wake: bool,
}

impl Backend {
    /// Whether the gateway has any way to change this backend's state
    pub fn is_managed(&self) -> bool {
        self.sleep_api || self.container.is_some()
    }

    /// URL of one of the backend's own endpoints
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// The path sent upstream for a client path routed to this backend
    pub fn upstream_path<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        if !self.strip_prefix || self.paths.iter().any(|p| p == path) {
            return path.into();
        }

        let matched = self
            .prefixes
            .iter()
            .filter(|prefix| prefix_matches(prefix, path))
            .max_by_key(|prefix| prefix.len());

        match matched {
            Some(prefix) => {
                let rest = &path[prefix.trim_end_matches('/').len()..];
                if rest.is_empty() {
                    "/".into()
                } else {
                    rest.into()
                }
            }
            None => path.into(),
        }
    }
}

/// `/chat` matches `/chat` and `/chat/...` but not `/chatter`
fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Maps request paths to backends
#[derive(Debug)]
pub struct Registry {
    backends: Vec<Arc<Backend>>,
    by_name: HashMap<String, usize>,
    exact: HashMap<String, usize>,
    /// Sorted longest first so the first hit is the most specific one
    prefixes: Vec<(String, usize)>,
}

impl Registry {
    /// Build the registry from validated configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;

        let mut names: Vec<&String> = config.backends.keys().collect();
        names.sort();

        let mut backends = Vec::with_capacity(names.len());
        for name in names {
            let cfg = &config.backends[name];
            let defaults = &config.defaults;
            backends.push(Backend {
                name: name.clone(),
                base_url: cfg.url.trim_end_matches('/').to_string(),
                paths: cfg.paths.clone(),
                prefixes: cfg.prefixes.clone(),
                strip_prefix: cfg.strip_prefix,
                sleep_api: cfg.sleep_api,
                container: cfg.container.clone(),
                sleep_after: cfg.sleep_after(defaults),
                stop_after: cfg.stop_after(defaults),
                startup_timeout: cfg.startup_timeout(defaults),
                request_timeout: cfg.request_timeout(defaults),
                also_wake: cfg.also_wake.clone(),
                reset_cache_on_wake: cfg.reset_cache_on_wake,
            });
        }

        Ok(Self::new(backends))
    }

    /// Build the registry from already-resolved backends
    pub fn new(backends: Vec<Backend>) -> Self {
        let backends: Vec<Arc<Backend>> = backends.into_iter().map(Arc::new).collect();
        let mut by_name = HashMap::new();
        let mut exact = HashMap::new();
        let mut prefixes = Vec::new();

        for (idx, backend) in backends.iter().enumerate() {
            by_name.insert(backend.name.clone(), idx);
            for path in &backend.paths {
                exact.entry(path.clone()).or_insert(idx);
            }
            for prefix in &backend.prefixes {
                prefixes.push((prefix.clone(), idx));
            }
        }
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            backends,
            by_name,
            exact,
            prefixes,
        }
    }

    /// Find the backend owning `path`: exact paths first, then the longest prefix
    pub fn resolve(&self, path: &str) -> Option<&Arc<Backend>> {
        if let Some(&idx) = self.exact.get(path) {
            return Some(&self.backends[idx]);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, idx)| &self.backends[*idx])
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Backend>> {
        self.by_name.get(name).map(|&idx| &self.backends[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Backends in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn create_test_registry() -> Registry {
        let mut config = Config::default();
        let mut tools = BackendConfig::new("http://127.0.0.1:9100/").with_prefixes(&["/tools"]);
        tools.strip_prefix = true;
        config.backends.insert("tools".to_string(), tools);
        config.backends.insert(
            "tools-admin".to_string(),
            BackendConfig::new("http://127.0.0.1:9200").with_prefixes(&["/tools/admin"]),
        );
        Registry::from_config(&config).unwrap()
    }

    #[test]
    fn test_resolve_exact_paths() {
        let registry = create_test_registry();

        assert_eq!(registry.resolve("/v1/chat/completions").unwrap().name, "chat");
        assert_eq!(registry.resolve("/wake_up").unwrap().name, "chat");
        assert_eq!(registry.resolve("/v1/embeddings").unwrap().name, "embedding");
        assert_eq!(registry.resolve("/transcribe_url").unwrap().name, "speech");
    }

    #[test]
    fn test_exact_paths_do_not_match_children() {
        let registry = create_test_registry();

        assert!(registry.resolve("/v1/chat/completions/extra").is_none());
        assert!(registry.resolve("/").is_none());
        assert!(registry.resolve("/docs").is_none());
    }

    #[test]
    fn test_resolve_longest_prefix() {
        let registry = create_test_registry();

        assert_eq!(registry.resolve("/tools").unwrap().name, "tools");
        assert_eq!(registry.resolve("/tools/run_tool").unwrap().name, "tools");
        assert_eq!(registry.resolve("/tools/admin/reload").unwrap().name, "tools-admin");
        assert!(registry.resolve("/toolshed").is_none());
    }

    #[test]
    fn test_upstream_path() {
        let registry = create_test_registry();

        let tools = registry.get("tools").unwrap();
        assert_eq!(tools.upstream_path("/tools/get_tools"), "/get_tools");
        assert_eq!(tools.upstream_path("/tools"), "/");

        let chat = registry.get("chat").unwrap();
        assert_eq!(chat.upstream_path("/v1/chat/completions"), "/v1/chat/completions");
    }

    #[test]
    fn test_backend_attributes_resolved_from_defaults() {
        let registry = create_test_registry();

        let chat = registry.get("chat").unwrap();
        assert_eq!(chat.sleep_after, Some(Duration::from_secs(300)));
        assert_eq!(chat.stop_after, Some(Duration::from_secs(3600)));
        assert!(chat.reset_cache_on_wake);
        assert!(chat.is_managed());

        let speech = registry.get("speech").unwrap();
        assert_eq!(speech.sleep_after, None);
        assert_eq!(speech.also_wake, vec!["chat"]);

        let tools = registry.get("tools").unwrap();
        assert_eq!(tools.base_url, "http://127.0.0.1:9100");
        assert_eq!(tools.endpoint("/is_sleeping"), "http://127.0.0.1:9100/is_sleeping");
        assert!(!tools.is_managed());
    }

    #[test]
    fn test_names_sorted() {
        let registry = create_test_registry();
        assert_eq!(
            registry.names(),
            vec!["chat", "embedding", "speech", "tools", "tools-admin"]
        );
        assert_eq!(registry.len(), 5);
        assert!(registry.contains("speech"));
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = Config::default();
        config.backends.get_mut("speech").unwrap().also_wake = vec!["ghost".to_string()];
        assert!(Registry::from_config(&config).is_err());
    }
}
