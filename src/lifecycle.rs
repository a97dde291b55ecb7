//! Backend lifecycle: readiness probes, wake-up, and the idle sweep
//!
//! Lifecycle state is never cached. Every decision probes the backend's
//! `/is_sleeping` endpoint or asks the container runtime, because backends can
//! be restarted or killed behind the gateway's back.

use crate::activity::ActivityTracker;
use crate::config::BackendDefaults;
use crate::container::{ContainerError, SharedProcessControl};
use crate::registry::{Backend, Registry};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const IS_SLEEPING_PATH: &str = "/is_sleeping";
const WAKE_UP_PATH: &str = "/wake_up";
const SLEEP_PATH: &str = "/sleep";
const RESET_PREFIX_CACHE_PATH: &str = "/reset_prefix_cache";
/// Upper bound on a startup wait, whatever the configured timeout
const MAX_STARTUP_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Observable state of a backend, derived on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Container is not running
    Stopped,
    /// A wake is in progress, or the process runs but does not answer yet
    Starting,
    /// Process is resident with accelerator memory released
    Asleep,
    /// Ready to serve traffic
    Awake,
}

/// What a successful wake attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeOutcome {
    /// The container was started and reported running
    Started,
    /// `/wake_up` was accepted; the backend finishes waking on its own
    WakeRequested,
    /// Nothing to do: running process-only backend or pass-through backend
    AlreadyAwake,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Fatal: startup timeout, backend '{backend}' not running after {}s", .timeout.as_secs())]
    StartupTimeout { backend: String, timeout: Duration },

    #[error("{op} call to backend '{backend}' failed: {source}")]
    Control {
        backend: String,
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op} call to backend '{backend}' returned HTTP {status}")]
    UnexpectedStatus {
        backend: String,
        op: &'static str,
        status: u16,
    },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("backend '{backend}' has no {capability}")]
    Unsupported {
        backend: String,
        capability: &'static str,
    },
}

/// Body of `GET /is_sleeping`
#[derive(Debug, Deserialize)]
struct SleepStatus {
    is_sleeping: bool,
}

/// One failed step of a sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub backend: String,
    pub action: &'static str,
    pub error: String,
}

/// What one sweep did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Backends sent to sleep
    pub slept: Vec<String>,
    /// Backends whose container was stopped
    pub stopped: Vec<String>,
    pub failed: Vec<SweepFailure>,
    /// Another sweep was still running, so this one did nothing
    pub skipped: bool,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Timeouts used for control-plane calls
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub probe_timeout: Duration,
    pub control_timeout: Duration,
    pub startup_poll_interval: Duration,
}

impl ControllerSettings {
    pub fn from_defaults(defaults: &BackendDefaults) -> Self {
        Self {
            probe_timeout: Duration::from_millis(defaults.probe_timeout_ms),
            control_timeout: Duration::from_secs(defaults.control_timeout_secs),
            startup_poll_interval: Duration::from_millis(defaults.startup_poll_interval_ms.max(10)),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_defaults(&BackendDefaults::default())
    }
}

/// Drives backends between stopped, asleep and awake.
///
/// Created behind an `Arc` because wake dispatch spawns tasks that hold a
/// reference to the controller.
pub struct LifecycleController {
    registry: Arc<Registry>,
    activity: Arc<ActivityTracker>,
    process: SharedProcessControl,
    http: reqwest::Client,
    settings: ControllerSettings,
    /// Backends with a wake task in flight, with the time it was dispatched
    wakes: DashMap<String, Instant>,
    sweep_lock: tokio::sync::Mutex<()>,
    last_sweep: RwLock<Option<SweepReport>>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<Registry>,
        activity: Arc<ActivityTracker>,
        process: SharedProcessControl,
        settings: ControllerSettings,
    ) -> anyhow::Result<Arc<Self>> {
        // Backends live on the local network; never route control calls through a proxy
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Arc::new(Self {
            registry,
            activity,
            process,
            http,
            settings,
            wakes: DashMap::new(),
            sweep_lock: tokio::sync::Mutex::new(()),
            last_sweep: RwLock::new(None),
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether a wake task is currently running for `name`
    pub fn is_waking(&self, name: &str) -> bool {
        self.wakes.contains_key(name)
    }

    /// The report of the most recent completed sweep
    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep.read().clone()
    }

    /// Ask a sleep-API backend whether it is sleeping
    async fn probe_sleeping(&self, backend: &Backend) -> Result<bool, LifecycleError> {
        let op = "is_sleeping";
        let response = self
            .http
            .get(backend.endpoint(IS_SLEEPING_PATH))
            .timeout(self.settings.probe_timeout)
            .send()
            .await
            .map_err(|source| LifecycleError::Control {
                backend: backend.name.clone(),
                op,
                source,
            })?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(LifecycleError::UnexpectedStatus {
                backend: backend.name.clone(),
                op,
                status: response.status().as_u16(),
            });
        }

        let status: SleepStatus =
            response
                .json()
                .await
                .map_err(|source| LifecycleError::Control {
                    backend: backend.name.clone(),
                    op,
                    source,
                })?;
        Ok(status.is_sleeping)
    }

    async fn control_post(
        &self,
        backend: &Backend,
        op: &'static str,
        path: &str,
    ) -> Result<(), LifecycleError> {
        let response = self
            .http
            .post(backend.endpoint(path))
            .timeout(self.settings.control_timeout)
            .send()
            .await
            .map_err(|source| LifecycleError::Control {
                backend: backend.name.clone(),
                op,
                source,
            })?;

        if !response.status().is_success() {
            return Err(LifecycleError::UnexpectedStatus {
                backend: backend.name.clone(),
                op,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Whether `backend` can take traffic right now.
    ///
    /// Any probe failure counts as not ready, so errors lead to a wake rather
    /// than to forwarding into a dead backend.
    pub async fn is_ready(&self, backend: &Backend) -> bool {
        if backend.sleep_api {
            return match self.probe_sleeping(backend).await {
                Ok(sleeping) => !sleeping,
                Err(e) => {
                    debug!(backend = %backend.name, error = %e, "Readiness probe failed");
                    false
                }
            };
        }

        if let Some(ref container) = backend.container {
            return match self.process.is_running(container).await {
                Ok(running) => running,
                Err(e) => {
                    debug!(backend = %backend.name, container, error = %e, "Running check failed");
                    false
                }
            };
        }

        true
    }

    /// Derive the current lifecycle state by probing
    pub async fn state(&self, backend: &Backend) -> LifecycleState {
        let waking = self.is_waking(&backend.name);

        if let Some(ref container) = backend.container {
            match self.process.is_running(container).await {
                Ok(true) => {}
                Ok(false) | Err(_) if waking => return LifecycleState::Starting,
                Ok(false) => return LifecycleState::Stopped,
                Err(_) if !backend.sleep_api => return LifecycleState::Stopped,
                Err(_) => {}
            }
        }

        if !backend.sleep_api {
            return LifecycleState::Awake;
        }

        match self.probe_sleeping(backend).await {
            Ok(false) => LifecycleState::Awake,
            Ok(true) if waking => LifecycleState::Starting,
            Ok(true) => LifecycleState::Asleep,
            Err(_) if waking || backend.container.is_some() => LifecycleState::Starting,
            Err(_) => LifecycleState::Stopped,
        }
    }

    /// Bring `backend` up: start its container if it is not running, otherwise
    /// ask a sleeping backend to wake.
    ///
    /// Blocks until a started container reports running (bounded by the
    /// backend's startup timeout) but never waits for `/wake_up` to finish
    /// loading weights.
    pub async fn ensure_awake(&self, backend: &Backend) -> Result<WakeOutcome, LifecycleError> {
        if let Some(ref container) = backend.container {
            let running = match self.process.is_running(container).await {
                Ok(running) => running,
                // The sleep API still reaches the process without a runtime
                Err(e) if backend.sleep_api => {
                    debug!(backend = %backend.name, container, error = %e, "Running check failed, trying wake-up");
                    true
                }
                Err(e) => return Err(e.into()),
            };
            if !running {
                info!(backend = %backend.name, container, "Starting backend container");
                self.process.start(container).await?;
                self.wait_until_running(backend, container).await?;
                // A fresh process boots awake with an empty cache
                return Ok(WakeOutcome::Started);
            }
        }

        if !backend.sleep_api {
            return Ok(WakeOutcome::AlreadyAwake);
        }

        self.control_post(backend, "wake_up", WAKE_UP_PATH).await?;
        info!(backend = %backend.name, "Wake-up requested");

        if backend.reset_cache_on_wake {
            if let Err(e) = self.reset_prefix_cache(backend).await {
                warn!(backend = %backend.name, error = %e, "Prefix cache reset failed");
            }
        }

        Ok(WakeOutcome::WakeRequested)
    }

    async fn wait_until_running(&self, backend: &Backend, container: &str) -> Result<(), LifecycleError> {
        let started = Instant::now();
        let deadline = started
            .checked_add(backend.startup_timeout)
            .unwrap_or_else(|| started + MAX_STARTUP_WAIT);

        loop {
            match self.process.is_running(container).await {
                Ok(true) => {
                    info!(backend = %backend.name, container, "Backend container is running");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => debug!(backend = %backend.name, error = %e, "Running check failed while starting"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::StartupTimeout {
                    backend: backend.name.clone(),
                    timeout: backend.startup_timeout,
                });
            }
            tokio::time::sleep(self.settings.startup_poll_interval.min(deadline - now)).await;
        }
    }

    /// Start a wake in the background unless one is already running for this
    /// backend. Returns whether a new wake task was spawned.
    pub fn dispatch_wake(self: &Arc<Self>, backend: &Arc<Backend>) -> bool {
        match self.wakes.entry(backend.name.clone()) {
            Entry::Occupied(_) => {
                debug!(backend = %backend.name, "Wake already in progress");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
            }
        }

        let guard = WakeGuard {
            controller: Arc::clone(self),
            name: backend.name.clone(),
        };
        let backend = Arc::clone(backend);

        tokio::spawn(async move {
            let started = Instant::now();
            match guard.controller.ensure_awake(&backend).await {
                Ok(outcome) => {
                    info!(
                        backend = %backend.name,
                        ?outcome,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Wake completed"
                    );
                }
                Err(e) => {
                    error!(backend = %backend.name, error = %e, "Wake failed");
                }
            }
            drop(guard);
        });

        true
    }

    /// Wake `name` in the background if it is not ready. Used for couplings
    /// where traffic to one backend predicts traffic to another.
    pub fn wake_if_needed(self: &Arc<Self>, name: &str) {
        let Some(backend) = self.registry.get(name).cloned() else {
            warn!(backend = name, "Coupled wake for unknown backend");
            return;
        };
        if !backend.is_managed() || self.is_waking(name) {
            return;
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if !controller.is_ready(&backend).await {
                debug!(backend = %backend.name, "Coupled backend not ready, waking");
                controller.dispatch_wake(&backend);
            }
        });
    }

    /// Release accelerator memory while keeping the process alive
    pub async fn sleep(&self, backend: &Backend) -> Result<(), LifecycleError> {
        if !backend.sleep_api {
            return Err(LifecycleError::Unsupported {
                backend: backend.name.clone(),
                capability: "sleep API",
            });
        }
        self.control_post(backend, "sleep", SLEEP_PATH).await?;
        info!(backend = %backend.name, "Backend put to sleep");
        Ok(())
    }

    /// Stop the backend's container
    pub async fn stop(&self, backend: &Backend) -> Result<(), LifecycleError> {
        let container = backend
            .container
            .as_deref()
            .ok_or_else(|| LifecycleError::Unsupported {
                backend: backend.name.clone(),
                capability: "container",
            })?;
        self.process.stop(container).await?;
        info!(backend = %backend.name, container, "Backend container stopped");
        Ok(())
    }

    /// Drop cached conversational state so it cannot leak across a wake
    pub async fn reset_prefix_cache(&self, backend: &Backend) -> Result<(), LifecycleError> {
        self.control_post(backend, "reset_prefix_cache", RESET_PREFIX_CACHE_PATH)
            .await?;
        debug!(backend = %backend.name, "Prefix cache reset");
        Ok(())
    }

    /// Run one idle sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Run one idle sweep, measuring idle time as of `now`.
    ///
    /// A backend that never served a request counts as idle forever. Each
    /// backend is handled independently; a failure is logged and recorded and
    /// the sweep moves on.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let Ok(_running) = self.sweep_lock.try_lock() else {
            warn!("Previous sweep still running, skipping");
            return SweepReport::skipped();
        };

        let mut report = SweepReport::default();

        for backend in self.registry.iter() {
            if !backend.is_managed() {
                continue;
            }

            let idle = self
                .activity
                .idle_duration_at(&backend.name, now)
                .unwrap_or(Duration::MAX);

            if let Some(threshold) = backend.sleep_after {
                if idle > threshold && self.is_ready(backend).await {
                    info!(
                        backend = %backend.name,
                        idle_secs = idle.as_secs(),
                        "Sleep threshold reached"
                    );
                    match self.sleep(backend).await {
                        Ok(()) => report.slept.push(backend.name.clone()),
                        Err(e) => {
                            warn!(backend = %backend.name, error = %e, "Sleep failed");
                            report.failed.push(SweepFailure {
                                backend: backend.name.clone(),
                                action: "sleep",
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }

            if let (Some(threshold), Some(container)) = (backend.stop_after, backend.container.as_deref()) {
                if idle <= threshold {
                    continue;
                }
                let outcome = match self.process.is_running(container).await {
                    Ok(false) => continue,
                    Ok(true) => {
                        info!(
                            backend = %backend.name,
                            idle_secs = idle.as_secs(),
                            "Stop threshold reached"
                        );
                        self.stop(backend).await
                    }
                    Err(e) if backend.sleep_api => {
                        debug!(backend = %backend.name, container, error = %e, "Running check failed, not stopping");
                        continue;
                    }
                    Err(e) => Err(e.into()),
                };
                match outcome {
                    Ok(()) => report.stopped.push(backend.name.clone()),
                    Err(e) => {
                        warn!(backend = %backend.name, error = %e, "Stop failed");
                        report.failed.push(SweepFailure {
                            backend: backend.name.clone(),
                            action: "stop",
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        *self.last_sweep.write() = Some(report.clone());
        report
    }

    /// Sweep every `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Idle sweep started");

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.slept.is_empty() || !report.stopped.is_empty() || !report.failed.is_empty() {
                        info!(
                            slept = ?report.slept,
                            stopped = ?report.stopped,
                            failed = report.failed.len(),
                            "Sweep finished"
                        );
                    } else {
                        debug!("Sweep finished, nothing to do");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Idle sweep shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Clears the single-flight slot when a wake task ends, even if it panics
struct WakeGuard {
    controller: Arc<LifecycleController>,
    name: String,
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        self.controller.wakes.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config};
    use crate::container::ProcessControl;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory container runtime
    #[derive(Default)]
    struct FakeProcess {
        running: Mutex<HashMap<String, bool>>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        /// `start` is accepted but the container never comes up
        stuck: bool,
        /// `start` takes this long to return
        start_delay: Duration,
    }

    impl FakeProcess {
        fn with_running(names: &[&str]) -> Self {
            let fake = Self::default();
            for name in names {
                fake.running.lock().insert(name.to_string(), true);
            }
            fake
        }
    }

    #[async_trait]
    impl ProcessControl for FakeProcess {
        async fn is_running(&self, name: &str) -> Result<bool, ContainerError> {
            Ok(self.running.lock().get(name).copied().unwrap_or(false))
        }

        async fn start(&self, name: &str) -> Result<(), ContainerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.start_delay).await;
            if !self.stuck {
                self.running.lock().insert(name.to_string(), true);
            }
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<(), ContainerError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.lock().insert(name.to_string(), false);
            Ok(())
        }
    }

    /// speech: process-only, stop after 3600s. chat: sleep API on an unreachable port.
    fn create_test_controller(
        process: Arc<FakeProcess>,
    ) -> (Arc<LifecycleController>, Arc<ActivityTracker>) {
        let mut config = Config::default();
        config.backends.clear();

        let mut speech = BackendConfig::new("http://127.0.0.1:1")
            .with_paths(&["/transcribe"])
            .with_container("faster-whisper");
        speech.stop_after_secs = Some(3600);
        speech.startup_timeout_secs = Some(1);
        config.backends.insert("speech".to_string(), speech);

        config.backends.insert(
            "chat".to_string(),
            BackendConfig::new("http://127.0.0.1:1")
                .with_paths(&["/v1/chat/completions"])
                .with_sleep_api(),
        );
        config.backends.insert(
            "tools".to_string(),
            BackendConfig::new("http://127.0.0.1:1").with_prefixes(&["/tools"]),
        );

        let registry = Arc::new(Registry::from_config(&config).unwrap());
        let activity = Arc::new(ActivityTracker::new(registry.names()));
        let settings = ControllerSettings {
            probe_timeout: Duration::from_millis(200),
            control_timeout: Duration::from_millis(200),
            startup_poll_interval: Duration::from_millis(20),
        };
        let controller =
            LifecycleController::new(registry, Arc::clone(&activity), process, settings).unwrap();
        (controller, activity)
    }

    fn backend(controller: &LifecycleController, name: &str) -> Arc<Backend> {
        Arc::clone(controller.registry().get(name).unwrap())
    }

    #[tokio::test]
    async fn test_idle_speech_stopped_exactly_once() {
        let process = Arc::new(FakeProcess::with_running(&["faster-whisper"]));
        let (controller, activity) = create_test_controller(Arc::clone(&process));

        activity.record_activity("speech");
        let later = Instant::now() + Duration::from_secs(4000);

        let report = controller.sweep_at(later).await;
        assert_eq!(report.stopped, vec!["speech"]);
        assert_eq!(process.stops.load(Ordering::SeqCst), 1);

        let report = controller.sweep_at(later).await;
        assert!(report.stopped.is_empty());
        assert_eq!(process.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recent_activity_keeps_backend_running() {
        let process = Arc::new(FakeProcess::with_running(&["faster-whisper"]));
        let (controller, activity) = create_test_controller(Arc::clone(&process));

        activity.record_activity("speech");
        let report = controller.sweep_at(Instant::now() + Duration::from_secs(3000)).await;

        assert!(report.stopped.is_empty());
        assert_eq!(process.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_never_used_running_backend_is_stopped_not_woken() {
        let process = Arc::new(FakeProcess::with_running(&["faster-whisper"]));
        let (controller, _activity) = create_test_controller(Arc::clone(&process));

        let report = controller.sweep().await;
        assert_eq!(report.stopped, vec!["speech"]);
        assert_eq!(process.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_stopped_backend() {
        let process = Arc::new(FakeProcess::default());
        let (controller, _activity) = create_test_controller(Arc::clone(&process));

        let report = controller.sweep().await;
        assert!(report.stopped.is_empty());
        assert_eq!(process.stops.load(Ordering::SeqCst), 0);
        assert!(controller.last_sweep().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_sleep_backend_is_not_ready_and_not_slept() {
        let process = Arc::new(FakeProcess::default());
        let (controller, _activity) = create_test_controller(process);
        let chat = backend(&controller, "chat");

        assert!(!controller.is_ready(&chat).await);
        assert_eq!(controller.state(&chat).await, LifecycleState::Stopped);

        // Not ready, so no sleep attempt and no failure recorded
        let report = controller.sweep().await;
        assert!(report.slept.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_pass_through_backend_always_ready() {
        let (controller, _activity) = create_test_controller(Arc::new(FakeProcess::default()));
        let tools = backend(&controller, "tools");

        assert!(controller.is_ready(&tools).await);
        assert_eq!(controller.state(&tools).await, LifecycleState::Awake);
        assert_eq!(
            controller.ensure_awake(&tools).await.unwrap(),
            WakeOutcome::AlreadyAwake
        );
    }

    #[tokio::test]
    async fn test_ensure_awake_starts_stopped_container() {
        let process = Arc::new(FakeProcess::default());
        let (controller, _activity) = create_test_controller(Arc::clone(&process));
        let speech = backend(&controller, "speech");

        assert_eq!(controller.state(&speech).await, LifecycleState::Stopped);
        assert!(!controller.is_ready(&speech).await);

        let outcome = controller.ensure_awake(&speech).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Started);
        assert!(controller.is_ready(&speech).await);
        assert_eq!(controller.state(&speech).await, LifecycleState::Awake);

        // Running already, nothing more to do
        let outcome = controller.ensure_awake(&speech).await.unwrap();
        assert_eq!(outcome, WakeOutcome::AlreadyAwake);
        assert_eq!(process.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let process = Arc::new(FakeProcess {
            stuck: true,
            ..Default::default()
        });
        let (controller, _activity) = create_test_controller(process);
        let speech = backend(&controller, "speech");

        let err = controller.ensure_awake(&speech).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartupTimeout { .. }));
        assert!(err.to_string().starts_with("Fatal: startup timeout"));
    }

    #[tokio::test]
    async fn test_huge_startup_timeout_still_starts() {
        let process = Arc::new(FakeProcess::default());
        let (controller, _activity) = create_test_controller(Arc::clone(&process));
        let mut speech = (*backend(&controller, "speech")).clone();
        speech.startup_timeout = Duration::MAX;

        let outcome = controller.ensure_awake(&speech).await.unwrap();
        assert_eq!(outcome, WakeOutcome::Started);
        assert_eq!(process.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_blocks_process_only_wake() {
        let (controller, _activity) = create_test_controller(Arc::new(FakeProcess::default()));
        let speech = backend(&controller, "speech");

        let controller = LifecycleController::new(
            Arc::clone(controller.registry()),
            Arc::new(ActivityTracker::new(controller.registry().names())),
            Arc::new(crate::container::Unavailable),
            ControllerSettings {
                probe_timeout: Duration::from_millis(200),
                control_timeout: Duration::from_millis(200),
                startup_poll_interval: Duration::from_millis(20),
            },
        )
        .unwrap();

        let err = controller.ensure_awake(&speech).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Container(ContainerError::NotFound { .. })));

        // The stop check fails too and is reported
        let report = controller.sweep().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].backend, "speech");
        assert_eq!(report.failed[0].action, "stop");
    }

    #[tokio::test]
    async fn test_dispatch_wake_is_single_flight() {
        let process = Arc::new(FakeProcess {
            start_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let (controller, _activity) = create_test_controller(Arc::clone(&process));
        let speech = backend(&controller, "speech");

        assert!(controller.dispatch_wake(&speech));
        assert!(!controller.dispatch_wake(&speech));
        assert!(!controller.dispatch_wake(&speech));
        assert!(controller.is_waking("speech"));
        assert_eq!(controller.state(&speech).await, LifecycleState::Starting);

        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.is_waking("speech") && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!controller.is_waking("speech"));
        assert_eq!(process.starts.load(Ordering::SeqCst), 1);
        assert!(controller.is_ready(&speech).await);
    }

    #[tokio::test]
    async fn test_sleep_and_stop_require_capability() {
        let (controller, _activity) = create_test_controller(Arc::new(FakeProcess::default()));

        let speech = backend(&controller, "speech");
        assert!(matches!(
            controller.sleep(&speech).await,
            Err(LifecycleError::Unsupported { .. })
        ));

        let chat = backend(&controller, "chat");
        assert!(matches!(
            controller.stop(&chat).await,
            Err(LifecycleError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_sweep_is_skipped() {
        let (controller, _activity) = create_test_controller(Arc::new(FakeProcess::default()));

        let _held = controller.sweep_lock.lock().await;
        let report = controller.sweep().await;
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (controller, _activity) = create_test_controller(Arc::new(FakeProcess::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&controller).run(Duration::from_millis(20), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.last_sweep().is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
