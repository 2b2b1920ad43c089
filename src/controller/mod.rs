//! Model Controller: per-model state machine, global load serialization,
//! adaptive config selection, resource admission/eviction, idle reaping.
//! Grounded on the distilled system's `ModelController` plus the teacher's
//! `model_manager.rs` (global start mutex, registry-of-handles pattern).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::config::ConfigManager;
use crate::devices::DeviceRegistry;
use crate::errors::{OrchestratorError, Result};
use crate::interfaces::InterfaceRegistry;
use crate::ledger::LedgerStore;
use crate::process::ProcessSupervisor;

const LOG_RING_CAP: usize = 200;
const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(300);
const LOAD_WAIT_DEADLINE: Duration = Duration::from_secs(300);
const LOAD_WAIT_POLL: Duration = Duration::from_millis(500);
const EVICTION_SETTLE_DELAY: Duration = Duration::from_secs(2);
const MAX_ADMISSION_ATTEMPTS: u32 = 3;
const IDLE_REAP_INTERVAL: Duration = Duration::from_secs(30);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Stopped,
    Starting,
    InitScript,
    HealthCheck,
    Routing,
    Failed,
}

impl ModelStatus {
    fn is_loading(&self) -> bool {
        matches!(self, ModelStatus::Starting | ModelStatus::InitScript | ModelStatus::HealthCheck)
    }
}

struct ModelState {
    status: ModelStatus,
    last_access: Option<f64>,
    pending_requests: u32,
    current_config: Option<crate::config::AdaptiveConfig>,
    failure_reason: Option<String>,
    log_ring: VecDeque<String>,
}

impl ModelState {
    fn new() -> Self {
        Self {
            status: ModelStatus::Stopped,
            last_access: None,
            pending_requests: 0,
            current_config: None,
            failure_reason: None,
            log_ring: VecDeque::new(),
        }
    }

    fn push_log(&mut self, line: String) {
        if self.log_ring.len() >= LOG_RING_CAP {
            self.log_ring.pop_front();
        }
        self.log_ring.push_back(line);
    }
}

struct ModelHandle {
    primary_name: String,
    state: AsyncMutex<ModelState>,
    notify: Notify,
}

#[derive(Debug, Clone)]
pub struct ModelStatusView {
    pub primary_name: String,
    pub status: ModelStatus,
    pub pending_requests: u32,
    pub last_access: Option<f64>,
    pub failure_reason: Option<String>,
}

pub struct ModelController {
    config: Arc<ConfigManager>,
    devices: Arc<DeviceRegistry>,
    interfaces: Arc<InterfaceRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    ledger: Arc<LedgerStore>,
    http_client: reqwest::Client,
    models: HashMap<String, Arc<ModelHandle>>,
    global_load_lock: AsyncMutex<()>,
}

impl ModelController {
    pub fn new(
        config: Arc<ConfigManager>,
        devices: Arc<DeviceRegistry>,
        interfaces: Arc<InterfaceRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        ledger: Arc<LedgerStore>,
    ) -> Arc<Self> {
        let mut models = HashMap::new();
        for name in config.primary_names() {
            models.insert(
                name.clone(),
                Arc::new(ModelHandle {
                    primary_name: name,
                    state: AsyncMutex::new(ModelState::new()),
                    notify: Notify::new(),
                }),
            );
        }

        Arc::new(Self {
            config,
            devices,
            interfaces,
            supervisor,
            ledger,
            http_client: reqwest::Client::new(),
            models,
            global_load_lock: AsyncMutex::new(()),
        })
    }

    fn handle(&self, primary_name: &str) -> Result<Arc<ModelHandle>> {
        self.models
            .get(primary_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("unknown model '{primary_name}'")))
    }

    fn process_name(primary_name: &str) -> String {
        format!("model_{primary_name}")
    }

    /// Ensures `primary_name` is in `routing`. Idempotent for already-routing
    /// models. Serializes with every other load via the global load lock so
    /// at most one model is ever in {starting, init_script, health_check}.
    pub async fn start_model(self: &Arc<Self>, primary_name: &str) -> Result<()> {
        let handle = self.handle(primary_name)?;
        let wait_deadline = Instant::now() + LOAD_WAIT_DEADLINE;

        // Outer retry loop: a waiter that loses the race to acquire the
        // global load lock (because a second load slipped in between its
        // predicate wait and the lock acquisition) goes back to waiting
        // rather than recursing.
        loop {
            // Fast path / predicate wait for a load already in flight,
            // without holding the global load lock or the per-model lock
            // across the wait (condition-variable-style, per the redesign
            // in SPEC_FULL §9 — never a manual release/sleep-fixed-interval
            // /reacquire loop).
            loop {
                {
                    let state = handle.state.lock().await;
                    if state.status == ModelStatus::Routing {
                        return Ok(());
                    }
                    if !state.status.is_loading() {
                        break;
                    }
                }
                if Instant::now() >= wait_deadline {
                    return Err(OrchestratorError::Unavailable(format!(
                        "timed out waiting for '{primary_name}' to finish loading"
                    )));
                }
                let notified = handle.notify.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(LOAD_WAIT_POLL) => {}
                }
            }

            let _permit = self.global_load_lock.lock().await;

            // Re-check after acquiring the global lock: another loader may
            // have already finished (or started) while we waited for it.
            {
                let mut state = handle.state.lock().await;
                if state.status == ModelStatus::Routing {
                    return Ok(());
                }
                if state.status.is_loading() {
                    drop(state);
                    continue;
                }
                state.status = ModelStatus::Starting;
                state.failure_reason = None;
                state.log_ring.clear();
                state.push_log(format!("starting model '{primary_name}'"));
            }
            handle.notify.notify_waiters();

            return match self.load_sequence(&handle).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    let mut state = handle.state.lock().await;
                    state.status = ModelStatus::Failed;
                    state.failure_reason = Some(e.to_string());
                    drop(state);
                    handle.notify.notify_waiters();
                    Err(e)
                }
            };
        }
    }

    async fn load_sequence(&self, handle: &Arc<ModelHandle>) -> Result<()> {
        let primary_name = handle.primary_name.clone();
        let model_config = self
            .config
            .model_config(&primary_name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("unknown model '{primary_name}'")))?;

        let program = self.config.program();
        let online_devices = if program.disable_gpu_monitoring {
            model_config
                .variants
                .iter()
                .flat_map(|(_, v)| v.required_devices.iter().cloned())
                .collect()
        } else {
            self.devices.online_devices()
        };

        let adaptive = self.config.adaptive_config(&primary_name, &online_devices).ok_or_else(|| {
            OrchestratorError::Unavailable(format!(
                "no config for devices {online_devices:?}"
            ))
        })?;

        if !program.disable_gpu_monitoring {
            if !self.check_and_free_resources(&primary_name, &adaptive).await {
                return Err(OrchestratorError::Unavailable(
                    "insufficient device resources after eviction attempts".to_string(),
                ));
            }
        }

        {
            let mut state = handle.state.lock().await;
            state.current_config = Some(adaptive.clone());
            state.push_log(format!("using config variant '{}'", adaptive.config_source));
        }

        let process_name = Self::process_name(&primary_name);
        let ring = handle.clone();
        let sink: crate::process::LogSink = Arc::new(move |line: String| {
            let ring = ring.clone();
            tokio::spawn(async move {
                ring.state.lock().await.push_log(line);
            });
        });

        let cwd = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
        self.supervisor
            .spawn(&process_name, &adaptive.script_path, &cwd, Some(format!("model process: {primary_name}")), sink)
            .await?;

        {
            let mut state = handle.state.lock().await;
            state.status = ModelStatus::InitScript;
        }
        handle.notify.notify_waiters();

        let deadline = Instant::now() + HEALTH_CHECK_DEADLINE;
        let interface = self.interfaces.get(adaptive.mode);
        let handle_for_cb = handle.clone();
        let on_shallow_passed = move || {
            let h = handle_for_cb.clone();
            tokio::spawn(async move {
                let mut state = h.state.lock().await;
                if state.status == ModelStatus::InitScript {
                    state.status = ModelStatus::HealthCheck;
                }
                drop(state);
                h.notify.notify_waiters();
            });
        };

        let (ok, message) = interface.health_check(&self.http_client, adaptive.port, deadline, &on_shallow_passed).await;

        if !ok {
            let _ = self.supervisor.stop(&process_name, true, Duration::from_secs(5)).await;
            return Err(OrchestratorError::Unavailable(format!(
                "health check failed for '{primary_name}': {message}"
            )));
        }

        let now = now_secs();
        {
            let mut state = handle.state.lock().await;
            state.status = ModelStatus::Routing;
            state.last_access = Some(now);
            state.push_log(format!("model '{primary_name}' is routing"));
        }
        handle.notify.notify_waiters();

        if let Err(e) = self.ledger.add_model_runtime_start(&primary_name, now).await {
            tracing::warn!(model = %primary_name, error = %e, "failed to record runtime start");
        }

        Ok(())
    }

    /// Up to three admission attempts; between attempts, stop one idle
    /// peer and sleep ≥2s before re-checking. Returns `false` if the
    /// deficit could not be cleared.
    async fn check_and_free_resources(&self, loading: &str, adaptive: &crate::config::AdaptiveConfig) -> bool {
        for attempt in 0..MAX_ADMISSION_ATTEMPTS {
            let mut ok = true;
            for (device, required_mb) in &adaptive.memory_mb {
                if !self.devices.is_online(device) {
                    ok = false;
                    break;
                }
                let mem = self.devices.memory_info(device).unwrap_or_default();
                if mem.available_mb < *required_mb {
                    ok = false;
                }
            }
            if ok {
                return true;
            }

            if attempt + 1 >= MAX_ADMISSION_ATTEMPTS {
                break;
            }

            match self.pick_idle_candidate(loading).await {
                Some(candidate) => {
                    let _ = self.stop_model_inner(&candidate).await;
                    tokio::time::sleep(EVICTION_SETTLE_DELAY).await;
                }
                None => break,
            }
        }
        false
    }

    async fn pick_idle_candidate(&self, excluding: &str) -> Option<String> {
        let mut candidates: Vec<(String, f64)> = Vec::new();
        for (name, handle) in &self.models {
            if name == excluding {
                continue;
            }
            let state = handle.state.lock().await;
            if state.status == ModelStatus::Routing && state.pending_requests == 0 {
                candidates.push((name.clone(), state.last_access.unwrap_or(0.0)));
            }
        }
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        candidates.into_iter().next().map(|(name, _)| name)
    }

    /// Force-terminates the backend and transitions to `stopped`. Idempotent.
    pub async fn stop_model(&self, primary_name: &str) -> Result<()> {
        self.stop_model_inner(primary_name, true, Duration::from_secs(5)).await
    }

    async fn stop_model_inner(&self, primary_name: &str, force: bool, timeout: Duration) -> Result<()> {
        let handle = self.handle(primary_name)?;
        {
            let state = handle.state.lock().await;
            if matches!(state.status, ModelStatus::Stopped | ModelStatus::Failed) {
                return Ok(());
            }
        }

        let process_name = Self::process_name(primary_name);
        let _ = self.supervisor.stop(&process_name, force, timeout).await;

        let now = now_secs();
        if let Err(e) = self.ledger.update_model_runtime_end(primary_name, now).await {
            tracing::warn!(model = %primary_name, error = %e, "failed to record runtime end");
        }

        {
            let mut state = handle.state.lock().await;
            state.status = ModelStatus::Stopped;
            state.current_config = None;
            state.failure_reason = None;
        }
        handle.notify.notify_waiters();
        Ok(())
    }

    /// Parallel `stop_model` over all non-stopped entries.
    pub async fn unload_all(self: &Arc<Self>) {
        let names: Vec<String> = self.models.keys().cloned().collect();
        let mut handles = Vec::new();
        for name in names {
            let me = self.clone();
            handles.push(tokio::spawn(async move {
                let _ = me.stop_model(&name).await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    /// Graceful shutdown: delegates the actual parallel graceful-then-
    /// force-after-`per_model_deadline` process termination to the
    /// supervisor's own `stop_all` (spec.md §5 / §4.C), then reconciles each
    /// model's ledger runtime-end and status afterward. Used on process
    /// shutdown in place of `unload_all`'s always-forceful stop.
    pub async fn shutdown_all(self: &Arc<Self>, per_model_deadline: Duration) {
        self.supervisor.stop_all(per_model_deadline).await;

        let names: Vec<String> = self.models.keys().cloned().collect();
        let now = now_secs();
        for name in names {
            let Ok(handle) = self.handle(&name) else { continue };
            {
                let state = handle.state.lock().await;
                if matches!(state.status, ModelStatus::Stopped | ModelStatus::Failed) {
                    continue;
                }
            }
            if let Err(e) = self.ledger.update_model_runtime_end(&name, now).await {
                tracing::warn!(model = %name, error = %e, "failed to record runtime end");
            }
            let mut state = handle.state.lock().await;
            state.status = ModelStatus::Stopped;
            state.current_config = None;
            state.failure_reason = None;
            drop(state);
            handle.notify.notify_waiters();
        }
    }

    pub async fn increment_pending(&self, primary_name: &str) -> Result<()> {
        let handle = self.handle(primary_name)?;
        let mut state = handle.state.lock().await;
        state.pending_requests += 1;
        Ok(())
    }

    pub async fn mark_request_completed(&self, primary_name: &str) -> Result<()> {
        let handle = self.handle(primary_name)?;
        let mut state = handle.state.lock().await;
        state.pending_requests = state.pending_requests.saturating_sub(1);
        state.last_access = Some(now_secs());
        Ok(())
    }

    pub async fn list_status(&self) -> Vec<ModelStatusView> {
        let mut out = Vec::new();
        for (name, handle) in &self.models {
            let state = handle.state.lock().await;
            out.push(ModelStatusView {
                primary_name: name.clone(),
                status: state.status,
                pending_requests: state.pending_requests,
                last_access: state.last_access,
                failure_reason: state.failure_reason.clone(),
            });
        }
        out
    }

    pub async fn get_log(&self, primary_name: &str) -> Result<Vec<String>> {
        let handle = self.handle(primary_name)?;
        let state = handle.state.lock().await;
        Ok(state.log_ring.iter().cloned().collect())
    }

    pub async fn model_port(&self, primary_name: &str) -> Option<u16> {
        self.config.model_config(primary_name).map(|c| c.port)
    }

    /// Launches `start_model` on a background task for every `auto_start`
    /// model; non-blocking.
    pub fn start_auto_start_models(self: &Arc<Self>) {
        for config in self.config.all_model_configs() {
            if !config.auto_start {
                continue;
            }
            let me = self.clone();
            let name = config.primary_name().to_string();
            tokio::spawn(async move {
                if let Err(e) = me.start_model(&name).await {
                    tracing::warn!(model = %name, error = %e, "auto-start failed");
                }
            });
        }
    }

    /// Background worker: every 30s, stops any `routing` model that has
    /// been idle (zero pending requests) longer than `alive_time_minutes`.
    pub fn spawn_idle_reaper(self: &Arc<Self>) {
        let me = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDLE_REAP_INTERVAL).await;
                let alive_minutes = me.config.program().alive_time;
                if alive_minutes == 0 {
                    continue;
                }
                let alive_seconds = (alive_minutes * 60) as f64;
                let now = now_secs();

                let mut to_stop = Vec::new();
                for (name, handle) in &me.models {
                    let state = handle.state.lock().await;
                    let idle = state.status == ModelStatus::Routing
                        && state.pending_requests == 0
                        && state.last_access.map(|t| now - t > alive_seconds).unwrap_or(false);
                    if idle {
                        to_stop.push(name.clone());
                    }
                }
                for name in to_stop {
                    tracing::info!(model = %name, "idle timeout exceeded, stopping");
                    let _ = me.stop_model(&name).await;
                }
            }
        });
    }

    /// Background worker mirroring the supervisor's liveness sweep period:
    /// observes processes the supervisor has already marked dead and moves
    /// the corresponding model to `stopped` (never `failed` — an
    /// unexpected exit is not a load failure).
    pub fn spawn_liveness_reconciler(self: &Arc<Self>) {
        let me = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONCILE_INTERVAL).await;
                for (name, handle) in &me.models {
                    let currently_running = {
                        let state = handle.state.lock().await;
                        matches!(
                            state.status,
                            ModelStatus::InitScript | ModelStatus::HealthCheck | ModelStatus::Routing
                        )
                    };
                    if !currently_running {
                        continue;
                    }
                    let process_name = Self::process_name(name);
                    if !me.supervisor.is_alive(&process_name).await {
                        let mut state = handle.state.lock().await;
                        state.status = ModelStatus::Stopped;
                        state.current_config = None;
                        drop(state);
                        handle.notify.notify_waiters();
                        tracing::warn!(model = %name, "process died unexpectedly, marked stopped");
                    }
                }
            }
        });
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
