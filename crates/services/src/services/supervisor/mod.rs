//! Process supervisor (C3): the control tower every spawn flows through.
//!
//! The supervisor owns the only references to raw child handles. Ports
//! come from the pool manager, pids go into the tracker, and lifecycle
//! is reported exclusively through broadcast events. Dispatch over the
//! three child kinds lives in [`spawn`]; each kind pairs a spawning
//! strategy with a readiness strategy (IPC ready latch, port probe, or
//! immediate).

pub mod config;
pub mod events;
mod health;
pub mod ipc;
pub mod spawn;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use command_group::AsyncGroupChild;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{Notify, broadcast},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

pub use config::{
    ExecutableKind, HealthProbe, RestartPolicy, ServiceConfig, ServicePriority, StdioMode,
};
pub use events::{FailureReason, ProcessEvent, ProgressStatus};
use ipc::{IpcHandler, IpcHandlerTable};

use super::{pid_tracker::PidTracker, port_pool::PortPool};

/// Deadline for the `ready` envelope from interpreted children. Native
/// children are probed without any deadline.
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause between TCP connect probes against a native child's port.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Budget for a single connect probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// A `waiting` progress event is emitted every this many probes.
const WAITING_EVERY_N_POLLS: u32 = 20;

/// Ceiling on waiting for an exit watcher to acknowledge a stop before
/// signalling the process group directly. Covers the rare case of a
/// start future cancelled by drop, which leaves no watcher behind.
const ORPHANED_STOP_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Service not registered: {0}")]
    NotRegistered(String),

    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Invalid config for service '{0}': {1}")]
    InvalidConfig(String, String),

    #[error("No port available for service '{0}'")]
    NoPort(String),

    #[error("Failed to spawn service '{0}': {1}")]
    SpawnFailed(String, String),

    #[error("Service '{0}' exhausted its restart policy")]
    RestartExhausted(String),

    #[error("Start of service '{0}' was cancelled")]
    Cancelled(String),

    #[error("Service '{0}' has no open IPC channel")]
    IpcUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Unhealthy,
    Crashed,
    Stopping,
    Stopped,
}

impl ProcessState {
    /// Terminal states hold no resources.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed | ProcessState::Idle)
    }
}

/// Read-only view of a live (or recently dead) service instance.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProcessSnapshot {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct InstanceShared {
    state: ProcessState,
    pid: Option<u32>,
    port: Option<u16>,
    restart_count: u32,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    restart_requested: bool,
}

/// Live record for one running service. The child handle itself is owned
/// by the exit-watcher task; nothing outside this module ever sees it.
pub(crate) struct Instance {
    pub(crate) config: Arc<ServiceConfig>,
    shared: StdMutex<InstanceShared>,
    pub(crate) cancel: CancellationToken,
    exited: Notify,
    #[cfg(unix)]
    ipc_outbound: StdMutex<Option<tokio::sync::mpsc::Sender<serde_json::Value>>>,
}

impl Instance {
    fn new(config: Arc<ServiceConfig>, port: Option<u16>, restart_count: u32) -> Self {
        Self {
            config,
            shared: StdMutex::new(InstanceShared {
                state: ProcessState::Starting,
                pid: None,
                port,
                restart_count,
                started_at: None,
                last_error: None,
                restart_requested: false,
            }),
            cancel: CancellationToken::new(),
            exited: Notify::new(),
            #[cfg(unix)]
            ipc_outbound: StdMutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ProcessState {
        self.shared.lock().expect("instance poisoned").state
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        self.shared.lock().expect("instance poisoned").state = state;
    }

    /// Health monitor entry point: route the next exit through the crash
    /// path so the restart policy applies.
    pub(crate) fn request_restart(&self) {
        self.shared
            .lock()
            .expect("instance poisoned")
            .restart_requested = true;
        self.cancel.cancel();
    }

    fn snapshot(&self) -> ProcessSnapshot {
        let shared = self.shared.lock().expect("instance poisoned");
        ProcessSnapshot {
            name: self.config.name.clone(),
            state: shared.state,
            pid: shared.pid,
            port: shared.port,
            restart_count: shared.restart_count,
            started_at: shared.started_at,
            last_error: shared.last_error.clone(),
        }
    }
}

enum AttemptOutcome {
    Ready,
    NoPort(String),
    SpawnFailed(String),
    CrashedBeforeReady(String),
    Cancelled,
}

enum ReadyOutcome {
    Ready,
    ExitedEarly(Option<i32>),
    TimedOut,
    Cancelled,
}

pub(crate) struct Inner {
    ports: Arc<PortPool>,
    pids: Arc<PidTracker>,
    registry: StdMutex<HashMap<String, Arc<ServiceConfig>>>,
    instances: DashMap<String, Arc<Instance>>,
    events: broadcast::Sender<ProcessEvent>,
    ipc_handlers: Arc<IpcHandlerTable>,
}

impl Inner {
    pub(crate) fn emit(&self, event: ProcessEvent) {
        debug!(?event, "Process event");
        let _ = self.events.send(event);
    }

    async fn release_resources(&self, instance: &Arc<Instance>) {
        let name = &instance.config.name;
        if instance.config.requires_port {
            self.ports.release(name);
        }
        let pid = instance.shared.lock().expect("instance poisoned").pid;
        if let Some(pid) = pid
            && let Err(e) = self.pids.forget(pid).await
        {
            warn!(service = %name, pid, error = %e, "Failed to forget pid");
        }
        instance.shared.lock().expect("instance poisoned").port = None;
    }

    async fn start_service(
        self: &Arc<Self>,
        name: &str,
        first_attempt: u32,
    ) -> Result<(), SupervisorError> {
        let config = {
            let registry = self.registry.lock().expect("registry poisoned");
            registry
                .get(name)
                .cloned()
                .ok_or_else(|| SupervisorError::NotRegistered(name.to_string()))?
        };
        if let Some(instance) = self.instances.get(name)
            && !instance.state().is_terminal()
        {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }

        let policy = config.restart_policy;
        let mut attempt = first_attempt;
        let mut spawn_retry_used = false;
        loop {
            match self.run_attempt(&config, attempt).await {
                AttemptOutcome::Ready => return Ok(()),
                AttemptOutcome::Cancelled => {
                    return Err(SupervisorError::Cancelled(name.to_string()));
                }
                AttemptOutcome::NoPort(message) => {
                    self.emit(ProcessEvent::ProcessFailed {
                        name: name.to_string(),
                        reason: FailureReason::NoPort,
                        message,
                    });
                    return Err(SupervisorError::NoPort(name.to_string()));
                }
                AttemptOutcome::SpawnFailed(message) => {
                    if !spawn_retry_used && policy.max_attempts > 0 {
                        spawn_retry_used = true;
                        warn!(service = %name, error = %message, "Spawn failed; retrying once");
                        continue;
                    }
                    self.emit(ProcessEvent::ProcessFailed {
                        name: name.to_string(),
                        reason: FailureReason::SpawnFailed,
                        message: message.clone(),
                    });
                    return Err(SupervisorError::SpawnFailed(name.to_string(), message));
                }
                AttemptOutcome::CrashedBeforeReady(message) => {
                    if attempt >= policy.max_attempts {
                        error!(service = %name, error = %message, "Restart policy exhausted");
                        self.emit(ProcessEvent::ProcessFailed {
                            name: name.to_string(),
                            reason: FailureReason::RestartExhausted,
                            message,
                        });
                        return Err(SupervisorError::RestartExhausted(name.to_string()));
                    }
                    attempt += 1;
                    warn!(
                        service = %name,
                        attempt,
                        error = %message,
                        "Service crashed before ready; restarting after delay"
                    );
                    tokio::time::sleep(policy.delay).await;
                    if !self.instances.contains_key(name) {
                        // Stopped while we were waiting to retry.
                        return Err(SupervisorError::Cancelled(name.to_string()));
                    }
                }
            }
        }
    }

    async fn run_attempt(self: &Arc<Self>, config: &Arc<ServiceConfig>, attempt: u32) -> AttemptOutcome {
        let name = config.name.clone();

        // (a) Port first; failure here consumes nothing.
        let port = if config.requires_port {
            let pool = config.pool_name.as_deref().unwrap_or_default();
            match self.ports.allocate_for_service(&name, pool).await {
                Ok(port) => Some(port),
                Err(e) => return AttemptOutcome::NoPort(e.to_string()),
            }
        } else {
            None
        };

        let instance = Arc::new(Instance::new(config.clone(), port, attempt));
        self.instances.insert(name.clone(), instance.clone());

        // (b)+(c) Environment overlay and kind-specific spawn.
        let spawned = match spawn::spawn_child(config, port) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.release_resources(&instance).await;
                let mut shared = instance.shared.lock().expect("instance poisoned");
                shared.state = ProcessState::Crashed;
                shared.last_error = Some(e.to_string());
                drop(shared);
                return AttemptOutcome::SpawnFailed(e.to_string());
            }
        };
        #[cfg(unix)]
        let mut spawned = spawned;
        #[cfg(not(unix))]
        let spawned = spawned;
        let mut child = spawned.child;

        let Some(pid) = child.inner().id() else {
            spawn::kill_process_group(&mut child).await;
            self.release_resources(&instance).await;
            instance.set_state(ProcessState::Crashed);
            return AttemptOutcome::SpawnFailed("spawned child has no pid".to_string());
        };

        // (d) Record before anything can go wrong at runtime.
        instance.shared.lock().expect("instance poisoned").pid = Some(pid);
        if let Err(e) = self.pids.record(pid, &config.image_label()).await {
            warn!(service = %name, pid, error = %e, "Failed to record pid");
        }
        self.emit(ProcessEvent::ProcessStarted {
            name: name.clone(),
            pid,
            port,
        });

        // Readiness strategy per kind.
        #[cfg(unix)]
        let ready_latch = spawned.ipc.take().map(|stream| {
            let sink = self.progress_sink(&name, port);
            let channel = ipc::attach(stream, self.ipc_handlers.clone(), name.clone(), sink);
            *instance.ipc_outbound.lock().expect("instance poisoned") =
                Some(channel.outbound.clone());
            channel.ready
        });

        let outcome = match config.kind {
            ExecutableKind::TerminalServer => ReadyOutcome::Ready,
            ExecutableKind::NativeBinary => match port {
                Some(port) => self.await_port_ready(&instance, &mut child, port).await,
                // Nothing to probe without a port; running on spawn.
                None => ReadyOutcome::Ready,
            },
            ExecutableKind::InterpretedScript => {
                #[cfg(unix)]
                {
                    self.await_ipc_ready(&instance, &mut child, ready_latch).await
                }
                #[cfg(not(unix))]
                {
                    ReadyOutcome::ExitedEarly(None)
                }
            }
        };

        match outcome {
            ReadyOutcome::Ready => {
                {
                    let mut shared = instance.shared.lock().expect("instance poisoned");
                    shared.state = ProcessState::Running;
                    shared.started_at = Some(Utc::now());
                }
                info!(service = %name, pid, ?port, "Service running");
                self.emit(ProcessEvent::ProcessReady {
                    name: name.clone(),
                    port,
                });
                if let (Some(probe), Some(port)) = (config.health_probe.clone(), port) {
                    health::spawn_health_monitor(self.clone(), instance.clone(), probe, port);
                }
                self.spawn_exit_watcher(instance, child);
                AttemptOutcome::Ready
            }
            ReadyOutcome::Cancelled => {
                spawn::kill_process_group(&mut child).await;
                self.release_resources(&instance).await;
                instance.set_state(ProcessState::Stopped);
                self.emit(ProcessEvent::ProcessStopped { name });
                instance.exited.notify_waiters();
                AttemptOutcome::Cancelled
            }
            ReadyOutcome::TimedOut => {
                spawn::kill_process_group(&mut child).await;
                self.release_resources(&instance).await;
                let message = "timed out waiting for ready".to_string();
                let mut shared = instance.shared.lock().expect("instance poisoned");
                shared.state = ProcessState::Crashed;
                shared.last_error = Some(message.clone());
                drop(shared);
                instance.exited.notify_waiters();
                AttemptOutcome::CrashedBeforeReady(message)
            }
            ReadyOutcome::ExitedEarly(code) => {
                let _ = child.wait().await;
                self.release_resources(&instance).await;
                let message = match code {
                    Some(code) => format!("exited with code {code} before becoming ready"),
                    None => "exited before becoming ready".to_string(),
                };
                let mut shared = instance.shared.lock().expect("instance poisoned");
                shared.state = ProcessState::Crashed;
                shared.last_error = Some(message.clone());
                drop(shared);
                instance.exited.notify_waiters();
                AttemptOutcome::CrashedBeforeReady(message)
            }
        }
    }

    /// Native readiness: connect probes against the allocated port,
    /// repeated with no deadline. Exits only on success, child death or
    /// cancellation.
    async fn await_port_ready(
        &self,
        instance: &Arc<Instance>,
        child: &mut AsyncGroupChild,
        port: u16,
    ) -> ReadyOutcome {
        let name = &instance.config.name;
        let mut polls = 0u32;
        loop {
            match child.inner().try_wait() {
                Ok(Some(status)) => return ReadyOutcome::ExitedEarly(status.code()),
                Ok(None) => {}
                Err(e) => {
                    warn!(service = %name, error = %e, "try_wait failed during port probe");
                }
            }

            let connected = matches!(
                tokio::time::timeout(
                    PROBE_CONNECT_TIMEOUT,
                    TcpStream::connect(("127.0.0.1", port))
                )
                .await,
                Ok(Ok(_))
            );
            if connected {
                return ReadyOutcome::Ready;
            }

            polls += 1;
            if polls % WAITING_EVERY_N_POLLS == 0 {
                self.emit(ProcessEvent::ProcessProgress {
                    name: name.clone(),
                    status: ProgressStatus::Waiting,
                    message: format!("Waiting for {name} to listen on port {port}"),
                    port: Some(port),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                _ = instance.cancel.cancelled() => return ReadyOutcome::Cancelled,
            }
        }
    }

    /// Interpreted readiness: the pre-installed latch fires on the
    /// child's `ready` envelope. A hung-up channel means the child died.
    #[cfg(unix)]
    async fn await_ipc_ready(
        &self,
        instance: &Arc<Instance>,
        child: &mut AsyncGroupChild,
        latch: Option<tokio::sync::oneshot::Receiver<serde_json::Value>>,
    ) -> ReadyOutcome {
        let Some(latch) = latch else {
            return ReadyOutcome::Ready;
        };
        tokio::select! {
            _ = instance.cancel.cancelled() => ReadyOutcome::Cancelled,
            result = tokio::time::timeout(READY_TIMEOUT, latch) => match result {
                Err(_) => ReadyOutcome::TimedOut,
                Ok(Ok(envelope)) => {
                    debug!(service = %instance.config.name, ?envelope, "Ready envelope received");
                    ReadyOutcome::Ready
                }
                Ok(Err(_)) => {
                    let code = child.inner().try_wait().ok().flatten().and_then(|s| s.code());
                    ReadyOutcome::ExitedEarly(code)
                }
            }
        }
    }

    #[cfg(unix)]
    fn progress_sink(self: &Arc<Self>, name: &str, port: Option<u16>) -> ipc::ProgressSink {
        let inner = self.clone();
        let name = name.to_string();
        Arc::new(move |envelope: serde_json::Value| {
            let status = envelope
                .get("status")
                .cloned()
                .and_then(|v| serde_json::from_value::<ProgressStatus>(v).ok());
            let Some(status) = status else {
                debug!(service = %name, "Progress envelope with unknown status; dropping");
                return;
            };
            let message = envelope
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            inner.emit(ProcessEvent::ProcessProgress {
                name: name.clone(),
                status,
                message,
                port,
            });
        })
    }

    fn spawn_exit_watcher(self: &Arc<Self>, instance: Arc<Instance>, mut child: AsyncGroupChild) {
        let inner = self.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = instance.cancel.cancelled() => {
                    spawn::kill_process_group(&mut child).await;
                    child.inner().try_wait().ok().flatten()
                }
            };
            inner.handle_exit(instance, status).await;
        });
    }

    async fn handle_exit(
        self: Arc<Self>,
        instance: Arc<Instance>,
        status: Option<std::process::ExitStatus>,
    ) {
        let name = instance.config.name.clone();
        let (was_stopping, restart_requested, attempt) = {
            let shared = instance.shared.lock().expect("instance poisoned");
            (
                shared.state == ProcessState::Stopping,
                shared.restart_requested,
                shared.restart_count,
            )
        };
        self.release_resources(&instance).await;

        let clean_exit = status.map(|s| s.success()).unwrap_or(false);
        if was_stopping || (clean_exit && !restart_requested) {
            instance.set_state(ProcessState::Stopped);
            info!(service = %name, "Service stopped");
            self.emit(ProcessEvent::ProcessStopped { name });
            instance.exited.notify_waiters();
            return;
        }

        let message = match status {
            Some(status) => format!("exited with {status}"),
            None => "terminated".to_string(),
        };
        {
            let mut shared = instance.shared.lock().expect("instance poisoned");
            shared.state = ProcessState::Crashed;
            shared.last_error = Some(message.clone());
        }
        instance.exited.notify_waiters();

        let policy = instance.config.restart_policy;
        if attempt >= policy.max_attempts {
            error!(service = %name, error = %message, "Service crashed; restart policy exhausted");
            self.emit(ProcessEvent::ProcessFailed {
                name,
                reason: FailureReason::RestartExhausted,
                message,
            });
            return;
        }

        warn!(
            service = %name,
            attempt = attempt + 1,
            error = %message,
            "Service crashed; scheduling restart"
        );
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(policy.delay).await;
            let still_current = inner
                .instances
                .get(&name)
                .map(|current| Arc::ptr_eq(current.value(), &instance))
                .unwrap_or(false);
            if !still_current {
                return;
            }
            if let Err(e) = inner.start_service(&name, attempt + 1).await {
                if !matches!(e, SupervisorError::Cancelled(_)) {
                    warn!(service = %name, error = %e, "Restart did not recover the service");
                }
            }
        });
    }
}

/// Best-effort polite-then-forceful kill of a process group by pid,
/// used only when the child handle is no longer reachable.
async fn kill_group_by_pid(pid: u32) {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{Signal, killpg},
            unistd::{Pid, getpgid},
        };
        if let Ok(pgid) = getpgid(Some(Pid::from_raw(pid as i32))) {
            let _ = killpg(pgid, Signal::SIGTERM);
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Public handle to the supervisor singleton.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(ports: Arc<PortPool>, pids: Arc<PidTracker>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                ports,
                pids,
                registry: StdMutex::new(HashMap::new()),
                instances: DashMap::new(),
                events,
                ipc_handlers: Arc::new(IpcHandlerTable::new()),
            }),
        }
    }

    pub fn ports(&self) -> Arc<PortPool> {
        self.inner.ports.clone()
    }

    /// Register a service. Configuration problems are rejected here so
    /// they can never surface at runtime.
    pub fn register(&self, config: ServiceConfig) -> Result<(), SupervisorError> {
        if config.requires_port && config.pool_name.is_none() {
            return Err(SupervisorError::InvalidConfig(
                config.name.clone(),
                "requires a port but names no pool".to_string(),
            ));
        }
        if config.kind == ExecutableKind::NativeBinary && config.stdio_mode != StdioMode::Inherit {
            // The consensus binary's ML helper talks to its parent over
            // inherited descriptors; anything else severs that channel.
            return Err(SupervisorError::InvalidConfig(
                config.name.clone(),
                "native binaries must inherit stdio".to_string(),
            ));
        }

        let mut registry = self.inner.registry.lock().expect("registry poisoned");
        if registry.contains_key(&config.name) {
            return Err(SupervisorError::AlreadyRegistered(config.name));
        }
        info!(service = %config.name, kind = ?config.kind, "Service registered");
        registry.insert(config.name.clone(), Arc::new(config));
        Ok(())
    }

    /// Remove a terminal-state service from the registry. Used when
    /// per-tab terminal services are torn down so their names recycle.
    pub fn unregister(&self, name: &str) -> Result<(), SupervisorError> {
        if let Some(instance) = self.inner.instances.get(name)
            && !instance.state().is_terminal()
        {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        self.inner.instances.remove(name);
        self.inner
            .registry
            .lock()
            .expect("registry poisoned")
            .remove(name);
        Ok(())
    }

    /// Start a registered service and drive it to `running`, applying
    /// the restart policy to crashes on the way up.
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.inner.start_service(name, 0).await
    }

    /// Stop a service: polite termination, short grace, forceful kill.
    /// Port released, pid forgotten, instance removed. No-op when the
    /// service is unknown or already gone.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let Some(instance) = self.inner.instances.get(name).map(|e| e.value().clone()) else {
            return Ok(());
        };

        let mut notified = std::pin::pin!(instance.exited.notified());
        notified.as_mut().enable();

        if !instance.state().is_terminal() {
            instance.set_state(ProcessState::Stopping);
            instance.cancel.cancel();
            // The watcher (or the start call observing the cancel) runs
            // the kill ladder and notifies. If the owning future was
            // dropped mid-start there is nobody to answer; fall back to
            // signalling the process group directly.
            if tokio::time::timeout(ORPHANED_STOP_WAIT, notified).await.is_err() {
                warn!(service = %name, "No exit watcher answered the stop; killing directly");
                let pid = instance.shared.lock().expect("instance poisoned").pid;
                if let Some(pid) = pid {
                    kill_group_by_pid(pid).await;
                }
                self.inner.release_resources(&instance).await;
                instance.set_state(ProcessState::Stopped);
                self.inner.emit(ProcessEvent::ProcessStopped {
                    name: name.to_string(),
                });
            }
        }
        self.inner.instances.remove(name);
        Ok(())
    }

    pub fn status(&self, name: &str) -> Option<ProcessSnapshot> {
        if let Some(instance) = self.inner.instances.get(name) {
            return Some(instance.snapshot());
        }
        let registry = self.inner.registry.lock().expect("registry poisoned");
        registry.get(name).map(|config| ProcessSnapshot {
            name: config.name.clone(),
            state: ProcessState::Idle,
            pid: None,
            port: None,
            restart_count: 0,
            started_at: None,
            last_error: None,
        })
    }

    pub fn statuses(&self) -> Vec<ProcessSnapshot> {
        self.inner
            .instances
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Port of a service that is actually `running`; the command surface
    /// must never hand out a port for anything else.
    pub fn running_port(&self, name: &str) -> Option<u16> {
        self.status(name)
            .filter(|s| s.state == ProcessState::Running)
            .and_then(|s| s.port)
    }

    /// Names of live services in teardown order: Normal priority first,
    /// Critical last (terminals before the backend).
    pub fn teardown_order(&self) -> Vec<String> {
        let mut live: Vec<(ServicePriority, String)> = self
            .inner
            .instances
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .map(|entry| (entry.value().config.priority, entry.key().clone()))
            .collect();
        live.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        live.into_iter().map(|(_, name)| name).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }

    /// Register an application-level handler for one IPC message type.
    pub fn register_ipc_handler(&self, message_type: impl Into<String>, handler: IpcHandler) {
        self.inner.ipc_handlers.register(message_type, handler);
    }

    /// Send an envelope to an interpreted child over its IPC channel.
    #[cfg(unix)]
    pub async fn send_ipc(
        &self,
        name: &str,
        envelope: serde_json::Value,
    ) -> Result<(), SupervisorError> {
        let instance = self
            .inner
            .instances
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| SupervisorError::NotRegistered(name.to_string()))?;
        let sender = instance
            .ipc_outbound
            .lock()
            .expect("instance poisoned")
            .clone();
        let Some(sender) = sender else {
            return Err(SupervisorError::IpcUnavailable(name.to_string()));
        };
        sender
            .send(envelope)
            .await
            .map_err(|_| SupervisorError::IpcUnavailable(name.to_string()))
    }
}
