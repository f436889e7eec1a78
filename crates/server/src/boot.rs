//! The canonical boot plan and the state slots its steps fill.
//!
//! Steps hand their products to later steps (and to teardown) through
//! write-once slots; the orchestrator itself stays generic.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use db::DBService;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use services::services::{
    cli_tools::CliToolService,
    events::EventBus,
    orchestrator::{BootError, BootStep},
    pid_tracker::PidTracker,
    port_pool::{BACKEND_POOL, DEBUG_SERVER_POOL, MEMORY_SERVICE_POOL, PortPool, load_port_ranges},
    service_names,
    supervisor::{
        ExecutableKind, HealthProbe, ProcessSupervisor, ServiceConfig, ServicePriority,
    },
    terminal_tabs::TerminalTabManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{AppState, routes};

/// Write-once products of the boot steps.
pub struct BootSlots {
    pub events: Arc<EventBus>,
    pub pids: Arc<PidTracker>,
    pub db: Arc<OnceLock<DBService>>,
    pub supervisor: Arc<OnceLock<ProcessSupervisor>>,
    pub terminals: Arc<OnceLock<Arc<TerminalTabManager>>>,
    pub tools: Arc<OnceLock<CliToolService>>,
    /// Cancelling this token drains the command-surface listener.
    pub server_shutdown: CancellationToken,
    pub bound_addr: Arc<OnceLock<SocketAddr>>,
}

impl BootSlots {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            pids: Arc::new(PidTracker::for_installation()),
            db: Arc::new(OnceLock::new()),
            supervisor: Arc::new(OnceLock::new()),
            terminals: Arc::new(OnceLock::new()),
            tools: Arc::new(OnceLock::new()),
            server_shutdown: CancellationToken::new(),
            bound_addr: Arc::new(OnceLock::new()),
        }
    }
}

fn memory_service_script() -> PathBuf {
    std::env::var("LOOM_MEMORY_SERVICE_SCRIPT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| utils::assets::asset_dir().join("services/memory/main.py"))
}

fn backend_binary() -> PathBuf {
    std::env::var("LOOM_BACKEND_BINARY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| utils::assets::asset_dir().join("bin/loom-consensus"))
}

fn terminal_server_binary() -> PathBuf {
    std::env::var("LOOM_TERMINAL_SERVER")
        .map(PathBuf::from)
        .unwrap_or_else(|_| utils::assets::asset_dir().join("bin/ttyd"))
}

/// db → supervisor → ipc → memory → backend → tools.
pub fn canonical_plan(slots: &BootSlots) -> Vec<BootStep> {
    vec![
        db_step(slots),
        supervisor_step(slots),
        ipc_step(slots),
        memory_step(slots),
        backend_step(slots),
        tools_step(slots),
    ]
}

fn db_step(slots: &BootSlots) -> BootStep {
    let db_slot = slots.db.clone();
    let pids = slots.pids.clone();
    BootStep::new(
        "db",
        "Database",
        true,
        15,
        Box::new(move |_cancel| {
            Box::pin(async move {
                let db = DBService::new()
                    .await
                    .map_err(|e| BootError::step("db", e))?;

                // Stranded children from a previous run die before any
                // new spawn can collide with them.
                match pids.reap_orphans().await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "Reaped orphaned child processes"),
                    Err(e) => warn!(error = %e, "Orphan reaping failed"),
                }

                db_slot
                    .set(db)
                    .map_err(|_| BootError::step("db", "database initialized twice"))
            }) as BoxFuture<'static, Result<(), BootError>>
        }),
    )
}

fn supervisor_step(slots: &BootSlots) -> BootStep {
    let supervisor_slot = slots.supervisor.clone();
    let pids = slots.pids.clone();
    let events = slots.events.clone();
    BootStep::new(
        "supervisor",
        "Process Manager",
        true,
        10,
        Box::new(move |_cancel| {
            Box::pin(async move {
                let ranges = load_port_ranges(Some(&utils::assets::port_config_path()))
                    .map_err(|e| BootError::step("supervisor", e))?;
                let ports = Arc::new(PortPool::new());
                ports
                    .initialize(ranges)
                    .await
                    .map_err(|e| BootError::step("supervisor", e))?;

                let supervisor = ProcessSupervisor::new(ports, pids);
                events.forward_process_events(supervisor.subscribe());
                supervisor_slot
                    .set(supervisor)
                    .map_err(|_| BootError::step("supervisor", "supervisor initialized twice"))
            }) as BoxFuture<'static, Result<(), BootError>>
        }),
    )
}

fn ipc_step(slots: &BootSlots) -> BootStep {
    let db_slot = slots.db.clone();
    let supervisor_slot = slots.supervisor.clone();
    let terminals_slot = slots.terminals.clone();
    let tools_slot = slots.tools.clone();
    let bound_addr = slots.bound_addr.clone();
    let events = slots.events.clone();
    let server_shutdown = slots.server_shutdown.clone();
    BootStep::new(
        "ipc",
        "IPC Handlers",
        true,
        10,
        Box::new(move |_cancel| {
            Box::pin(async move {
                let db = db_slot
                    .get()
                    .cloned()
                    .ok_or_else(|| BootError::step("ipc", "database step did not run"))?;
                let supervisor = supervisor_slot
                    .get()
                    .cloned()
                    .ok_or_else(|| BootError::step("ipc", "supervisor step did not run"))?;

                let terminals = TerminalTabManager::new(
                    supervisor.clone(),
                    db.pool.clone(),
                    events.clone(),
                    terminal_server_binary(),
                );
                let tools = CliToolService::new(db.pool.clone(), supervisor.clone());

                // Children may ask where their siblings live.
                let supervisor_for_ipc = supervisor.clone();
                supervisor.register_ipc_handler(
                    "service-port",
                    Arc::new(move |envelope: Value| {
                        let supervisor = supervisor_for_ipc.clone();
                        Box::pin(async move {
                            let service = envelope
                                .get("service")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            let reply = match supervisor.running_port(&service) {
                                Some(port) => json!({ "ok": true, "port": port }),
                                None => json!({ "ok": false, "error": "service not running" }),
                            };
                            Some(reply)
                        }) as BoxFuture<'static, Option<Value>>
                    }),
                );

                // The command surface itself draws from the debug pool;
                // nothing in the core hardcodes its port either.
                let port = supervisor
                    .ports()
                    .allocate_for_service(service_names::COMMAND_SURFACE, DEBUG_SERVER_POOL)
                    .await
                    .map_err(|e| BootError::step("ipc", e))?;
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                    .await
                    .map_err(|e| BootError::step("ipc", e))?;
                let addr = listener
                    .local_addr()
                    .map_err(|e| BootError::step("ipc", e))?;

                let state = AppState {
                    db,
                    supervisor,
                    terminals: terminals.clone(),
                    tools: tools.clone(),
                    events,
                };
                let router = routes::router(state);
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, router)
                        .with_graceful_shutdown(server_shutdown.cancelled_owned())
                        .await
                    {
                        tracing::error!(error = %e, "Command surface exited with error");
                    }
                });
                info!(%addr, "Command surface listening");

                let _ = bound_addr.set(addr);
                let _ = terminals_slot.set(terminals);
                let _ = tools_slot.set(tools);
                Ok(())
            }) as BoxFuture<'static, Result<(), BootError>>
        }),
    )
}

fn memory_step(slots: &BootSlots) -> BootStep {
    let supervisor_slot = slots.supervisor.clone();
    BootStep::new(
        "memory",
        "Memory Service",
        false,
        20,
        Box::new(move |_cancel| {
            Box::pin(async move {
                let supervisor = supervisor_slot
                    .get()
                    .cloned()
                    .ok_or_else(|| BootError::step("memory", "supervisor step did not run"))?;

                let config = ServiceConfig::new(
                    service_names::MEMORY_SERVICE,
                    ExecutableKind::InterpretedScript,
                    memory_service_script(),
                )
                .with_pool(MEMORY_SERVICE_POOL)
                .with_priority(ServicePriority::High)
                .with_health_probe(HealthProbe::new("/health"));

                supervisor
                    .register(config)
                    .map_err(|e| BootError::step("memory", e))?;
                supervisor
                    .start(service_names::MEMORY_SERVICE)
                    .await
                    .map_err(|e| BootError::step("memory", e))?;
                Ok(())
            }) as BoxFuture<'static, Result<(), BootError>>
        }),
    )
    .with_progress_from(service_names::MEMORY_SERVICE)
}

fn backend_step(slots: &BootSlots) -> BootStep {
    let supervisor_slot = slots.supervisor.clone();
    BootStep::new(
        "backend",
        "Backend + Consensus",
        true,
        25,
        Box::new(move |_cancel| {
            Box::pin(async move {
                let supervisor = supervisor_slot
                    .get()
                    .cloned()
                    .ok_or_else(|| BootError::step("backend", "supervisor step did not run"))?;

                // Readiness comes from the port probe; the binary's
                // stdout is inherited and never scraped.
                let config = ServiceConfig::new(
                    service_names::BACKEND,
                    ExecutableKind::NativeBinary,
                    backend_binary(),
                )
                .with_pool(BACKEND_POOL)
                .with_priority(ServicePriority::Critical);

                supervisor
                    .register(config)
                    .map_err(|e| BootError::step("backend", e))?;
                supervisor
                    .start(service_names::BACKEND)
                    .await
                    .map_err(|e| BootError::step("backend", e))?;
                Ok(())
            }) as BoxFuture<'static, Result<(), BootError>>
        }),
    )
    .with_progress_from(service_names::BACKEND)
}

fn tools_step(slots: &BootSlots) -> BootStep {
    let tools_slot = slots.tools.clone();
    BootStep::new(
        "tools",
        "CLI Tool Detection",
        false,
        15,
        Box::new(move |_cancel| {
            Box::pin(async move {
                let tools = tools_slot
                    .get()
                    .cloned()
                    .ok_or_else(|| BootError::step("tools", "ipc step did not run"))?;
                let statuses = tools.detect_all().await;
                let installed = statuses.iter().filter(|s| s.installed).count();
                info!(
                    installed,
                    total = statuses.len(),
                    "CLI tool detection finished"
                );
                Ok(())
            }) as BoxFuture<'static, Result<(), BootError>>
        }),
    )
}
