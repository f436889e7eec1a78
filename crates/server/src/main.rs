use std::sync::Arc;

use async_trait::async_trait;
use server::{boot, file_logging};
use services::services::{
    events::EventBus,
    orchestrator::{BootError, StartupOrchestrator, WindowShell},
    shutdown::UnifiedCleanup,
};
use tracing::{error, info, warn};

/// Shell implementation for the headless binary: no splash, no webview,
/// the main window counts as loaded the moment boot finishes. The
/// desktop shell supplies the real implementation.
struct HeadlessShell;

#[async_trait]
impl WindowShell for HeadlessShell {
    async fn wait_did_finish_load(&self) {}
    fn is_main_frame_loading(&self) -> bool {
        false
    }
    async fn destroy_splash(&self) {
        info!("Splash dismissed");
    }
    async fn focus_main(&self) {
        info!("Main window focused");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development)
    dotenvy::dotenv().ok();

    // The guard must be held for the lifetime of the application to
    // ensure logs are flushed
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _file_log_guard = file_logging::init_logging(&log_level);

    // A panic anywhere (including spawned tasks) requests shutdown so
    // the unified cleanup still runs.
    let (panic_tx, mut panic_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    std::panic::set_hook(Box::new(move |info| {
        error!("Panic: {info}");
        let _ = panic_tx.send(());
    }));

    let events = Arc::new(EventBus::new());
    let slots = boot::BootSlots::new(events.clone());
    let orchestrator = StartupOrchestrator::new(events.clone());
    let plan = boot::canonical_plan(&slots);

    let boot_result = {
        let run = orchestrator.run(plan, events.subscribe());
        tokio::pin!(run);
        let mut cancelled = false;
        loop {
            tokio::select! {
                result = &mut run => break result,
                _ = shutdown_signal(), if !cancelled => {
                    warn!("Exit requested during boot; cancelling");
                    orchestrator.cancel_token().cancel();
                    cancelled = true;
                }
                _ = panic_rx.recv(), if !cancelled => {
                    warn!("Panic during boot; cancelling");
                    orchestrator.cancel_token().cancel();
                    cancelled = true;
                }
            }
        }
    };

    match &boot_result {
        Ok(report) => {
            for (step, reason) in &report.skipped {
                warn!(step, reason, "Optional service unavailable this session");
            }
            orchestrator.finish(&HeadlessShell).await;
            if let Some(addr) = slots.bound_addr.get() {
                info!("Application ready; command surface on http://{addr}");
            }

            tokio::select! {
                _ = shutdown_signal() => info!("Exit signal received"),
                _ = panic_rx.recv() => error!("Panic reported; shutting down"),
            }
        }
        Err(BootError::Cancelled) => info!("Boot cancelled"),
        Err(e) => error!("Boot failed: {e}"),
    }

    teardown(&slots).await;

    match boot_result {
        Err(e @ BootError::StepFailed { .. }) | Err(e @ BootError::BadWeights(_)) => Err(e.into()),
        _ => Ok(()),
    }
}

/// Unified teardown across every exit path. The cleanup routine itself
/// carries the reentrancy guard; this wrapper only decides how much of
/// the stack exists to tear down.
async fn teardown(slots: &boot::BootSlots) {
    slots.server_shutdown.cancel();

    match (slots.terminals.get(), slots.supervisor.get()) {
        (Some(terminals), Some(supervisor)) => {
            UnifiedCleanup::new(terminals.clone(), supervisor.clone(), slots.pids.clone())
                .run()
                .await;
        }
        (None, Some(supervisor)) => {
            for name in supervisor.teardown_order() {
                if let Err(e) = supervisor.stop(&name).await {
                    warn!(service = %name, error = %e, "Failed to stop service during teardown");
                }
            }
            if let Err(e) = slots.pids.flush().await {
                warn!(error = %e, "Failed to flush pid file");
            }
        }
        _ => {
            if let Err(e) = slots.pids.flush().await {
                warn!(error = %e, "Failed to flush pid file");
            }
        }
    }

    if let Some(db) = slots.db.get() {
        db.shutdown().await;
    }
}

pub async fn shutdown_signal() {
    // Always wait for Ctrl+C
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        // Try to install SIGTERM handler, but don't panic if it fails
        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                error!("Failed to install SIGTERM handler");
                // Fallback: never resolves
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        // Only ctrl_c is available, so just await it
        ctrl_c.await;
    }
}
