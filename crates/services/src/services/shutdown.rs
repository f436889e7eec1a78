//! The unified cleanup routine.
//!
//! Exactly one cleanup may execute per process, however many exit
//! signals fire: a reentrancy guard short-circuits every entry after the
//! first. Terminal tabs close first, then every supervised process in
//! reverse dependency order (terminals before the backend), then the pid
//! file is flushed so the next boot finds a clean set.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, info, warn};

use super::{
    pid_tracker::PidTracker, supervisor::ProcessSupervisor, terminal_tabs::TerminalTabManager,
};

pub struct UnifiedCleanup {
    ran: AtomicBool,
    terminals: Arc<TerminalTabManager>,
    supervisor: ProcessSupervisor,
    pids: Arc<PidTracker>,
}

impl UnifiedCleanup {
    pub fn new(
        terminals: Arc<TerminalTabManager>,
        supervisor: ProcessSupervisor,
        pids: Arc<PidTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ran: AtomicBool::new(false),
            terminals,
            supervisor,
            pids,
        })
    }

    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }

    /// Idempotent teardown of everything the core owns.
    pub async fn run(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            debug!("Cleanup already ran; ignoring re-entry");
            return;
        }
        info!("Unified cleanup starting");

        self.terminals.close_all().await;

        for name in self.supervisor.teardown_order() {
            if let Err(e) = self.supervisor.stop(&name).await {
                warn!(service = %name, error = %e, "Failed to stop service during teardown");
            }
        }

        if let Err(e) = self.pids.flush().await {
            warn!(error = %e, "Failed to flush pid file during teardown");
        }
        info!("Unified cleanup finished");
    }
}
