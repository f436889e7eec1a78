//! Startup orchestrator (C4): the weighted, event-driven boot pipeline.
//!
//! Steps run strictly in declaration order. No step carries a deadline;
//! a slow step keeps emitting progress instead of failing. The only way
//! out of a step early is the cooperative cancel token, wired to the
//! splash window's close button.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    events::{AppEvent, EventBus, UiEvent},
    supervisor::{ProcessEvent, ProgressStatus},
};

/// How long to wait for the main window's `did-finish-load` before
/// falling back to polling its loading flag. Some signing/notarization
/// environments drop the event entirely.
const MAIN_WINDOW_LOAD_FALLBACK: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BootError {
    #[error("{step}: {message}")]
    StepFailed { step: String, message: String },

    #[error("Boot was cancelled")]
    Cancelled,

    #[error("Boot plan weights sum to {0}, exceeding 100")]
    BadWeights(u16),
}

impl BootError {
    pub fn step(step: impl Into<String>, message: impl ToString) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

pub type StepInit = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), BootError>> + Send>;

/// One entry of the boot plan. Weights across the plan budget the
/// splash bar; the completion emit tops it out at 100.
pub struct BootStep {
    pub id: &'static str,
    pub display_name: &'static str,
    pub required: bool,
    pub weight: u8,
    /// When set, `process-progress` events from this service are mapped
    /// into this step's percentage band while it runs.
    pub progress_service: Option<&'static str>,
    pub init: StepInit,
}

impl BootStep {
    pub fn new(
        id: &'static str,
        display_name: &'static str,
        required: bool,
        weight: u8,
        init: StepInit,
    ) -> Self {
        Self {
            id,
            display_name,
            required,
            weight,
            progress_service: None,
            init,
        }
    }

    pub fn with_progress_from(mut self, service: &'static str) -> Self {
        self.progress_service = Some(service);
        self
    }
}

/// What happened to each step.
#[derive(Debug, Default)]
pub struct BootReport {
    pub completed: Vec<&'static str>,
    /// Optional steps that failed, with their reasons.
    pub skipped: Vec<(&'static str, String)>,
}

/// Host-shell seam: splash and main window, driven but not rendered by
/// the core.
#[async_trait]
pub trait WindowShell: Send + Sync {
    /// Resolves when the main window reports its content finished
    /// loading. May never resolve in broken environments.
    async fn wait_did_finish_load(&self);
    fn is_main_frame_loading(&self) -> bool;
    async fn destroy_splash(&self);
    async fn focus_main(&self);
}

/// Monotonic splash percentage: the splash is never fed a number lower
/// than one it has already shown.
struct SplashProgress {
    events: Arc<EventBus>,
    last: Mutex<u8>,
}

impl SplashProgress {
    fn emit(&self, percent: u8, message: impl Into<String>) {
        let percent = percent.min(100);
        let mut last = self.last.lock().expect("progress poisoned");
        let clamped = percent.max(*last);
        *last = clamped;
        self.events.emit(AppEvent::SplashUpdate {
            percent: clamped,
            message: message.into(),
        });
    }
}

/// Fixed translation from child progress milestones to points within a
/// step's weight band.
fn progress_points(status: ProgressStatus) -> u8 {
    match status {
        ProgressStatus::Starting => 2,
        ProgressStatus::Waiting => 8,
        ProgressStatus::Database => 13,
        ProgressStatus::Consensus => 17,
        ProgressStatus::Models => 20,
        ProgressStatus::AiHelpers => 23,
        ProgressStatus::Ready => 25,
    }
}

pub struct StartupOrchestrator {
    events: Arc<EventBus>,
    progress: Arc<SplashProgress>,
    cancel: CancellationToken,
}

impl StartupOrchestrator {
    pub fn new(events: Arc<EventBus>) -> Self {
        let progress = Arc::new(SplashProgress {
            events: events.clone(),
            last: Mutex::new(0),
        });
        Self {
            events,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Token the host wires to the splash window's close action.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the plan sequentially. Required-step failure aborts with
    /// the underlying error; optional-step failure logs and continues.
    ///
    /// `ui_events` is a bus subscription taken before boot begins; the
    /// supervisor's progress events arrive through it once the
    /// `supervisor` step wires forwarding up.
    pub async fn run(
        &self,
        plan: Vec<BootStep>,
        ui_events: tokio::sync::broadcast::Receiver<UiEvent>,
    ) -> Result<BootReport, BootError> {
        // Weights budget the bar up to 100; the completion emit covers
        // whatever headroom the plan leaves.
        let total: u16 = plan.iter().map(|s| s.weight as u16).sum();
        if total > 100 {
            return Err(BootError::BadWeights(total));
        }

        // Base percentage of every progress-mapped step, computed from
        // the declared order.
        let mut bases: HashMap<&'static str, u8> = HashMap::new();
        let mut acc = 0u8;
        for step in &plan {
            if let Some(service) = step.progress_service {
                bases.insert(service, acc);
            }
            acc += step.weight;
        }
        let translator = self.spawn_progress_translator(bases, ui_events);

        let mut report = BootReport::default();
        let mut completed_weight = 0u8;
        for step in plan {
            if self.cancel.is_cancelled() {
                translator.abort();
                return Err(BootError::Cancelled);
            }

            self.progress
                .emit(completed_weight, format!("{} …", step.display_name));
            info!(step = step.id, "Boot step starting");

            let step_cancel = self.cancel.child_token();
            let init = (step.init)(step_cancel);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(BootError::Cancelled),
                result = init => result,
            };

            match result {
                Ok(()) => {
                    completed_weight += step.weight;
                    info!(step = step.id, "Boot step completed");
                    report.completed.push(step.id);
                }
                Err(BootError::Cancelled) => {
                    translator.abort();
                    return Err(BootError::Cancelled);
                }
                Err(e) if step.required => {
                    error!(step = step.id, error = %e, "Required boot step failed");
                    self.events.emit(AppEvent::BootFailed {
                        step: step.id.to_string(),
                        message: e.to_string(),
                    });
                    translator.abort();
                    return Err(e);
                }
                Err(e) => {
                    warn!(step = step.id, error = %e, "Optional boot step failed; continuing");
                    report.skipped.push((step.id, e.to_string()));
                    // The bar still has to reach 100.
                    completed_weight += step.weight;
                }
            }
        }
        translator.abort();

        self.progress.emit(100, "Ready");
        self.events.emit(AppEvent::BootCompleted);
        Ok(report)
    }

    /// Hand over from splash to main window once all required steps are
    /// done. Event-or-poll double check: wait for `did-finish-load`, but
    /// proceed after the fallback window regardless.
    pub async fn finish(&self, shell: &dyn WindowShell) {
        let loaded =
            tokio::time::timeout(MAIN_WINDOW_LOAD_FALLBACK, shell.wait_did_finish_load()).await;
        if loaded.is_err() {
            if shell.is_main_frame_loading() {
                warn!("Main window load signal missed and frame still loading; proceeding anyway");
            } else {
                info!("Main window load signal missed but frame is loaded; proceeding");
            }
        }
        shell.destroy_splash().await;
        shell.focus_main().await;
    }

    fn spawn_progress_translator(
        &self,
        bases: HashMap<&'static str, u8>,
        mut ui_events: tokio::sync::broadcast::Receiver<UiEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let progress = self.progress.clone();
        tokio::spawn(async move {
            loop {
                match ui_events.recv().await {
                    Ok(UiEvent::Process(ProcessEvent::ProcessProgress {
                        name,
                        status,
                        message,
                        ..
                    })) => {
                        if let Some(base) = bases.get(name.as_str()) {
                            progress.emit(base + progress_points(status), message);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::services::events::UiEvent;

    fn step(
        id: &'static str,
        required: bool,
        weight: u8,
        result: Result<(), BootError>,
    ) -> BootStep {
        BootStep::new(
            id,
            id,
            required,
            weight,
            Box::new(move |_cancel| Box::pin(async move { result })),
        )
    }

    fn detached_ui_rx() -> tokio::sync::broadcast::Receiver<UiEvent> {
        let (tx, rx) = tokio::sync::broadcast::channel(8);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_weights_must_not_exceed_100() {
        let orchestrator = StartupOrchestrator::new(Arc::new(EventBus::new()));
        let plan = vec![step("a", true, 60, Ok(())), step("b", true, 80, Ok(()))];
        assert!(matches!(
            orchestrator.run(plan, detached_ui_rx()).await,
            Err(BootError::BadWeights(140))
        ));
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_report_completion() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut plan = Vec::new();
        for (id, weight) in [("db", 30u8), ("supervisor", 30), ("ipc", 40)] {
            let order = order.clone();
            plan.push(BootStep::new(
                id,
                id,
                true,
                weight,
                Box::new(move |_| {
                    Box::pin(async move {
                        order.lock().unwrap().push(id);
                        Ok(())
                    })
                }),
            ));
        }

        let orchestrator = StartupOrchestrator::new(Arc::new(EventBus::new()));
        let report = orchestrator.run(plan, detached_ui_rx()).await.unwrap();
        assert_eq!(report.completed, vec!["db", "supervisor", "ipc"]);
        assert_eq!(*order.lock().unwrap(), vec!["db", "supervisor", "ipc"]);
    }

    #[tokio::test]
    async fn test_required_failure_aborts_and_skips_rest() {
        let ran_after = Arc::new(AtomicBool::new(false));
        let ran_after2 = ran_after.clone();

        let plan = vec![
            step("db", true, 50, Err(BootError::step("db", "disk on fire"))),
            BootStep::new(
                "after",
                "after",
                true,
                50,
                Box::new(move |_| {
                    Box::pin(async move {
                        ran_after2.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            ),
        ];

        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let orchestrator = StartupOrchestrator::new(bus);
        let result = orchestrator.run(plan, detached_ui_rx()).await;

        assert!(matches!(result, Err(BootError::StepFailed { .. })));
        assert!(!ran_after.load(Ordering::SeqCst));

        // The failure was surfaced to the splash.
        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let UiEvent::App(AppEvent::BootFailed { step, .. }) = event {
                assert_eq!(step, "db");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped_and_boot_completes() {
        let plan = vec![
            step("db", true, 40, Ok(())),
            step("memory", false, 30, Err(BootError::step("memory", "bad path"))),
            step("backend", true, 30, Ok(())),
        ];

        let orchestrator = StartupOrchestrator::new(Arc::new(EventBus::new()));
        let report = orchestrator.run(plan, detached_ui_rx()).await.unwrap();
        assert_eq!(report.completed, vec!["db", "backend"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "memory");
    }

    #[tokio::test]
    async fn test_splash_percent_is_monotonic_and_reaches_100() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let plan = vec![
            step("a", true, 25, Ok(())),
            step("b", false, 35, Err(BootError::step("b", "nope"))),
            step("c", true, 40, Ok(())),
        ];

        let orchestrator = StartupOrchestrator::new(bus);
        orchestrator.run(plan, detached_ui_rx()).await.unwrap();

        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UiEvent::App(AppEvent::SplashUpdate { percent, .. }) = event {
                percents.push(percent);
            }
        }
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(*percents.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_plan() {
        let steps_run = Arc::new(AtomicUsize::new(0));
        let steps_run2 = steps_run.clone();

        let orchestrator = StartupOrchestrator::new(Arc::new(EventBus::new()));
        let cancel = orchestrator.cancel_token();

        let plan = vec![
            BootStep::new(
                "slow",
                "slow",
                true,
                60,
                Box::new(move |_| {
                    Box::pin(async move {
                        steps_run2.fetch_add(1, Ordering::SeqCst);
                        // Simulates an arbitrarily slow subsystem.
                        tokio::time::sleep(Duration::from_secs(600)).await;
                        Ok(())
                    })
                }),
            ),
            step("never", true, 40, Ok(())),
        ];

        let run = orchestrator.run(plan, detached_ui_rx());
        tokio::pin!(run);

        // Let the first step start, then close the splash.
        tokio::select! {
            _ = &mut run => panic!("run finished unexpectedly"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => cancel.cancel(),
        }

        assert!(matches!(run.await, Err(BootError::Cancelled)));
        assert_eq!(steps_run.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_child_progress_maps_into_step_band() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let boot_subscription = bus.subscribe();
        let bus_for_step = bus.clone();

        let orchestrator = StartupOrchestrator::new(bus);
        let plan = vec![
            step("db", true, 40, Ok(())),
            BootStep::new(
                "backend",
                "Backend + Consensus",
                true,
                60,
                Box::new(move |_| {
                    Box::pin(async move {
                        bus_for_step.emit_process(ProcessEvent::ProcessProgress {
                            name: "backend".to_string(),
                            status: ProgressStatus::Models,
                            message: "Loading models".to_string(),
                            port: None,
                        });
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    })
                }),
            )
            .with_progress_from("backend"),
        ];

        orchestrator.run(plan, boot_subscription).await.unwrap();

        let mut saw_mapped = false;
        while let Ok(event) = rx.try_recv() {
            if let UiEvent::App(AppEvent::SplashUpdate { percent, message }) = event
                && message == "Loading models"
            {
                // Base 40 plus the `models` translation.
                assert_eq!(percent, 60);
                saw_mapped = true;
            }
        }
        assert!(saw_mapped);
    }

    struct MockShell {
        load_signal: Option<tokio::sync::Notify>,
        splash_destroyed: AtomicBool,
        main_focused: AtomicBool,
        loading: AtomicBool,
    }

    #[async_trait]
    impl WindowShell for MockShell {
        async fn wait_did_finish_load(&self) {
            match &self.load_signal {
                Some(notify) => notify.notified().await,
                // The event is missed entirely.
                None => std::future::pending().await,
            }
        }
        fn is_main_frame_loading(&self) -> bool {
            self.loading.load(Ordering::SeqCst)
        }
        async fn destroy_splash(&self) {
            self.splash_destroyed.store(true, Ordering::SeqCst);
        }
        async fn focus_main(&self) {
            self.main_focused.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_finish_proceeds_when_load_event_is_missed() {
        tokio::time::pause();
        let shell = MockShell {
            load_signal: None,
            splash_destroyed: AtomicBool::new(false),
            main_focused: AtomicBool::new(false),
            loading: AtomicBool::new(false),
        };
        let orchestrator = StartupOrchestrator::new(Arc::new(EventBus::new()));
        orchestrator.finish(&shell).await;
        assert!(shell.splash_destroyed.load(Ordering::SeqCst));
        assert!(shell.main_focused.load(Ordering::SeqCst));
    }
}
