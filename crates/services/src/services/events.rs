//! Process-wide event bus for everything the UI observes.
//!
//! Splash progress, project-context changes and the supervisor's process
//! lifecycle all fan out through one broadcast channel; the server
//! exposes it as an SSE stream. Events are fire-and-forget: a bus with
//! no subscribers drops them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use ts_rs::TS;

use super::supervisor::ProcessEvent;

#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[ts(export)]
pub enum AppEvent {
    /// Splash progress. Percentages never go backward.
    SplashUpdate { percent: u8, message: String },
    /// The file explorer, VCS view and status bar reorient to this
    /// project before a tool tab opens in it.
    ProjectContextChanged { path: String },
    /// A required boot step failed; the splash surfaces the reason.
    BootFailed { step: String, message: String },
    BootCompleted,
}

/// Either an application event or a supervisor lifecycle event, as one
/// self-tagged JSON stream.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(untagged)]
#[ts(export)]
pub enum UiEvent {
    App(AppEvent),
    Process(ProcessEvent),
}

pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn emit(&self, event: AppEvent) {
        debug!(?event, "App event");
        let _ = self.tx.send(UiEvent::App(event));
    }

    pub fn emit_process(&self, event: ProcessEvent) {
        let _ = self.tx.send(UiEvent::Process(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    /// Pump supervisor events onto the bus for the lifetime of the
    /// receiver.
    pub fn forward_process_events(
        self: &Arc<Self>,
        mut process_events: broadcast::Receiver<ProcessEvent>,
    ) {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                match process_events.recv().await {
                    Ok(event) => bus.emit_process(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(AppEvent::ProjectContextChanged {
            path: "/projects/x".to_string(),
        });

        let event = rx.recv().await.unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"project-context-changed\""));
        assert!(json.contains("/projects/x"));
    }

    #[tokio::test]
    async fn test_process_events_are_forwarded() {
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = broadcast::channel(8);
        bus.forward_process_events(rx);
        let mut ui_rx = bus.subscribe();

        tx.send(ProcessEvent::ProcessStopped {
            name: "backend".to_string(),
        })
        .unwrap();

        let event = ui_rx.recv().await.unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"process-stopped\""));
    }

    #[tokio::test]
    async fn test_untagged_union_keeps_inner_tags() {
        let event = UiEvent::App(AppEvent::SplashUpdate {
            percent: 45,
            message: "Backend + Consensus …".to_string(),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"splash-update\""));
        assert!(json.contains("\"percent\":45"));
    }
}
