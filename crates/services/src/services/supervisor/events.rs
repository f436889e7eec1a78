//! Lifecycle events emitted by the supervisor.
//!
//! Events for a single instance are emitted in state-machine order; no
//! ordering holds across instances.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Coarse progress milestones reported while a service is coming up.
///
/// Interpreted children report these over IPC; native children only ever
/// produce `waiting` (from the port probe) and `ready`. The startup
/// orchestrator maps them to splash percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ProgressStatus {
    Starting,
    Database,
    Consensus,
    Models,
    AiHelpers,
    Waiting,
    Ready,
}

/// Why a service failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum FailureReason {
    NoPort,
    SpawnFailed,
    RestartExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[ts(export)]
pub enum ProcessEvent {
    ProcessStarted {
        name: String,
        pid: u32,
        port: Option<u16>,
    },
    ProcessReady {
        name: String,
        port: Option<u16>,
    },
    ProcessProgress {
        name: String,
        status: ProgressStatus,
        message: String,
        port: Option<u16>,
    },
    ProcessUnhealthy {
        name: String,
    },
    ProcessStopped {
        name: String,
    },
    ProcessFailed {
        name: String,
        reason: FailureReason,
        message: String,
    },
}

impl ProcessEvent {
    pub fn service_name(&self) -> &str {
        match self {
            ProcessEvent::ProcessStarted { name, .. }
            | ProcessEvent::ProcessReady { name, .. }
            | ProcessEvent::ProcessProgress { name, .. }
            | ProcessEvent::ProcessUnhealthy { name }
            | ProcessEvent::ProcessStopped { name }
            | ProcessEvent::ProcessFailed { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_uses_kebab_case_tags() {
        let event = ProcessEvent::ProcessFailed {
            name: "backend".to_string(),
            reason: FailureReason::NoPort,
            message: "No port available in pool 'backend-service'".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"process-failed\""));
        assert!(json.contains("\"reason\":\"no-port\""));
    }

    #[test]
    fn test_progress_status_serialization() {
        let json = serde_json::to_string(&ProgressStatus::AiHelpers).unwrap();
        assert_eq!(json, "\"ai-helpers\"");
    }
}
