//! Service modules for the loom orchestration core.
//!
//! Dependency direction is strictly downward: the orchestrator and the
//! terminal tab manager sit on top of the supervisor, which sits on top
//! of the port pool and the pid tracker. Events are the only channel
//! flowing back up.

/// Names of the long-lived services the boot plan registers.
pub mod service_names {
    pub const MEMORY_SERVICE: &str = "memory-service";
    pub const BACKEND: &str = "backend";
    /// The core's own command surface (the UI-facing HTTP listener).
    pub const COMMAND_SURFACE: &str = "command-surface";
}

pub mod cli_tools;
pub mod events;
pub mod orchestrator;
pub mod pid_tracker;
pub mod port_pool;
pub mod shutdown;
pub mod supervisor;
pub mod terminal_tabs;
pub mod tool_registry;
