//! Service registration records.
//!
//! A [`ServiceConfig`] is immutable once registered; everything the
//! supervisor needs to spawn, observe and restart a child is captured
//! here.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// How a child is spawned and how its readiness is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ExecutableKind {
    /// A script run by the bundled interpreter, with a JSON IPC channel
    /// on the fourth descriptor. Ready when the child sends `ready`.
    InterpretedScript,
    /// A native executable. Ready when its allocated port accepts a
    /// local TCP connection. Must inherit stdio so its own subprocesses
    /// can communicate over inherited descriptors.
    NativeBinary,
    /// A bundled terminal server bound to loopback; the webview attaches
    /// to its HTTP endpoint.
    TerminalServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum StdioMode {
    Inherit,
    PipeWithIpc,
}

/// Teardown runs in reverse priority order: Normal first, Critical last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ServicePriority {
    Critical,
    High,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restart attempts after the initial one.
    pub max_attempts: u32,
    /// Pause before each restart.
    pub delay: Duration,
}

impl RestartPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Periodic HTTP liveness probe against the allocated port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    /// Request path, e.g. `/health`.
    pub path: String,
    pub interval: Duration,
}

impl HealthProbe {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            interval: Duration::from_secs(30),
        }
    }
}

/// Registration record for one supervised service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Unique name; also the key ports are allocated under.
    pub name: String,
    pub kind: ExecutableKind,
    /// Script path for interpreted children, binary path otherwise.
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Overlaid on the inherited parent environment.
    pub env: HashMap<String, String>,
    pub requires_port: bool,
    /// Pool to draw from; required when `requires_port` is set.
    pub pool_name: Option<String>,
    pub restart_policy: RestartPolicy,
    pub health_probe: Option<HealthProbe>,
    pub priority: ServicePriority,
    pub stdio_mode: StdioMode,
    /// Terminal servers only: command to run before dropping into an
    /// interactive shell.
    pub initial_command: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, kind: ExecutableKind, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            requires_port: false,
            pool_name: None,
            restart_policy: RestartPolicy::default(),
            health_probe: None,
            priority: ServicePriority::Normal,
            stdio_mode: match kind {
                ExecutableKind::InterpretedScript => StdioMode::PipeWithIpc,
                _ => StdioMode::Inherit,
            },
            initial_command: None,
            working_dir: None,
        }
    }

    pub fn with_pool(mut self, pool_name: impl Into<String>) -> Self {
        self.requires_port = true;
        self.pool_name = Some(pool_name.into());
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: ServicePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_health_probe(mut self, probe: HealthProbe) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn with_initial_command(mut self, command: impl Into<String>) -> Self {
        self.initial_command = Some(command.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Service-specific port variable: uppercased, hyphens to
    /// underscores, `_PORT` suffix (`memory-service` → `MEMORY_SERVICE_PORT`).
    pub fn port_env_var(&self) -> String {
        format!("{}_PORT", self.name.to_uppercase().replace('-', "_"))
    }

    /// Executable name recorded next to the pid for orphan matching.
    pub fn image_label(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Resolve the bundled interpreter for interpreted-kind children.
///
/// Release builds read the path written at install time into the
/// `.env.production`-style file and use it verbatim. Development builds
/// walk a priority list: project venvs first, then the system.
pub fn resolve_interpreter() -> Option<PathBuf> {
    if !cfg!(debug_assertions) {
        let env_file = utils::assets::production_env_path();
        if let Ok(entries) = dotenvy::from_path_iter(&env_file) {
            for entry in entries.flatten() {
                if entry.0 == "LOOM_INTERPRETER_PATH" {
                    return Some(PathBuf::from(entry.1));
                }
            }
        }
    }

    for candidate in ["venv/bin/python3", ".venv/bin/python3"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    which::which("python3")
        .or_else(|_| which::which("python"))
        .ok()
}
