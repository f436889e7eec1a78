//! Terminal session manager (C5): named, webview-embeddable terminal
//! tabs, each backed 1:1 by a terminal-server child.
//!
//! Identifier policy: tool tabs carry their registry display name and
//! are singletons per tool; generic tabs take the lowest free positive
//! integer, recycled on close; the system-log tab is a non-terminal
//! singleton that can never be closed. Launch history decides whether a
//! tool starts fresh or with its resume flag.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use dashmap::DashMap;
use db::models::{
    sync_metadata::SyncMetadata,
    tool_launch::{LaunchMetadata, ToolLaunch},
};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use ts_rs::TS;

use super::{
    events::{AppEvent, EventBus},
    port_pool::TERMINALS_POOL,
    supervisor::{
        ExecutableKind, ProcessEvent, ProcessState, ProcessSupervisor, RestartPolicy,
        ServiceConfig, ServicePriority, SupervisorError,
    },
    tool_registry,
};

/// The singleton log view's identifier.
pub const SYSTEM_LOG_TAB: &str = "System Log";

/// Pause between the project-context notice and the tab open, giving the
/// UI one frame to commit the new context.
const PROJECT_CONTEXT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TerminalTabError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tab not found: {0}")]
    TabNotFound(String),

    #[error("The system log tab cannot be closed")]
    TabNotCloseable,

    #[error("{0}")]
    NoPortAvailable(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum TabKind {
    Tool,
    Generic,
    SystemLog,
}

#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct TerminalTab {
    /// "Claude", "Terminal 2", "System Log", …
    pub tab_id: String,
    pub kind: TabKind,
    /// Supervisor service backing this tab; none for the system log.
    pub service_name: Option<String>,
    /// URL the webview embeds.
    pub server_url: Option<String>,
    pub working_dir: Option<String>,
    pub tool_id: Option<String>,
    /// Initial command the terminal ran, resume flag included.
    pub command: Option<String>,
    /// The backing process died; the tab stays until dismissed.
    pub dead: bool,
}

struct TabRecord {
    tab: TerminalTab,
    number: Option<u32>,
}

/// Lowest-free-integer allocator for generic tab labels. Users keep
/// their low, stable numbers instead of watching them grow forever.
struct NumberAllocator {
    free: BTreeSet<u32>,
    next: u32,
}

impl NumberAllocator {
    fn new() -> Self {
        Self {
            free: BTreeSet::new(),
            next: 0,
        }
    }

    fn acquire(&mut self) -> u32 {
        if let Some(smallest) = self.free.pop_first() {
            return smallest;
        }
        self.next += 1;
        self.next
    }

    fn release(&mut self, number: u32) {
        if number <= self.next {
            self.free.insert(number);
        }
    }
}

pub struct TerminalTabManager {
    supervisor: ProcessSupervisor,
    pool: SqlitePool,
    events: Arc<EventBus>,
    /// Bundled terminal-server executable.
    terminal_server_path: PathBuf,
    tabs: DashMap<String, TabRecord>,
    numbers: StdMutex<NumberAllocator>,
    /// Tab order as the UI shows it.
    order: StdMutex<Vec<String>>,
    active: StdMutex<Option<String>>,
}

impl TerminalTabManager {
    pub fn new(
        supervisor: ProcessSupervisor,
        pool: SqlitePool,
        events: Arc<EventBus>,
        terminal_server_path: PathBuf,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            supervisor,
            pool,
            events,
            terminal_server_path,
            tabs: DashMap::new(),
            numbers: StdMutex::new(NumberAllocator::new()),
            order: StdMutex::new(Vec::new()),
            active: StdMutex::new(None),
        });

        manager.insert_tab(
            TerminalTab {
                tab_id: SYSTEM_LOG_TAB.to_string(),
                kind: TabKind::SystemLog,
                service_name: None,
                server_url: None,
                working_dir: None,
                tool_id: None,
                command: None,
                dead: false,
            },
            None,
        );

        Self::spawn_death_watcher(manager.clone());
        manager
    }

    /// Open a numbered generic terminal in `cwd`, optionally running a
    /// command before the interactive shell.
    pub async fn open_generic(
        &self,
        cwd: &Path,
        command: Option<String>,
    ) -> Result<TerminalTab, TerminalTabError> {
        let number = self.numbers.lock().expect("allocator poisoned").acquire();
        let tab_id = format!("Terminal {number}");
        let service_name = format!("terminal-{number}");

        let port = match self
            .spawn_tab_service(&service_name, cwd, command.clone())
            .await
        {
            Ok(port) => port,
            Err(e) => {
                self.numbers
                    .lock()
                    .expect("allocator poisoned")
                    .release(number);
                return Err(e);
            }
        };

        let tab = TerminalTab {
            tab_id: tab_id.clone(),
            kind: TabKind::Generic,
            service_name: Some(service_name),
            server_url: Some(format!("http://127.0.0.1:{port}/")),
            working_dir: Some(cwd.to_string_lossy().to_string()),
            tool_id: None,
            command,
            dead: false,
        };
        self.insert_tab(tab.clone(), Some(number));
        self.set_active_internal(&tab_id);
        info!(tab = %tab_id, port, "Generic terminal opened");
        Ok(tab)
    }

    /// Launch an AI tool into a project folder, resuming when the launch
    /// history says this (tool, project) has run before.
    pub async fn open_tool(
        &self,
        tool_id: &str,
        project_path: &Path,
    ) -> Result<TerminalTab, TerminalTabError> {
        let tool = tool_registry::find(tool_id)
            .ok_or_else(|| TerminalTabError::UnknownTool(tool_id.to_string()))?;
        let tab_id = tool.display_name.to_string();
        let service_name = format!("terminal-{}", tool.id);

        // Singleton per tool: a live tab is activated, a dead one is
        // superseded.
        if let Some(record) = self.tabs.get(&tab_id) {
            let alive = !record.tab.dead
                && self
                    .supervisor
                    .status(&service_name)
                    .is_some_and(|s| s.state == ProcessState::Running);
            let existing = record.tab.clone();
            drop(record);
            if alive {
                self.set_active_internal(&tab_id);
                return Ok(existing);
            }
            self.close(&tab_id).await?;
        }

        let path_str = project_path.to_string_lossy().to_string();
        let has_history =
            ToolLaunch::has_been_launched_before(&self.pool, tool.id, &path_str).await?;
        let resumed = has_history && tool.resume_flag.is_some();
        let command = tool.launch_command(has_history);

        // Reorient the rest of the UI to the project before the tab
        // appears, then give it a moment to commit.
        self.events.emit(AppEvent::ProjectContextChanged {
            path: path_str.clone(),
        });
        tokio::time::sleep(PROJECT_CONTEXT_DELAY).await;

        let port = self
            .spawn_tab_service(&service_name, project_path, Some(command.clone()))
            .await?;

        let tool_version = SyncMetadata::find(&self.pool, tool.id)
            .await
            .ok()
            .flatten()
            .and_then(|m| m.installed_version);
        ToolLaunch::record_launch(
            &self.pool,
            tool.id,
            &path_str,
            &LaunchMetadata {
                tool_version,
                resumed,
            },
        )
        .await?;

        let tab = TerminalTab {
            tab_id: tab_id.clone(),
            kind: TabKind::Tool,
            service_name: Some(service_name),
            server_url: Some(format!("http://127.0.0.1:{port}/")),
            working_dir: Some(path_str),
            tool_id: Some(tool.id.to_string()),
            command: Some(command),
            dead: false,
        };
        self.insert_tab(tab.clone(), None);
        self.set_active_internal(&tab_id);
        info!(tab = %tab_id, port, resumed, "Tool terminal opened");
        Ok(tab)
    }

    /// Close a tab: stop its process, recycle its identifier, mark its
    /// launch-history row closed.
    pub async fn close(&self, tab_id: &str) -> Result<(), TerminalTabError> {
        let (kind, service_name, number, tool_id, working_dir) = {
            let record = self
                .tabs
                .get(tab_id)
                .ok_or_else(|| TerminalTabError::TabNotFound(tab_id.to_string()))?;
            if record.tab.kind == TabKind::SystemLog {
                return Err(TerminalTabError::TabNotCloseable);
            }
            (
                record.tab.kind,
                record.tab.service_name.clone(),
                record.number,
                record.tab.tool_id.clone(),
                record.tab.working_dir.clone(),
            )
        };

        if let Some(service) = &service_name {
            self.supervisor.stop(service).await?;
            if let Err(e) = self.supervisor.unregister(service) {
                warn!(service = %service, error = %e, "Failed to unregister tab service");
            }
        }
        if kind == TabKind::Generic
            && let Some(number) = number
        {
            self.numbers
                .lock()
                .expect("allocator poisoned")
                .release(number);
        }
        if let (Some(tool_id), Some(working_dir)) = (tool_id, working_dir)
            && let Err(e) = ToolLaunch::close_session(&self.pool, &tool_id, &working_dir).await
        {
            warn!(tool = %tool_id, error = %e, "Failed to close launch-history session");
        }

        self.tabs.remove(tab_id);
        {
            let mut order = self.order.lock().expect("order poisoned");
            order.retain(|id| id != tab_id);
            let mut active = self.active.lock().expect("active poisoned");
            if active.as_deref() == Some(tab_id) {
                *active = order.last().cloned();
            }
        }
        info!(tab = %tab_id, "Terminal tab closed");
        Ok(())
    }

    /// Close every closeable tab. Used by unified teardown.
    pub async fn close_all(&self) {
        let tab_ids: Vec<String> = self
            .tabs
            .iter()
            .filter(|entry| entry.value().tab.kind != TabKind::SystemLog)
            .map(|entry| entry.key().clone())
            .collect();
        for tab_id in tab_ids {
            if let Err(e) = self.close(&tab_id).await {
                warn!(tab = %tab_id, error = %e, "Failed to close tab during teardown");
            }
        }
    }

    /// Tabs in UI order.
    pub fn list(&self) -> Vec<TerminalTab> {
        let order = self.order.lock().expect("order poisoned");
        order
            .iter()
            .filter_map(|id| self.tabs.get(id).map(|record| record.tab.clone()))
            .collect()
    }

    pub fn active(&self) -> Option<String> {
        self.active.lock().expect("active poisoned").clone()
    }

    pub fn set_active(&self, tab_id: &str) -> Result<(), TerminalTabError> {
        if !self.tabs.contains_key(tab_id) {
            return Err(TerminalTabError::TabNotFound(tab_id.to_string()));
        }
        self.set_active_internal(tab_id);
        Ok(())
    }

    fn set_active_internal(&self, tab_id: &str) {
        *self.active.lock().expect("active poisoned") = Some(tab_id.to_string());
    }

    fn insert_tab(&self, tab: TerminalTab, number: Option<u32>) {
        let tab_id = tab.tab_id.clone();
        self.tabs.insert(tab_id.clone(), TabRecord { tab, number });
        self.order.lock().expect("order poisoned").push(tab_id);
    }

    /// Register and start the terminal-server service for one tab.
    async fn spawn_tab_service(
        &self,
        service_name: &str,
        cwd: &Path,
        initial_command: Option<String>,
    ) -> Result<u16, TerminalTabError> {
        let mut config = ServiceConfig::new(
            service_name,
            ExecutableKind::TerminalServer,
            &self.terminal_server_path,
        )
        .with_pool(TERMINALS_POOL)
        .with_working_dir(cwd)
        .with_priority(ServicePriority::Normal)
        // The UI offers an explicit restart action instead.
        .with_restart_policy(RestartPolicy::none());
        if let Some(command) = initial_command {
            config = config.with_initial_command(command);
        }

        match self.supervisor.register(config) {
            Ok(()) | Err(SupervisorError::AlreadyRegistered(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match self.supervisor.start(service_name).await {
            Ok(()) => {}
            Err(SupervisorError::NoPort(_)) => {
                return Err(TerminalTabError::NoPortAvailable(
                    "No terminal ports available. Close unused terminals or resolve external \
                     port conflicts on the configured terminal range."
                        .to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        self.supervisor
            .status(service_name)
            .and_then(|s| s.port)
            .ok_or_else(|| {
                TerminalTabError::Supervisor(SupervisorError::SpawnFailed(
                    service_name.to_string(),
                    "no port recorded after start".to_string(),
                ))
            })
    }

    /// Mark tabs dead when their backing process goes away; the UI keeps
    /// the element until the user dismisses it.
    fn spawn_death_watcher(manager: Arc<Self>) {
        let mut events = manager.supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let service = match &event {
                    ProcessEvent::ProcessStopped { name } => name.clone(),
                    ProcessEvent::ProcessFailed { name, .. } => name.clone(),
                    _ => continue,
                };
                manager.mark_dead(&service).await;
            }
        });
    }

    async fn mark_dead(&self, service_name: &str) {
        let mut closed_sessions: Vec<(String, String)> = Vec::new();
        for mut entry in self.tabs.iter_mut() {
            let record = entry.value_mut();
            if record.tab.service_name.as_deref() == Some(service_name) && !record.tab.dead {
                record.tab.dead = true;
                info!(tab = %record.tab.tab_id, "Terminal tab marked dead");
                if let (Some(tool_id), Some(dir)) =
                    (record.tab.tool_id.clone(), record.tab.working_dir.clone())
                {
                    closed_sessions.push((tool_id, dir));
                }
            }
        }
        for (tool_id, dir) in closed_sessions {
            if let Err(e) = ToolLaunch::close_session(&self.pool, &tool_id, &dir).await {
                warn!(tool = %tool_id, error = %e, "Failed to close launch-history session");
            }
        }
    }
}
