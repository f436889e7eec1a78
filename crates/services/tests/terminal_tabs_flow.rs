//! Scenario tests for the terminal tab manager: identifier recycling,
//! resume detection, exhaustion, and the system-log singleton.

#![cfg(unix)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use db::models::tool_launch::ToolLaunch;
use services::services::{
    events::{AppEvent, EventBus, UiEvent},
    pid_tracker::PidTracker,
    port_pool::{PortPool, PortRange, TERMINALS_POOL},
    supervisor::ProcessSupervisor,
    terminal_tabs::{SYSTEM_LOG_TAB, TabKind, TerminalTabError, TerminalTabManager},
};
use tempfile::TempDir;

struct Harness {
    manager: Arc<TerminalTabManager>,
    events: Arc<EventBus>,
    pool: sqlx::SqlitePool,
    ports: Arc<PortPool>,
    dir: TempDir,
}

/// A stand-in terminal server: accepts any arguments and stays alive.
fn fake_terminal_server(dir: &TempDir) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("fake-ttyd");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn harness(start: u16, end: u16, size: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let ports = Arc::new(PortPool::new());
    ports
        .initialize(vec![PortRange {
            pool: TERMINALS_POOL.to_string(),
            start,
            end,
            pool_size: size,
            priority: 1,
        }])
        .await
        .unwrap();
    let pids = Arc::new(PidTracker::new(dir.path().join("test.pids")));
    let supervisor = ProcessSupervisor::new(ports.clone(), pids);
    let db = db::test_utils::in_memory_db().await;
    let events = Arc::new(EventBus::new());
    let server_path = fake_terminal_server(&dir);
    let manager = TerminalTabManager::new(supervisor, db.pool.clone(), events.clone(), server_path);
    Harness {
        manager,
        events,
        pool: db.pool,
        ports,
        dir,
    }
}

#[tokio::test]
async fn test_generic_tab_numbers_recycle() {
    let h = harness(44400, 44499, 8).await;
    let cwd = h.dir.path().to_path_buf();

    let t1 = h.manager.open_generic(&cwd, None).await.unwrap();
    let t2 = h.manager.open_generic(&cwd, None).await.unwrap();
    let t3 = h.manager.open_generic(&cwd, None).await.unwrap();
    assert_eq!(t1.tab_id, "Terminal 1");
    assert_eq!(t2.tab_id, "Terminal 2");
    assert_eq!(t3.tab_id, "Terminal 3");

    h.manager.close("Terminal 2").await.unwrap();

    // The freed integer is reused before a new one is minted.
    let t4 = h.manager.open_generic(&cwd, None).await.unwrap();
    assert_eq!(t4.tab_id, "Terminal 2");

    h.manager.close_all().await;
}

#[tokio::test]
async fn test_tab_urls_point_at_loopback_ports() {
    let h = harness(44500, 44599, 4).await;
    let tab = h.manager.open_generic(h.dir.path(), None).await.unwrap();
    let url = tab.server_url.unwrap();
    assert!(url.starts_with("http://127.0.0.1:"));
    assert!(url.ends_with('/'));
    h.manager.close_all().await;
}

#[tokio::test]
async fn test_system_log_tab_is_never_closeable() {
    let h = harness(44600, 44620, 2).await;

    let tabs = h.manager.list();
    assert_eq!(tabs[0].tab_id, SYSTEM_LOG_TAB);
    assert_eq!(tabs[0].kind, TabKind::SystemLog);
    assert!(tabs[0].server_url.is_none());

    assert!(matches!(
        h.manager.close(SYSTEM_LOG_TAB).await,
        Err(TerminalTabError::TabNotCloseable)
    ));
}

#[tokio::test]
async fn test_tool_launch_resumes_on_second_run() {
    let h = harness(44700, 44799, 4).await;
    let project = h.dir.path().join("project-x");
    std::fs::create_dir_all(&project).unwrap();

    // First launch: plain command.
    let tab = h.manager.open_tool("claude-code", &project).await.unwrap();
    assert_eq!(tab.tab_id, "Claude");
    assert_eq!(tab.command.as_deref(), Some("claude"));

    h.manager.close("Claude").await.unwrap();

    // Second launch into the same project: resume flag appended.
    let tab = h.manager.open_tool("claude-code", &project).await.unwrap();
    assert_eq!(tab.command.as_deref(), Some("claude --continue"));

    let row = ToolLaunch::find(&h.pool, "claude-code", &project.to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.launch_count, 2);

    h.manager.close_all().await;
}

#[tokio::test]
async fn test_live_tool_tab_is_activated_not_duplicated() {
    let h = harness(44800, 44899, 4).await;
    let project = h.dir.path().join("project-y");
    std::fs::create_dir_all(&project).unwrap();

    let first = h.manager.open_tool("claude-code", &project).await.unwrap();
    let second = h.manager.open_tool("claude-code", &project).await.unwrap();
    assert_eq!(first.tab_id, second.tab_id);

    // No second launch was recorded while the tab was alive.
    let row = ToolLaunch::find(&h.pool, "claude-code", &project.to_string_lossy())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.launch_count, 1);

    // Exactly one Claude tab in the list.
    let claude_tabs = h
        .manager
        .list()
        .into_iter()
        .filter(|t| t.tab_id == "Claude")
        .count();
    assert_eq!(claude_tabs, 1);

    h.manager.close_all().await;
}

#[tokio::test]
async fn test_project_context_changes_before_tool_tab_opens() {
    let h = harness(44900, 44950, 2).await;
    let project = h.dir.path().join("project-z");
    std::fs::create_dir_all(&project).unwrap();

    let mut rx = h.events.subscribe();
    h.manager.open_tool("gemini-cli", &project).await.unwrap();

    let mut saw_context_change = false;
    while let Ok(event) = rx.try_recv() {
        if let UiEvent::App(AppEvent::ProjectContextChanged { path }) = event {
            assert_eq!(path, project.to_string_lossy());
            saw_context_change = true;
        }
    }
    assert!(saw_context_change);

    h.manager.close_all().await;
}

#[tokio::test]
async fn test_port_exhaustion_surfaces_clear_error() {
    let h = harness(45000, 45020, 1).await;
    let cwd = h.dir.path().to_path_buf();

    h.manager.open_generic(&cwd, None).await.unwrap();
    let err = h.manager.open_generic(&cwd, None).await;
    assert!(matches!(err, Err(TerminalTabError::NoPortAvailable(_))));

    // Closing the first tab returns its port; opening works again.
    h.manager.close("Terminal 1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let tab = h.manager.open_generic(&cwd, None).await.unwrap();
    assert_eq!(tab.tab_id, "Terminal 1");

    h.manager.close_all().await;
}

#[tokio::test]
async fn test_close_returns_port_to_pool() {
    let h = harness(45100, 45150, 2).await;

    let before = h.ports.diagnostics().pools[TERMINALS_POOL];
    let tab = h.manager.open_generic(h.dir.path(), None).await.unwrap();
    assert_eq!(h.ports.diagnostics().pools[TERMINALS_POOL], before - 1);

    h.manager.close(&tab.tab_id).await.unwrap();
    assert_eq!(h.ports.diagnostics().pools[TERMINALS_POOL], before);
}

#[tokio::test]
async fn test_active_tab_follows_open_and_close() {
    let h = harness(45200, 45299, 4).await;
    let cwd = h.dir.path().to_path_buf();

    let t1 = h.manager.open_generic(&cwd, None).await.unwrap();
    let t2 = h.manager.open_generic(&cwd, None).await.unwrap();
    assert_eq!(h.manager.active().as_deref(), Some(t2.tab_id.as_str()));

    h.manager.close(&t2.tab_id).await.unwrap();
    assert_eq!(h.manager.active().as_deref(), Some(t1.tab_id.as_str()));

    h.manager.set_active(SYSTEM_LOG_TAB).unwrap();
    assert_eq!(h.manager.active().as_deref(), Some(SYSTEM_LOG_TAB));

    h.manager.close_all().await;
}
