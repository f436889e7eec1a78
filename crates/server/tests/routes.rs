//! Command-surface tests against an in-process router.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::Value;
use server::{AppState, routes};
use services::services::{
    cli_tools::CliToolService,
    events::EventBus,
    pid_tracker::PidTracker,
    port_pool::PortPool,
    supervisor::ProcessSupervisor,
    terminal_tabs::TerminalTabManager,
    tool_registry,
};
use tempfile::TempDir;
use tower::util::ServiceExt;

struct Harness {
    router: Router,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db = db::test_utils::in_memory_db().await;
    let pids = Arc::new(PidTracker::new(dir.path().join("test.pids")));
    let supervisor = ProcessSupervisor::new(Arc::new(PortPool::new()), pids);
    let events = Arc::new(EventBus::new());
    let terminals = TerminalTabManager::new(
        supervisor.clone(),
        db.pool.clone(),
        events.clone(),
        dir.path().join("ttyd"),
    );
    let tools = CliToolService::new(db.pool.clone(), supervisor.clone());

    let state = AppState {
        db,
        supervisor,
        terminals,
        tools,
        events,
    };
    Harness {
        router: routes::router(state),
        _dir: dir,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness().await;
    let (status, body) = get(&h.router, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.get("status").and_then(Value::as_str), Some("ok"));
}

#[tokio::test]
async fn test_service_ports_refuse_when_not_running() {
    let h = harness().await;

    for uri in ["/api/services/memory/port", "/api/services/backend/port"] {
        let (status, body) = get(&h.router, uri).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.get("success").and_then(Value::as_bool), Some(false));
        let message = body
            .get("error_data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        assert!(message.contains("not running"));
        // Never a fallback port.
        assert!(body.get("data").unwrap().is_null());
    }
}

#[tokio::test]
async fn test_terminal_list_contains_system_log() {
    let h = harness().await;
    let (status, body) = get(&h.router, "/api/terminals").await;
    assert_eq!(status, StatusCode::OK);

    let tabs = body.pointer("/data/tabs").and_then(Value::as_array).unwrap();
    assert_eq!(
        tabs[0].get("tab_id").and_then(Value::as_str),
        Some("System Log")
    );
}

#[tokio::test]
async fn test_system_log_tab_kill_is_rejected() {
    let h = harness().await;
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/terminals/System%20Log")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tool_detection_covers_registry() {
    let h = harness().await;
    let (status, body) = get(&h.router, "/api/tools").await;
    assert_eq!(status, StatusCode::OK);
    let statuses = body.get("data").and_then(Value::as_array).unwrap();
    assert_eq!(statuses.len(), tool_registry::all().len());
}

#[tokio::test]
async fn test_unknown_tool_detection_is_404() {
    let h = harness().await;
    let (status, _) = get(&h.router, "/api/tools/not-a-tool").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_diagnostics_reports_unscanned_pool() {
    let h = harness().await;
    let (status, body) = get(&h.router, "/api/diagnostics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body.pointer("/data/ports/scan_complete").and_then(Value::as_bool),
        Some(false)
    );
    assert!(
        body.pointer("/data/processes")
            .and_then(Value::as_array)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_tool_launch_rejects_missing_project_dir() {
    let h = harness().await;
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tools/claude-code/launch")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"project_path":"/definitely/not/a/dir"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
