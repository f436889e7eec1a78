use std::sync::Arc;

use db::DBService;
use services::services::{
    cli_tools::CliToolService, events::EventBus, supervisor::ProcessSupervisor,
    terminal_tabs::TerminalTabManager,
};

pub mod boot;
pub mod error;
pub mod file_logging;
pub mod routes;

/// Shared state behind every command handler. Built during the `ipc`
/// boot step, once the database and the supervisor exist.
#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
    pub supervisor: ProcessSupervisor,
    pub terminals: Arc<TerminalTabManager>,
    pub tools: CliToolService,
    pub events: Arc<EventBus>,
}
