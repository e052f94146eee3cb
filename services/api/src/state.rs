//! Shared Application State

use crate::config::Config;
use coursegen_core::CourseOrchestrator;
use std::sync::Arc;

/// Created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: CourseOrchestrator,
    pub config: Arc<Config>,
}
