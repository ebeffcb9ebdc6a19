use std::sync::Arc;

use crate::config::ServerConfig;
use crate::service::ScanService;

/// Shared application state available to all handlers via axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScanService>,
    pub config: Arc<ServerConfig>,
}
