use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;

/// Estado compartido por los handlers del servidor de analíticas.
#[derive(Clone)]
pub struct AppState {
    pub conversations_dir: Arc<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            conversations_dir: Arc::new(config.conversations_dir),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Status {
    pub status: &'static str,
    pub conversations: usize,
    pub conversations_dir: String,
    pub uptime_seconds: i64,
}
