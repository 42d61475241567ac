use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::registry::Registry;

/// Shared application state passed to all handlers via the axum State
/// extractor.
#[derive(Clone)]
pub struct AppState {
    /// Index of live meeting drivers.
    pub registry: Arc<Registry>,
    /// Server configuration.
    pub config: Arc<Config>,
    /// Server start time, for status reports.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the state and start the registry's background worker.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            registry: Registry::new(config.dburl.clone()),
            config,
            started_at: Utc::now(),
        }
    }
}
