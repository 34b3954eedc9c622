use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::routing::IntelligentRouter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<IntelligentRouter>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(router: Arc<IntelligentRouter>) -> Self {
        Self {
            router,
            started_at: Utc::now(),
        }
    }

    /// Seconds since the server state was created
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}
