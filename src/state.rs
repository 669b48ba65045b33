//! Application state shared across handlers.

use crate::services::backends::Backends;
use std::sync::Arc;

/// Holds only the client factory; every request builds its own clients.
#[derive(Clone)]
pub struct AppState {
    pub backends: Arc<dyn Backends>,
}

impl AppState {
    pub fn new(backends: Arc<dyn Backends>) -> Self {
        Self { backends }
    }
}
