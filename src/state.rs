//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use crate::dispatcher::Dispatcher;

/// State handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            started_at: Instant::now(),
        }
    }
}
