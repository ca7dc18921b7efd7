//! Shared application state.

use std::sync::Arc;

use crate::terminal::TerminalManager;

#[derive(Clone)]
pub struct AppState {
    pub terminals: Arc<TerminalManager>,
}

impl AppState {
    pub fn new(terminals: TerminalManager) -> Self {
        Self {
            terminals: Arc::new(terminals),
        }
    }
}
