//! Shared handler state.

use std::sync::Arc;

use crate::application::ServeImageUseCase;

/// State cloned into every handler.
#[derive(Clone)]
pub struct ServerState {
    /// Image request use case.
    pub serve_image: Arc<ServeImageUseCase>,
}

impl ServerState {
    /// Creates new state.
    #[must_use]
    pub const fn new(serve_image: Arc<ServeImageUseCase>) -> Self {
        Self { serve_image }
    }
}
