//! Application state shared across request handlers.

use std::sync::Arc;

use crate::brain::Brain;

/// Name and version reported by `GET /`.
#[derive(Debug, Clone)]
pub struct ServiceMetadata {
    pub name: String,
    pub version: String,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    brain: Brain,
    metadata: ServiceMetadata,
}

impl AppState {
    pub fn new(brain: Brain, metadata: ServiceMetadata) -> Self {
        Self {
            inner: Arc::new(AppStateInner { brain, metadata }),
        }
    }

    pub fn brain(&self) -> &Brain {
        &self.inner.brain
    }

    pub fn metadata(&self) -> &ServiceMetadata {
        &self.inner.metadata
    }
}
