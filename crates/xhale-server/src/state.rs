//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use xhale_core::{Config, SessionHandle};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    session: SessionHandle,
    started_at: Instant,
}

/// State type the routers are parameterised over.
pub type SharedState = AppState;

impl AppState {
    /// Wrap a running session manager and the configuration it was built from.
    #[must_use]
    pub fn new(config: Config, session: SessionHandle) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                session,
                started_at: Instant::now(),
            }),
        }
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Handle to the session manager.
    #[must_use]
    pub fn session(&self) -> &SessionHandle {
        &self.inner.session
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }
}
