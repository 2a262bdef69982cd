//! Factory for runnables.
//!
//! Holds the shared configuration (directories, worker executable,
//! deadlines) and nothing else; each created runnable owns its own
//! state. The orchestrator may hold many runnables at once — one per
//! pipeline stage or parallel run — each serializing its own calls.

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::runnable::Runnable;

/// Entry point for orchestrator code.
#[derive(Debug, Clone)]
pub struct Runtime {
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Load configuration from the environment (see
    /// [`RuntimeConfig::from_env`]).
    pub fn from_env() -> Result<Self, RuntimeError> {
        Ok(Self::new(RuntimeConfig::from_env()?))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a runnable in the `Init` state. No subprocess is spawned
    /// until `bootstrap()` is called on it.
    pub fn create_runnable(&self) -> Runnable {
        let runnable = Runnable::new(self.config.clone());
        debug!(runnable = %runnable.id(), dir = %runnable.working_dir().display(), "created runnable");
        runnable
    }
}
