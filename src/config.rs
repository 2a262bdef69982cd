//! Runtime configuration.
//!
//! The orchestrator passes configuration via the `PLUGIN_RUNNER_CONFIG`
//! environment variable as JSON, or builds it programmatically. Only
//! directories, the worker executable, and deadlines live here — plugin
//! installation and pipeline sequencing are the caller's business.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RuntimeError;

/// Shared configuration for creating runnables.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Shared plugin install location; `install_dir/<name>` must exist
    /// before `start()` names that plugin (the installer's contract).
    pub install_dir: PathBuf,

    /// Root under which each runnable gets its private working
    /// directory (`data_dir/<runnable id>`).
    pub data_dir: PathBuf,

    /// Worker executable. When absent, resolution falls back to the
    /// `PLUGIN_RUNNER_WORKER` env var, then to a `plugin-runner-worker`
    /// binary next to the current executable.
    #[serde(default)]
    pub worker_exec: Option<PathBuf>,

    /// How long to wait for the worker's handshake pong on bootstrap.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,

    /// Deadline for each request/response exchange. Exceeding it is
    /// fatal to the runnable.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// How long destroy waits for the worker to exit before killing it.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

const fn default_handshake_timeout() -> u64 {
    30
}

const fn default_request_timeout() -> u64 {
    600
}

const fn default_shutdown_timeout() -> u64 {
    10
}

impl RuntimeConfig {
    /// Configuration with default deadlines for the given directories.
    pub fn new(install_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            data_dir: data_dir.into(),
            worker_exec: None,
            handshake_timeout_seconds: default_handshake_timeout(),
            request_timeout_seconds: default_request_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }

    /// Load configuration from the `PLUGIN_RUNNER_CONFIG` environment
    /// variable.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let json = std::env::var("PLUGIN_RUNNER_CONFIG").map_err(|_| {
            RuntimeError::Protocol("PLUGIN_RUNNER_CONFIG not set".to_string())
        })?;
        Self::from_json(&json)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(json)
            .map_err(|e| RuntimeError::Protocol(format!("invalid runtime config: {e}")))
    }

    /// Resolve the worker executable path.
    ///
    /// Priority: explicit config > `PLUGIN_RUNNER_WORKER` env var >
    /// sibling `plugin-runner-worker` of the current executable.
    pub fn resolved_worker_exec(&self) -> Result<PathBuf, RuntimeError> {
        if let Some(exec) = &self.worker_exec {
            return Ok(exec.clone());
        }
        if let Ok(exec) = std::env::var("PLUGIN_RUNNER_WORKER") {
            return Ok(PathBuf::from(exec));
        }
        let current = std::env::current_exe()?;
        let sibling = current
            .parent()
            .map(|dir| dir.join("plugin-runner-worker"))
            .filter(|p| p.exists());
        sibling.ok_or_else(|| {
            RuntimeError::Bootstrap(
                "no worker executable configured and none found next to the current executable"
                    .to_string(),
            )
        })
    }

    /// Install path for a named plugin, the source side of the symlink
    /// into a runnable's module directory.
    pub fn installed_plugin_dir(&self, name: &str) -> PathBuf {
        self.install_dir.join(name)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Working directory for a runnable id.
    pub fn working_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let json = r#"{
            "install_dir": "/opt/plugins",
            "data_dir": "/var/lib/plugin-runner"
        }"#;

        let config = RuntimeConfig::from_json(json).unwrap();
        assert_eq!(config.install_dir, PathBuf::from("/opt/plugins"));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/plugin-runner"));
        assert!(config.worker_exec.is_none());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(600));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "install_dir": "/opt/plugins",
            "data_dir": "/tmp/runner",
            "worker_exec": "/usr/local/bin/plugin-runner-worker",
            "handshake_timeout_seconds": 5,
            "request_timeout_seconds": 120,
            "shutdown_timeout_seconds": 3
        }"#;

        let config = RuntimeConfig::from_json(json).unwrap();
        assert_eq!(
            config.worker_exec,
            Some(PathBuf::from("/usr/local/bin/plugin-runner-worker"))
        );
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn invalid_config_is_a_protocol_error() {
        let err = RuntimeConfig::from_json("{\"install_dir\": 42}").unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }

    #[test]
    fn explicit_worker_exec_wins() {
        let mut config = RuntimeConfig::new("/opt/plugins", "/tmp/runner");
        config.worker_exec = Some(PathBuf::from("/explicit/worker"));
        assert_eq!(
            config.resolved_worker_exec().unwrap(),
            PathBuf::from("/explicit/worker")
        );
    }

    #[test]
    fn plugin_and_working_dir_layout() {
        let config = RuntimeConfig::new("/opt/plugins", "/tmp/runner");
        assert_eq!(
            config.installed_plugin_dir("collect"),
            PathBuf::from("/opt/plugins/collect")
        );
        assert_eq!(config.working_dir("abc"), PathBuf::from("/tmp/runner/abc"));
    }
}
