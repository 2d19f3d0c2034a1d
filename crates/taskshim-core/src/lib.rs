//! Task/shim supervision layer: spawns, supervises over a local IPC channel,
//! and routes lifecycle RPCs to out-of-process container shims, funneling
//! exit, OOM and image events into a typed event bus.

pub mod backoff;
pub mod binary;
pub mod bundle;
pub mod error;
pub mod event_monitor;
pub mod events;
pub mod ipc;
pub mod logpipe;
pub mod manager;
pub mod monitor;
pub mod oom;
pub mod service;
pub mod shim;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use events::Exchange;
pub use manager::TaskManager;
pub use service::TaskService;

use std::path::PathBuf;

/// Process-wide configuration, read once at startup the way the rest of
/// this crate's ambient stack (logging, state layout) expects to be
/// configured: from the environment, with defaults sane enough for local
/// development.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory for volatile per-task state (`TASKSHIM_STATE_DIR`,
    /// default `/run/taskshim`).
    pub state_dir: PathBuf,
    /// Root directory for persistent per-task working directories
    /// (`TASKSHIM_WORK_DIR`, default `/var/lib/taskshim`).
    pub work_dir: PathBuf,
    /// Passed to spawned shims as `-debug` (`TASKSHIM_DEBUG=1`).
    pub debug: bool,
    /// Event bus channel capacity (`TASKSHIM_EVENT_CAPACITY`, default 1024).
    pub event_capacity: usize,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: std::env::var_os("TASKSHIM_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/run/taskshim")),
            work_dir: std::env::var_os("TASKSHIM_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/taskshim")),
            debug: std::env::var("TASKSHIM_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            event_capacity: std::env::var("TASKSHIM_EVENT_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Initializes logging for a taskshim process: one `env_logger::init()` call
/// near the top of `main`, level controlled by `RUST_LOG`.
pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// Constructs a `TaskManager` and `TaskService` wired to `config`,
/// reconciling any tasks left over from a previous process.
pub async fn bootstrap(config: &RuntimeConfig) -> Result<std::sync::Arc<TaskService>> {
    let store = bundle::BundleStore::new(config.state_dir.clone(), config.work_dir.clone());
    let exchange = events::init_global_exchange(config.event_capacity);
    let manager = std::sync::Arc::new(TaskManager::new(store, exchange.clone(), config.debug));
    manager.load_all().await?;
    event_monitor::spawn(exchange, manager.clone());
    Ok(std::sync::Arc::new(TaskService::new(manager)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_defaults_without_env() {
        std::env::remove_var("TASKSHIM_STATE_DIR");
        std::env::remove_var("TASKSHIM_WORK_DIR");
        std::env::remove_var("TASKSHIM_DEBUG");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.state_dir, PathBuf::from("/run/taskshim"));
        assert!(!config.debug);
    }

    #[tokio::test]
    async fn bootstrap_succeeds_against_an_empty_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            state_dir: dir.path().join("state"),
            work_dir: dir.path().join("work"),
            debug: false,
            event_capacity: 16,
        };
        assert!(bootstrap(&config).await.is_ok());
    }
}
