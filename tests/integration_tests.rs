//! End-to-end tests driving the real `taskshim-agent` binary through
//! `taskshim-core`'s public surface.
//!
//! These spawn an actual shim child process, so they need the workspace
//! built first and a way for `taskshim-core::binary::resolve_binary` to find
//! it under its `containerd-shim-<name>-<version>` naming convention. We
//! provide that by symlinking the built `taskshim-agent` binary into a
//! scratch directory under that name and prepending the directory to `PATH`.
//!
//! Run with: cargo test --test integration_tests -- --ignored

use std::path::PathBuf;
use std::time::Duration;

use taskshim_core::{
    bundle::BundleStore, events::Exchange, manager::TaskManager, service::TaskService,
    RuntimeConfig,
};

const TEST_RUNTIME: &str = "io.containerd.taskshimtest.v1";
const SHIM_BINARY_NAME: &str = "containerd-shim-taskshimtest-v1";

fn agent_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("debug")
        .join("taskshim-agent")
}

/// Puts a `containerd-shim-taskshimtest-v1` symlink to the built agent
/// binary on `PATH` for the duration of the returned guard, and points
/// `TaskRuntimeConfig` at a fresh temp directory per test.
struct TestEnv {
    _shim_dir: tempfile::TempDir,
    _state_dir: tempfile::TempDir,
    config: RuntimeConfig,
}

impl TestEnv {
    fn new() -> Option<Self> {
        let agent = agent_binary_path();
        if !agent.exists() {
            eprintln!("taskshim-agent not built, skipping");
            return None;
        }

        let shim_dir = tempfile::tempdir().unwrap();
        let link = shim_dir.path().join(SHIM_BINARY_NAME);
        #[cfg(unix)]
        std::os::unix::fs::symlink(&agent, &link).expect("symlink shim binary");

        let path_var = std::env::var_os("PATH").unwrap_or_default();
        let mut paths: Vec<PathBuf> = std::env::split_paths(&path_var).collect();
        paths.insert(0, shim_dir.path().to_path_buf());
        std::env::set_var("PATH", std::env::join_paths(paths).unwrap());

        let state_dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            state_dir: state_dir.path().join("state"),
            work_dir: state_dir.path().join("work"),
            debug: false,
            event_capacity: 256,
        };

        Some(Self {
            _shim_dir: shim_dir,
            _state_dir: state_dir,
            config,
        })
    }
}

fn bundle_spec(args: &[&str]) -> Vec<u8> {
    serde_json::json!({
        "process": {
            "args": args,
            "env": [],
            "cwd": "/",
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
#[ignore]
async fn create_start_wait_delete_happy_path() {
    let Some(env) = TestEnv::new() else { return };
    let service = taskshim_core::bootstrap(&env.config)
        .await
        .expect("bootstrap");

    let spec = bundle_spec(&["/bin/sleep", "0.1"]);
    service
        .create("default", "c1", TEST_RUNTIME, &spec, None)
        .await
        .expect("create");

    let started_pid = service.start("default", "c1", None).await.expect("start");
    assert!(started_pid > 0);

    let wait = service.wait("default", "c1", None).await.expect("wait");
    assert_eq!(wait.exit_status, 0);

    service.delete("default", "c1").await.expect("delete");
    assert!(service.state("default", "c1", None).await.is_err());
}

#[tokio::test]
#[ignore]
async fn create_rejects_invalid_runtime_identifier_without_registering_a_task() {
    let Some(env) = TestEnv::new() else { return };
    let service = taskshim_core::bootstrap(&env.config)
        .await
        .expect("bootstrap");

    let err = service
        .create("default", "bad", "not-a-valid-runtime", b"{}", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), taskshim_core::ErrorKind::InvalidArgument);
    assert!(service.delete("default", "bad").await.is_err());
}

#[tokio::test]
#[ignore]
async fn concurrent_exec_calls_admit_exactly_one_winner() {
    let Some(env) = TestEnv::new() else { return };
    let service = taskshim_core::bootstrap(&env.config)
        .await
        .expect("bootstrap");

    let spec = bundle_spec(&["/bin/sleep", "1"]);
    service
        .create("default", "c2", TEST_RUNTIME, &spec, None)
        .await
        .expect("create");
    service.start("default", "c2", None).await.expect("start");

    let request = || taskshim_proto::ExecProcessRequest {
        id: "c2".to_string(),
        exec_id: "e1".to_string(),
        terminal: false,
        stdin: String::new(),
        stdout: String::new(),
        stderr: String::new(),
        spec: serde_json::json!({ "args": ["/bin/echo", "hi"] }).to_string(),
    };

    let (first, second) = tokio::join!(
        service.exec("default", "c2", "e1", request()),
        service.exec("default", "c2", "e1", request()),
    );
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

    let _ = service.kill("default", "c2", None, 9, true).await;
    let _ = service.delete("default", "c2").await;
}

#[tokio::test]
#[ignore]
async fn shim_disconnect_triggers_post_mortem_cleanup() {
    let Some(env) = TestEnv::new() else { return };
    let service = taskshim_core::bootstrap(&env.config)
        .await
        .expect("bootstrap");

    let spec = bundle_spec(&["/bin/sleep", "30"]);
    service
        .create("default", "c3", TEST_RUNTIME, &spec, None)
        .await
        .expect("create");
    service.start("default", "c3", None).await.expect("start");

    // Kill the shim process out from under the manager rather than calling
    // Delete, so the IPC channel drops unexpectedly and post-mortem cleanup
    // has to run the shim's delete subcommand itself.
    let _ = std::process::Command::new("pkill")
        .arg("-f")
        .arg("-id c3 ")
        .status();

    // The on-close watcher polls every 200ms; give cleanup plenty of room.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(service.state("default", "c3", None).await.is_err());
}

#[tokio::test]
#[ignore]
async fn oom_event_is_consumed_without_blocking_the_manager() {
    let Some(env) = TestEnv::new() else { return };
    let service = taskshim_core::bootstrap(&env.config)
        .await
        .expect("bootstrap");

    let spec = bundle_spec(&["/bin/sleep", "5"]);
    service
        .create("default", "c4", TEST_RUNTIME, &spec, None)
        .await
        .expect("create");
    service.start("default", "c4", None).await.expect("start");

    taskshim_core::events::global_exchange().publish(
        "default".to_string(),
        taskshim_proto::EventPayload::TaskOom {
            container_id: "c4".to_string(),
        },
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    // The status mutation itself is covered directly in taskshim-core's own
    // event_monitor tests; this only checks the manager is still responsive
    // after an OOM event for a real task passes through the event bus.
    service.state("default", "c4", None).await.expect("state");

    let _ = service.kill("default", "c4", None, 9, true).await;
    let _ = service.delete("default", "c4").await;
}

/// Sanity check on the construction path `taskshim-core::bootstrap` uses,
/// without spawning any shim process at all.
#[tokio::test]
async fn manager_list_is_empty_against_a_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = BundleStore::new(dir.path().join("state"), dir.path().join("work"));
    let manager = std::sync::Arc::new(TaskManager::new(
        store,
        std::sync::Arc::new(Exchange::new(16)),
        false,
    ));
    let service = TaskService::new(manager);
    assert!(service.list("default").await.is_empty());
}
