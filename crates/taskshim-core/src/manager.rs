//! `TaskManager`: the in-process registry of running tasks, the entry point
//! every RPC-facing operation in `service.rs` goes through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::bundle::BundleStore;
use crate::error::{Error, Result};
use crate::events::Exchange;
use crate::ipc::{self, IpcChannel};
use crate::shim::ShimClient;
use crate::types::{validate_id, TaskStatus};
use crate::{binary, monitor};

/// Every task is addressed through the `dyn IpcChannel` object-safe seam
/// regardless of which concrete transport dialed it, so tests can register
/// fake channels alongside real framed-socket ones in the same registry.
pub type DynShimClient = ShimClient<dyn IpcChannel>;

pub(crate) fn make_client(channel: impl IpcChannel + 'static) -> Arc<DynShimClient> {
    Arc::new(ShimClient::new(Arc::new(channel) as Arc<dyn IpcChannel>))
}

/// Everything the manager tracks about one running (or starting, or being
/// removed) task.
pub struct TaskHandle {
    pub namespace: String,
    pub id: String,
    pub runtime: String,
    pub bundle: crate::bundle::Bundle,
    pub client: Arc<DynShimClient>,
    pub status: RwLock<TaskStatus>,
    /// Exec IDs reserved or live on this task. Reservation happens before
    /// the shim is asked to create the exec, so two concurrent `Exec(X)`
    /// calls can never both proceed: only the one that wins the insert goes
    /// on to call the shim.
    pub execs: AsyncMutex<HashSet<String>>,
}

impl TaskHandle {
    pub(crate) fn new(
        namespace: String,
        id: String,
        runtime: String,
        bundle: crate::bundle::Bundle,
        client: Arc<DynShimClient>,
        status: TaskStatus,
    ) -> Self {
        Self {
            namespace,
            id,
            runtime,
            bundle,
            client,
            status: RwLock::new(status),
            execs: AsyncMutex::new(HashSet::new()),
        }
    }
}

type TaskMap = Arc<RwLock<HashMap<(String, String), Arc<TaskHandle>>>>;

pub struct TaskManager {
    store: BundleStore,
    exchange: Arc<Exchange>,
    dial_timeout: Duration,
    debug: bool,
    tasks: TaskMap,
}

impl TaskManager {
    pub fn new(store: BundleStore, exchange: Arc<Exchange>, debug: bool) -> Self {
        Self {
            store,
            exchange,
            dial_timeout: Duration::from_secs(5),
            debug,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn key(namespace: &str, id: &str) -> (String, String) {
        (namespace.to_string(), id.to_string())
    }

    /// Publishes an event under the manager's own exchange, for callers
    /// (the task service) that react to an RPC outcome the manager itself
    /// didn't observe directly, such as a successful `Start`.
    pub fn publish(&self, namespace: &str, payload: taskshim_proto::EventPayload) {
        self.exchange.publish(namespace.to_string(), payload);
    }

    /// Creates a bundle, spawns its shim, dials it, and registers the task.
    /// On any failure after the bundle is created, the bundle is rolled back
    /// so a failed create leaves no trace.
    pub async fn create(
        &self,
        namespace: &str,
        id: &str,
        runtime: &str,
        spec: &[u8],
        options: Option<&serde_json::Value>,
    ) -> Result<Arc<TaskHandle>> {
        validate_id(id)?;
        {
            let tasks = self.tasks.read().await;
            if tasks.contains_key(&Self::key(namespace, id)) {
                return Err(Error::already_exists(format!("{}/{}", namespace, id)));
            }
        }

        let bundle = self.store.create(namespace, id, runtime, spec, options)?;
        match self.bring_up(namespace, id, runtime, &bundle).await {
            Ok(handle) => {
                self.exchange.publish(
                    namespace.to_string(),
                    taskshim_proto::EventPayload::TaskCreate {
                        container_id: id.to_string(),
                        pid: handle.status.read().await.pid,
                        bundle: bundle.path.display().to_string(),
                    },
                );
                Ok(handle)
            }
            Err(e) => {
                let _ = self.store.delete(&bundle);
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        namespace: &str,
        id: &str,
        runtime: &str,
        bundle: &crate::bundle::Bundle,
    ) -> Result<Arc<TaskHandle>> {
        let shim = binary::spawn_shim(bundle, runtime, self.debug, self.dial_timeout).await?;
        let channel = ipc::dial(&shim.address, self.dial_timeout).await?;
        let client = make_client(channel);

        let create_response = client
            .create(&taskshim_proto::CreateTaskRequest {
                id: id.to_string(),
                bundle: bundle.path.display().to_string(),
                rootfs: Vec::new(),
                terminal: false,
                stdin: String::new(),
                stdout: String::new(),
                stderr: String::new(),
                checkpoint: None,
                options: options_value(bundle),
            })
            .await?;

        let handle = Arc::new(TaskHandle::new(
            namespace.to_string(),
            id.to_string(),
            runtime.to_string(),
            bundle.clone(),
            client,
            TaskStatus::created(create_response.pid),
        ));

        monitor::spawn_exit_router(handle.clone(), self.exchange.clone());
        self.watch_shim_disconnect(handle.clone());

        self.tasks
            .write()
            .await
            .insert(Self::key(namespace, id), handle.clone());
        Ok(handle)
    }

    /// Wires the shim's IPC `on_close` callback to post-mortem cleanup: if
    /// the connection drops without a prior `Delete`, this runs the shim
    /// binary's own `delete` subcommand, publishes a synthetic
    /// `TaskExit`/`TaskDelete` pair, and forgets the task. Closes over
    /// cloned handles to the registry, store and exchange rather than the
    /// manager itself, since `TaskManager` is never held behind an `Arc` its
    /// own methods can recover.
    fn watch_shim_disconnect(&self, handle: Arc<TaskHandle>) {
        let tasks = self.tasks.clone();
        let store = self.store.clone();
        let exchange = self.exchange.clone();
        crate::ipc::watch_on_close(handle.client.channel(), move || {
            tokio::spawn(post_mortem_cleanup(tasks, store, exchange, handle));
        });
    }

    /// Reserves `exec_id` on `id`'s task, asks the shim to create the exec
    /// process, and publishes `TaskExecAdded` on success. Reservation is
    /// atomic: of any concurrent `Exec` calls racing on the same id, exactly
    /// one observes the reservation succeed and goes on to call the shim;
    /// the rest fail with `AlreadyExists` without touching shim state.
    pub async fn exec(
        &self,
        namespace: &str,
        id: &str,
        exec_id: &str,
        request: taskshim_proto::ExecProcessRequest,
    ) -> Result<()> {
        validate_id(exec_id)?;
        let handle = self.get(namespace, id).await?;

        {
            let mut execs = handle.execs.lock().await;
            if !execs.insert(exec_id.to_string()) {
                return Err(Error::already_exists(format!(
                    "exec {} on task {}",
                    exec_id, id
                )));
            }
        }

        match handle.client.exec(&request).await {
            Ok(()) => {
                self.exchange.publish(
                    namespace.to_string(),
                    taskshim_proto::EventPayload::TaskExecAdded {
                        container_id: id.to_string(),
                        exec_id: exec_id.to_string(),
                    },
                );
                Ok(())
            }
            Err(e) => {
                handle.execs.lock().await.remove(exec_id);
                Err(e)
            }
        }
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<Arc<TaskHandle>> {
        self.tasks
            .read()
            .await
            .get(&Self::key(namespace, id))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{}/{}", namespace, id)))
    }

    pub async fn list(&self, namespace: &str) -> Vec<Arc<TaskHandle>> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Deletes a task: invokes the shim's own delete path, publishes
    /// `TaskDelete`, then removes the bundle and forgets the task.
    pub async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        let handle = self.get(namespace, id).await?;
        {
            let mut status = handle.status.write().await;
            status.can_remove(true)?;
            status.removing = true;
        }

        let response = handle.client.delete(id, None).await?;
        self.exchange.publish(
            namespace.to_string(),
            taskshim_proto::EventPayload::TaskDelete {
                container_id: id.to_string(),
                exit: taskshim_proto::ExitInfo {
                    pid: response.pid,
                    exit_status: response.exit_status,
                    exited_at_ns: crate::types::now_ns(),
                },
            },
        );

        self.store.delete(&handle.bundle)?;
        self.tasks.write().await.remove(&Self::key(namespace, id));
        // Closed explicitly now that the task is gone from the registry, so
        // `watch_on_close`'s background poll observes the close and retires
        // itself instead of polling a task nobody tracks anymore.
        handle.client.channel().close();
        Ok(())
    }

    /// Reloads tasks surviving a process restart by scanning the bundle
    /// store and reconnecting to each one's advertised address. A bundle
    /// whose shim no longer answers is treated as dead and run through
    /// post-mortem cleanup rather than left dangling. Finally, working
    /// directories belonging to no bundle that loaded are purged.
    pub async fn load_all(&self) -> Result<()> {
        let mut loaded_by_namespace: HashMap<String, Vec<String>> = HashMap::new();
        for (namespace, id) in self.store.list_all()? {
            match self.load_one(&namespace, &id).await {
                Ok(()) => loaded_by_namespace
                    .entry(namespace)
                    .or_default()
                    .push(id),
                Err(e) => {
                    log::warn!("failed to reload task {}/{}: {}", namespace, id, e);
                }
            }
        }
        for (namespace, loaded_ids) in &loaded_by_namespace {
            if let Err(e) = self.store.purge_orphan_work_dirs(namespace, loaded_ids) {
                log::warn!("failed to purge orphan work dirs for {}: {}", namespace, e);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn store_for_test(&self) -> &BundleStore {
        &self.store
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, namespace: &str, id: &str, handle: Arc<TaskHandle>) {
        self.tasks
            .write()
            .await
            .insert(Self::key(namespace, id), handle);
    }

    async fn load_one(&self, namespace: &str, id: &str) -> Result<()> {
        let bundle = self.store.load(namespace, id)?;
        self.store.ensure_work_link(&bundle)?;
        let runtime = bundle.read_runtime()?;
        let address = bundle.read_address()?;

        let channel = match ipc::reconnect(&address, Duration::from_secs(10)).await {
            Ok(channel) => channel,
            Err(_) => {
                // The shim is presumed dead: run the same post-mortem path a
                // live disconnect would have triggered, then report the
                // bundle as not loaded so it's excluded from the orphan-work
                // purge's "kept" set.
                let _ = binary::delete_shim(&bundle, &runtime).await;
                let _ = self.store.delete(&bundle);
                return Err(Error::unavailable("shim unreachable on reload"));
            }
        };
        let client = make_client(channel);

        let status = TaskStatus::created(0);
        let handle = Arc::new(TaskHandle::new(
            namespace.to_string(),
            id.to_string(),
            runtime,
            bundle,
            client,
            status,
        ));
        monitor::spawn_exit_router(handle.clone(), self.exchange.clone());
        self.watch_shim_disconnect(handle.clone());
        self.tasks
            .write()
            .await
            .insert(Self::key(namespace, id), handle);
        Ok(())
    }
}

/// Runs once per unexpected shim disconnection. A task already removed from
/// the registry (e.g. a `Delete` raced the disconnect) is left alone —
/// there is nothing left to clean up.
async fn post_mortem_cleanup(
    tasks: TaskMap,
    store: BundleStore,
    exchange: Arc<Exchange>,
    handle: Arc<TaskHandle>,
) {
    let key = TaskManager::key(&handle.namespace, &handle.id);
    {
        let tasks = tasks.read().await;
        if !tasks.contains_key(&key) {
            return;
        }
    }

    let delete_result = tokio::time::timeout(
        Duration::from_secs(10),
        binary::delete_shim(&handle.bundle, &handle.runtime),
    )
    .await;
    if delete_result.is_err() {
        log::warn!(
            "post-mortem delete_shim for {}/{} did not complete within its deadline",
            handle.namespace,
            handle.id
        );
    }

    let exit = taskshim_proto::ExitInfo {
        pid: 0,
        exit_status: crate::types::UNKNOWN_EXIT_CODE,
        exited_at_ns: crate::types::now_ns(),
    };
    {
        let mut status = handle.status.write().await;
        status.apply_exit(exit.exit_status, exit.exited_at_ns);
    }
    log::info!(
        "post-mortem cleanup for {}/{}: shim disconnected unexpectedly",
        handle.namespace,
        handle.id
    );
    exchange.publish(
        handle.namespace.clone(),
        taskshim_proto::EventPayload::TaskExit {
            container_id: handle.id.clone(),
            exec_id: None,
            exit: exit.clone(),
        },
    );
    exchange.publish(
        handle.namespace.clone(),
        taskshim_proto::EventPayload::TaskDelete {
            container_id: handle.id.clone(),
            exit,
        },
    );

    let _ = store.delete(&handle.bundle);
    tasks.write().await.remove(&key);
}

/// Reads `options.json` back as raw JSON text, for `CreateTaskRequest.options`
/// (a `String` rather than a `serde_json::Value` because the request travels
/// over the `bincode`-framed RPC call — see `taskshim_proto`'s module docs).
fn options_value(bundle: &crate::bundle::Bundle) -> Option<String> {
    std::fs::read_to_string(bundle.options_path()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, TaskManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().join("state"), dir.path().join("work"));
        (dir, TaskManager::new(store, Arc::new(Exchange::new(16)), false))
    }

    #[tokio::test]
    async fn create_with_unresolvable_runtime_rolls_back_bundle() {
        let (dir, manager) = manager();
        let err = manager
            .create("default", "c1", "no-such-runtime-xyz", b"{}", None)
            .await;
        assert!(err.is_err());
        assert!(!dir.path().join("state/default/c1").exists());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected_before_touching_disk() {
        let (_dir, manager) = manager();
        // Force a registry collision directly, bypassing bring_up, since a
        // real shim binary isn't available in this test environment.
        let bundle = manager
            .store
            .create("default", "dup", "rt", b"{}", None)
            .unwrap();
        let client = make_client(crate::ipc::test_support::FakeChannel::new(|_m, p| Ok(p)));
        let handle = Arc::new(TaskHandle::new(
            "default".into(),
            "dup".into(),
            "rt".into(),
            bundle,
            client,
            TaskStatus::created(1),
        ));
        manager
            .tasks
            .write()
            .await
            .insert(TaskManager::key("default", "dup"), handle);

        let err = manager.create("default", "dup", "rt", b"{}", None).await;
        assert!(matches!(
            err.unwrap_err(),
            Error::AlreadyExists { .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_exec_reservation_admits_exactly_one_winner() {
        let (_dir, manager) = manager();
        let bundle = manager
            .store
            .create("default", "c1", "rt", b"{}", None)
            .unwrap();
        let client = make_client(crate::ipc::test_support::FakeChannel::new(|_m, p| Ok(p)));
        let handle = Arc::new(TaskHandle::new(
            "default".into(),
            "c1".into(),
            "rt".into(),
            bundle,
            client,
            TaskStatus::created(1),
        ));
        manager
            .tasks
            .write()
            .await
            .insert(TaskManager::key("default", "c1"), handle);

        let request = || taskshim_proto::ExecProcessRequest {
            id: "c1".into(),
            exec_id: "e1".into(),
            terminal: false,
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            spec: serde_json::json!({}).to_string(),
        };
        let first = manager.exec("default", "c1", "e1", request()).await;
        let second = manager.exec("default", "c1", "e1", request()).await;
        assert!(first.is_ok());
        assert!(matches!(second.unwrap_err(), Error::AlreadyExists { .. }));
    }
}
