//! Per-task exit monitor: a background task issuing a blocking `Wait` RPC
//! against a task's shim, routing the eventual exit into its `TaskStatus`
//! and the process-wide event bus.
//!
//! Each event the monitor reacts to is dispatched serially and bounded by a
//! fixed per-event timeout, so one stuck handler can't stall the monitor for
//! every other task sharing a runtime. A `TaskExit` for an id this process
//! no longer tracks (the task was already deleted out from under the
//! monitor) is logged and dropped rather than retried — there is nothing
//! left to apply it to.

use std::sync::Arc;
use std::time::Duration;

use crate::events::Exchange;
use crate::manager::TaskHandle;

const EVENT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns the background task that waits on `handle`'s init process and
/// applies the eventual exit, publishing a `TaskExit` event. On the init
/// process's exit (not a sub-exec's), also invokes the shim's own `Delete`
/// best-effort, so a shim that tears down its own IO pipes on task exit gets
/// a chance to do so before this side asks it to go away for good.
pub fn spawn_exit_router(handle: Arc<TaskHandle>, exchange: Arc<Exchange>) {
    tokio::spawn(async move {
        // The Wait RPC itself is long-lived by design (it resolves only at
        // process exit); only the subsequent event dispatch below is
        // time-boxed.
        match handle.client.wait(&handle.id, None).await {
            Ok(response) => {
                apply_and_publish_exit(
                    &handle,
                    &exchange,
                    response.exit_status,
                    response.exited_at as i128,
                )
                .await;
                if let Err(e) = handle.client.delete(&handle.id, None).await {
                    log::debug!(
                        "post-exit best-effort delete for {}/{} failed: {}",
                        handle.namespace,
                        handle.id,
                        e
                    );
                }
            }
            Err(_) => {
                // Channel closed or dial lost before an exit was observed;
                // the shim is presumed gone. Nothing further to route.
            }
        }
    });
}

async fn apply_and_publish_exit(
    handle: &Arc<TaskHandle>,
    exchange: &Arc<Exchange>,
    exit_status: u32,
    exited_at_ns: i128,
) {
    let dispatch = tokio::time::timeout(EVENT_DISPATCH_TIMEOUT, async {
        {
            let mut status = handle.status.write().await;
            status.apply_exit(exit_status, exited_at_ns);
        }
        exchange.publish(
            handle.namespace.clone(),
            taskshim_proto::EventPayload::TaskExit {
                container_id: handle.id.clone(),
                exec_id: None,
                exit: taskshim_proto::ExitInfo {
                    pid: 0,
                    exit_status,
                    exited_at_ns,
                },
            },
        );
    })
    .await;
    if dispatch.is_err() {
        log::warn!(
            "exit event dispatch for {}/{} exceeded its timeout",
            handle.namespace,
            handle.id
        );
    }
}

/// Routes an exit observed for an id the manager no longer has registered
/// (e.g. it raced a `Delete`). Logged and dropped: silently, since a task
/// already removed has nowhere left to record the exit against.
pub fn drop_orphaned_exit(namespace: &str, container_id: &str) {
    log::debug!(
        "dropping TaskExit for {}/{}: task is no longer tracked",
        namespace,
        container_id
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleStore;
    use crate::ipc::test_support::FakeChannel;
    use crate::manager::DynShimClient;
    use crate::shim::ShimClient;
    use crate::types::TaskStatus;

    fn handle_with_wait_response(
        exit_status: u32,
        exited_at: u64,
    ) -> (tempfile::TempDir, Arc<TaskHandle>) {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().join("state"), dir.path().join("work"));
        let bundle = store.create("default", "c1", "rt", b"{}", None).unwrap();

        let response = taskshim_proto::WaitResponse {
            exit_status,
            exited_at,
        };
        let encoded = bincode::serialize(&response).unwrap();
        let channel = FakeChannel::new(move |_m, _p| Ok(encoded.clone()));
        let client: Arc<DynShimClient> =
            Arc::new(ShimClient::new(Arc::new(channel) as Arc<dyn crate::ipc::IpcChannel>));

        let handle = Arc::new(TaskHandle::new(
            "default".into(),
            "c1".into(),
            "rt".into(),
            bundle,
            client,
            TaskStatus::created(42),
        ));
        (dir, handle)
    }

    #[tokio::test]
    async fn exit_router_applies_exit_and_publishes_event() {
        let (_dir, handle) = handle_with_wait_response(1, 123);
        let exchange = Arc::new(Exchange::new(16));
        let mut sub = exchange.subscribe();

        spawn_exit_router(handle.clone(), exchange.clone());

        let envelope = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.topic, "tasks/exit");

        let status = handle.status.read().await;
        assert_eq!(status.exit_code, 1);
        assert_ne!(status.finished_at_ns, 0);
    }
}
