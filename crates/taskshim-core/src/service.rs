//! Task service: the externally-facing surface that validates arguments,
//! maps them onto `TaskManager` operations, and maps the result back onto
//! the error taxonomy callers expect.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::manager::TaskManager;
use crate::types::validate_id;

pub struct TaskService {
    manager: Arc<TaskManager>,
}

impl TaskService {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }

    pub async fn create(
        &self,
        namespace: &str,
        id: &str,
        runtime: &str,
        spec: &[u8],
        options: Option<serde_json::Value>,
    ) -> Result<u32> {
        validate_id(id)?;
        let handle = self
            .manager
            .create(namespace, id, runtime, spec, options.as_ref())
            .await?;
        Ok(handle.status.read().await.pid)
    }

    /// Starts the task's init process (`exec_id: None`) or a previously
    /// added exec (`exec_id: Some(_)`). An exec start never touches the
    /// container-level `TaskStatus` — only the init process's lifecycle is
    /// tracked there — and publishes `TaskExecStarted` rather than
    /// `TaskStart`.
    pub async fn start(&self, namespace: &str, id: &str, exec_id: Option<&str>) -> Result<u32> {
        let handle = self.manager.get(namespace, id).await?;

        if let Some(exec_id) = exec_id {
            let response = handle.client.start(id, Some(exec_id)).await?;
            self.manager.publish(
                namespace,
                taskshim_proto::EventPayload::TaskExecStarted {
                    container_id: id.to_string(),
                    exec_id: exec_id.to_string(),
                    pid: response.pid,
                },
            );
            return Ok(response.pid);
        }

        {
            let status = handle.status.read().await;
            status.can_start()?;
        }
        handle.status.write().await.starting = true;

        let result = handle.client.start(id, None).await;
        let mut status = handle.status.write().await;
        status.starting = false;
        match result {
            Ok(response) => {
                status.status = crate::types::Status::Running;
                status.started_at_ns = crate::types::now_ns();
                status.pid = response.pid;
                drop(status);
                self.manager.publish(
                    namespace,
                    taskshim_proto::EventPayload::TaskStart {
                        container_id: id.to_string(),
                        pid: response.pid,
                    },
                );
                Ok(response.pid)
            }
            Err(e) => {
                status.mark_start_error(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn exec(
        &self,
        namespace: &str,
        id: &str,
        exec_id: &str,
        request: taskshim_proto::ExecProcessRequest,
    ) -> Result<()> {
        self.manager.exec(namespace, id, exec_id, request).await
    }

    pub async fn resize_pty(
        &self,
        namespace: &str,
        id: &str,
        exec_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.resize_pty(id, exec_id, width, height).await
    }

    pub async fn close_io(&self, namespace: &str, id: &str, exec_id: Option<&str>) -> Result<()> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.close_io(id, exec_id).await
    }

    pub async fn wait(
        &self,
        namespace: &str,
        id: &str,
        exec_id: Option<&str>,
    ) -> Result<taskshim_proto::WaitResponse> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.wait(id, exec_id).await
    }

    pub async fn checkpoint(
        &self,
        namespace: &str,
        id: &str,
        options: taskshim_proto::CheckpointOptions,
    ) -> Result<()> {
        let handle = self.manager.get(namespace, id).await?;
        let path = options.image_path.clone();
        handle
            .client
            .checkpoint(&taskshim_proto::CheckpointTaskRequest {
                id: id.to_string(),
                path: path.clone(),
                options,
            })
            .await?;
        self.manager.publish(
            namespace,
            taskshim_proto::EventPayload::TaskCheckpointed {
                container_id: id.to_string(),
                path,
            },
        );
        Ok(())
    }

    pub async fn update(
        &self,
        namespace: &str,
        id: &str,
        resources: taskshim_proto::Resources,
    ) -> Result<()> {
        let handle = self.manager.get(namespace, id).await?;
        handle
            .client
            .update(&taskshim_proto::UpdateTaskRequest {
                id: id.to_string(),
                resources,
            })
            .await
    }

    pub async fn kill(
        &self,
        namespace: &str,
        id: &str,
        exec_id: Option<&str>,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.kill(id, exec_id, signal, all).await
    }

    pub async fn pause(&self, namespace: &str, id: &str) -> Result<()> {
        let handle = self.manager.get(namespace, id).await?;
        {
            let mut status = handle.status.write().await;
            if status.status != crate::types::Status::Running {
                return Err(Error::failed_precondition(
                    "cannot pause a task that is not running",
                ));
            }
            status.status = crate::types::Status::Pausing;
        }
        let result = handle.client.pause(id).await;
        let mut status = handle.status.write().await;
        match &result {
            Ok(()) => {
                status.status = crate::types::Status::Paused;
                drop(status);
                self.manager.publish(
                    namespace,
                    taskshim_proto::EventPayload::TaskPaused {
                        container_id: id.to_string(),
                    },
                );
            }
            Err(_) => status.status = crate::types::Status::Running,
        }
        result
    }

    pub async fn resume(&self, namespace: &str, id: &str) -> Result<()> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.resume(id).await?;
        handle.status.write().await.status = crate::types::Status::Running;
        self.manager.publish(
            namespace,
            taskshim_proto::EventPayload::TaskResumed {
                container_id: id.to_string(),
            },
        );
        Ok(())
    }

    pub async fn state(
        &self,
        namespace: &str,
        id: &str,
        exec_id: Option<&str>,
    ) -> Result<taskshim_proto::StateResponse> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.state(id, exec_id).await
    }

    pub async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        self.manager.delete(namespace, id).await
    }

    /// Deletes one exec process without tearing down the task itself.
    pub async fn delete_process(
        &self,
        namespace: &str,
        id: &str,
        exec_id: &str,
    ) -> Result<taskshim_proto::DeleteResponse> {
        let handle = self.manager.get(namespace, id).await?;
        let response = handle.client.delete(id, Some(exec_id)).await?;
        handle.execs.lock().await.remove(exec_id);
        Ok(response)
    }

    pub async fn list(&self, namespace: &str) -> Vec<String> {
        self.manager
            .list(namespace)
            .await
            .into_iter()
            .map(|h| h.id.clone())
            .collect()
    }

    pub async fn stats(&self, namespace: &str, id: &str) -> Result<taskshim_proto::StatsResponse> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.stats(id).await
    }

    pub async fn pids(&self, namespace: &str, id: &str) -> Result<taskshim_proto::PidsResponse> {
        let handle = self.manager.get(namespace, id).await?;
        handle.client.pids(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleStore;
    use crate::events::Exchange;

    fn service() -> (tempfile::TempDir, TaskService) {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().join("state"), dir.path().join("work"));
        let manager = Arc::new(TaskManager::new(store, Arc::new(Exchange::new(16)), false));
        (dir, TaskService::new(manager))
    }

    #[tokio::test]
    async fn create_rejects_invalid_id_before_touching_the_manager() {
        let (_dir, svc) = service();
        let err = svc
            .create("default", "-bad", "rt", b"{}", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn start_on_unknown_task_is_not_found() {
        let (_dir, svc) = service();
        let err = svc.start("default", "ghost", None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
