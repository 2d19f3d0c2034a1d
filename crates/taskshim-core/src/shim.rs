//! `ShimClient`: the typed task-contract facade over an `IpcChannel`.
//!
//! All state-mutating calls are serialized through `send_lock` so that a
//! call and the event it provokes publish in the order they happened on the
//! wire — in particular so `Start`'s `TaskStart` event can never be observed
//! after a `TaskExit` for the same pid.

use std::sync::Arc;

use taskshim_proto::*;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::ipc::IpcChannel;

pub struct ShimClient<C: IpcChannel + ?Sized> {
    channel: Arc<C>,
    send_lock: AsyncMutex<()>,
}

impl<C: IpcChannel + ?Sized> ShimClient<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            send_lock: AsyncMutex::new(()),
        }
    }

    /// The underlying IPC channel, for callers (the task manager) that need
    /// to watch it for disconnection independently of any particular RPC.
    pub fn channel(&self) -> Arc<C> {
        self.channel.clone()
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let payload = bincode::serialize(request)?;
        let response = self.channel.call(method, payload).await?;
        Ok(bincode::deserialize(&response)?)
    }

    /// Runs `f` while holding the send lock, so its RPC and whatever event
    /// publication the caller performs afterward stay ordered against any
    /// other locked call on this client.
    pub async fn with_send_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _guard = self.send_lock.lock().await;
        f().await
    }

    pub async fn connect(&self, id: &str) -> Result<ConnectResponse> {
        self.call(
            method::CONNECT,
            &ConnectRequest { id: id.to_string() },
        )
        .await
    }

    pub async fn create(&self, request: &CreateTaskRequest) -> Result<CreateTaskResponse> {
        self.with_send_lock(|| self.call(method::CREATE, request))
            .await
    }

    pub async fn start(&self, id: &str, exec_id: Option<&str>) -> Result<StartResponse> {
        let request = StartRequest {
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
        };
        self.with_send_lock(|| self.call(method::START, &request))
            .await
    }

    pub async fn exec(&self, request: &ExecProcessRequest) -> Result<()> {
        self.with_send_lock(|| self.call(method::EXEC, request))
            .await
    }

    pub async fn kill(
        &self,
        id: &str,
        exec_id: Option<&str>,
        signal: u32,
        all: bool,
    ) -> Result<()> {
        let request = KillRequest {
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
            signal,
            all,
        };
        let _: () = self
            .with_send_lock(|| self.call(method::KILL, &request))
            .await?;
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let request = StateRequest {
            id: id.to_string(),
            exec_id: None,
        };
        self.with_send_lock(|| self.call(method::PAUSE, &request))
            .await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let request = StateRequest {
            id: id.to_string(),
            exec_id: None,
        };
        self.with_send_lock(|| self.call(method::RESUME, &request))
            .await
    }

    pub async fn resize_pty(
        &self,
        id: &str,
        exec_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let request = ResizePtyRequest {
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
            width,
            height,
        };
        let _: () = self.call(method::RESIZE_PTY, &request).await?;
        Ok(())
    }

    pub async fn close_io(&self, id: &str, exec_id: Option<&str>) -> Result<()> {
        let request = CloseIoRequest {
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
            stdin: true,
        };
        let _: () = self.call(method::CLOSE_IO, &request).await?;
        Ok(())
    }

    /// `State` degrades a closed IPC channel to `NotFound` rather than
    /// propagating `Unavailable`, matching a shim that has already exited
    /// cleanly.
    pub async fn state(&self, id: &str, exec_id: Option<&str>) -> Result<StateResponse> {
        let request = StateRequest {
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
        };
        match self.call(method::STATE, &request).await {
            Err(e) if e.is_ipc_closed() => {
                Err(Error::not_found_with_context(id, "shim connection closed"))
            }
            other => other,
        }
    }

    pub async fn wait(&self, id: &str, exec_id: Option<&str>) -> Result<WaitResponse> {
        let request = WaitRequest {
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
        };
        self.call(method::WAIT, &request).await
    }

    pub async fn delete(&self, id: &str, exec_id: Option<&str>) -> Result<DeleteResponse> {
        let request = DeleteRequest {
            id: id.to_string(),
            exec_id: exec_id.map(str::to_string),
        };
        match self.call(method::DELETE, &request).await {
            Err(e) if e.is_ipc_closed() => Ok(DeleteResponse {
                pid: 0,
                exit_status: 0,
                exited_at: 0,
            }),
            other => other,
        }
    }

    pub async fn checkpoint(&self, request: &CheckpointTaskRequest) -> Result<()> {
        let _: () = self.call(method::CHECKPOINT, request).await?;
        Ok(())
    }

    pub async fn update(&self, request: &UpdateTaskRequest) -> Result<()> {
        let _: () = self.call(method::UPDATE, request).await?;
        Ok(())
    }

    pub async fn stats(&self, id: &str) -> Result<StatsResponse> {
        self.call(
            method::STATS,
            &StatsRequest { id: id.to_string() },
        )
        .await
    }

    pub async fn pids(&self, id: &str) -> Result<PidsResponse> {
        self.call(method::PIDS, &PidsRequest { id: id.to_string() })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::test_support::FakeChannel;

    fn client_with<F>(handler: F) -> ShimClient<FakeChannel<F>>
    where
        F: Fn(&str, Vec<u8>) -> Result<Vec<u8>> + Send + Sync,
    {
        ShimClient::new(Arc::new(FakeChannel::new(handler)))
    }

    #[tokio::test]
    async fn start_round_trips_pid() {
        let client = client_with(|m, _p| {
            assert_eq!(m, method::START);
            Ok(bincode::serialize(&StartResponse { pid: 99 }).unwrap())
        });
        let resp = client.start("c1", None).await.unwrap();
        assert_eq!(resp.pid, 99);
    }

    #[tokio::test]
    async fn state_degrades_closed_channel_to_not_found() {
        let channel = Arc::new(FakeChannel::new(|_m, _p| {
            Err(Error::unavailable("closed"))
        }));
        let client = ShimClient::new(channel);
        let err = client.state("c1", None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_against_closed_channel_is_not_an_error() {
        let channel = Arc::new(FakeChannel::new(|_m, _p| {
            Err(Error::unavailable("closed"))
        }));
        let client = ShimClient::new(channel);
        let resp = client.delete("c1", None).await.unwrap();
        assert_eq!(resp.pid, 0);
    }
}
