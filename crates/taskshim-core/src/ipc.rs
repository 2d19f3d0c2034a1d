//! IPC transport: a small framed RPC channel over a local Unix socket, plus
//! the `IpcChannel` seam the shim client is written against so unit tests
//! can substitute an in-process fake instead of dialing a real subprocess.
//!
//! The wire codec itself is assumed-given infrastructure; this
//! module's `FramedUnixChannel` is the minimal concrete instance of it,
//! length-prefixing a method name and a `bincode`-encoded payload over a raw
//! `UnixListener` loop rather than a full ttrpc wire codec.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex as AsyncMutex;

/// A single bidirectional RPC channel to a shim process.
#[async_trait]
pub trait IpcChannel: Send + Sync {
    async fn call(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>>;
    fn is_closed(&self) -> bool;
    /// Marks the channel closed from this side, e.g. once a `Delete` has
    /// completed and `watch_on_close`'s background poll no longer needs to
    /// run. Default no-op for channels that don't track an explicit close.
    fn close(&self) {}
}

/// Dial the address advertised by a freshly started shim. Bounded by
/// `timeout` (baseline 5s for a fresh shim).
pub async fn dial(address: &str, timeout: Duration) -> Result<FramedUnixChannel> {
    tokio::time::timeout(timeout, FramedUnixChannel::connect(address))
        .await
        .map_err(|_| Error::deadline_exceeded(format!("dialing {}", address)))?
}

/// Reconnect to a shim surviving a parent restart. Bounded by up to 10s
/// (spec §7); dial failure here means the shim is declared dead.
pub async fn reconnect(address: &str, timeout: Duration) -> Result<FramedUnixChannel> {
    dial(address, timeout).await
}

/// Registers a callback invoked exactly once when the channel's connection
/// closes, whether due to the peer hanging up or an explicit `close()`.
pub fn watch_on_close<C>(channel: Arc<C>, on_close: impl FnOnce() + Send + 'static)
where
    C: IpcChannel + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if channel.is_closed() {
                on_close();
                break;
            }
        }
    });
}

/// Frame layout: `[u32 method_len][method bytes][u32 payload_len][payload]`
/// request, `[u8 ok][u32 payload_len][payload]` response.
pub struct FramedUnixChannel {
    stream: AsyncMutex<UnixStream>,
    closed: AtomicBool,
}

impl FramedUnixChannel {
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = UnixStream::connect(address)
            .await
            .map_err(|e| Error::io_with_context(e, format!("connecting to {}", address)))?;
        Ok(Self {
            stream: AsyncMutex::new(stream),
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream: AsyncMutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }

    async fn write_frame(stream: &mut UnixStream, method: &str, payload: &[u8]) -> Result<()> {
        let method_bytes = method.as_bytes();
        stream.write_u32(method_bytes.len() as u32).await?;
        stream.write_all(method_bytes).await?;
        stream.write_u32(payload.len() as u32).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_response(stream: &mut UnixStream) -> Result<Vec<u8>> {
        let ok = stream.read_u8().await?;
        let len = stream.read_u32().await? as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        if ok == 0 {
            let message = String::from_utf8_lossy(&buf).to_string();
            return Err(Error::runtime(message));
        }
        Ok(buf)
    }
}

#[async_trait]
impl IpcChannel for FramedUnixChannel {
    async fn call(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::unavailable("ipc channel closed"));
        }
        let mut guard = self.stream.lock().await;
        let result = async {
            Self::write_frame(&mut guard, method, &payload).await?;
            Self::read_response(&mut guard).await
        }
        .await;
        if result.is_err() {
            self.closed.store(true, Ordering::SeqCst);
        }
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Serves the same frame protocol from the shim side. Used by reference
/// shim implementations (`taskshim-agent`) and by tests that stand up a
/// fake shim in-process.
pub async fn serve_unix<F, Fut>(socket_path: &Path, mut handler: F) -> Result<()>
where
    F: FnMut(String, Vec<u8>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<Vec<u8>>> + Send,
{
    let _ = std::fs::remove_file(socket_path);
    let listener = tokio::net::UnixListener::bind(socket_path)
        .map_err(|e| Error::io_with_context(e, format!("binding {}", socket_path.display())))?;
    loop {
        let (mut stream, _) = listener.accept().await?;
        loop {
            let method_len = match stream.read_u32().await {
                Ok(n) => n as usize,
                Err(_) => break,
            };
            let mut method_buf = vec![0u8; method_len];
            if stream.read_exact(&mut method_buf).await.is_err() {
                break;
            }
            let method = String::from_utf8_lossy(&method_buf).to_string();
            let payload_len = match stream.read_u32().await {
                Ok(n) => n as usize,
                Err(_) => break,
            };
            let mut payload = vec![0u8; payload_len];
            if stream.read_exact(&mut payload).await.is_err() {
                break;
            }
            match handler(method, payload).await {
                Ok(resp) => {
                    let _ = stream.write_u8(1).await;
                    let _ = stream.write_u32(resp.len() as u32).await;
                    let _ = stream.write_all(&resp).await;
                }
                Err(e) => {
                    let msg = e.to_string();
                    let _ = stream.write_u8(0).await;
                    let _ = stream.write_u32(msg.len() as u32).await;
                    let _ = stream.write_all(msg.as_bytes()).await;
                }
            }
            let _ = stream.flush().await;
        }
    }
}

/// An in-process fake channel: routes calls to a closure instead of a real
/// subprocess. Shared test support used by this module's own tests and by
/// `shim`/`manager` unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    pub struct FakeChannel<F> {
        pub handler: F,
        pub closed: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl<F> FakeChannel<F> {
        pub fn new(handler: F) -> Self {
            Self {
                handler,
                closed: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl<F> IpcChannel for FakeChannel<F>
    where
        F: Fn(&str, Vec<u8>) -> Result<Vec<u8>> + Send + Sync,
    {
        async fn call(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::unavailable("closed"));
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.handler)(method, payload)
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
