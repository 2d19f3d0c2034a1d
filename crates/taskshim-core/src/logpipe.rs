//! Deferred pipe logger: a bounded in-memory ring buffer that a container's
//! log FIFO is copied into, decoupling the writer (the shim, or a process
//! inside the container) from however long it takes this side to actually
//! drain the buffer into a sink.
//!
//! Capacity is fixed at 64 KiB. A writer that outpaces the buffer blocks
//! until a reader drains it — back-pressure is deliberate, not a bug: a
//! container that produces log output faster than anyone reads it should
//! stall rather than have its logs silently truncated.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

const BUFFER_CAPACITY: usize = 64 * 1024;

struct Inner {
    buffer: Mutex<VecDeque<u8>>,
    not_empty: Notify,
    not_full: Notify,
    aborted: std::sync::atomic::AtomicBool,
}

/// A single bounded pipe: one writer side, any number of readers that each
/// see the same byte stream from wherever they attach.
pub struct PipeLog {
    inner: std::sync::Arc<Inner>,
}

impl PipeLog {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                buffer: Mutex::new(VecDeque::with_capacity(BUFFER_CAPACITY)),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                aborted: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn writer(&self) -> PipeWriter {
        PipeWriter {
            inner: self.inner.clone(),
        }
    }

    pub fn reader(&self) -> PipeReader {
        PipeReader {
            inner: self.inner.clone(),
            cursor: 0,
        }
    }

    /// Marks the pipe terminal: any writer blocked on a full buffer is
    /// released, and readers observe end-of-stream once the buffer drains.
    pub fn abort(&self) {
        self.inner
            .aborted
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.not_full.notify_waiters();
        self.inner.not_empty.notify_waiters();
    }
}

impl Default for PipeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct PipeWriter {
    inner: std::sync::Arc<Inner>,
}

impl PipeWriter {
    /// Appends `data`, blocking in FIFO order while the buffer is full.
    pub async fn write(&self, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            if self.inner.aborted.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            // Register for the next notification before re-checking the
            // buffer, so a reader that drains it between our check and our
            // await can't leave us waiting on a notification already sent.
            let not_full = self.inner.not_full.notified();
            let wrote = {
                let mut buffer = self.inner.buffer.lock().unwrap();
                let space = BUFFER_CAPACITY.saturating_sub(buffer.len());
                let take = space.min(data.len() - offset);
                buffer.extend(&data[offset..offset + take]);
                take
            };
            if wrote > 0 {
                self.inner.not_empty.notify_waiters();
                offset += wrote;
            } else {
                not_full.await;
            }
        }
    }

    /// Copies a FIFO or other readable source into this pipe until EOF or
    /// the pipe is aborted.
    pub async fn copy_from(&self, mut source: impl tokio::io::AsyncRead + Unpin) {
        let mut buf = [0u8; 4096];
        loop {
            if self.inner.aborted.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => self.write(&buf[..n]).await,
            }
        }
    }
}

pub struct PipeReader {
    inner: std::sync::Arc<Inner>,
    cursor: usize,
}

impl PipeReader {
    /// Reads up to `max` bytes already buffered, reconnecting from wherever
    /// this reader left off. Returns `None` once the pipe is aborted and
    /// fully drained.
    pub async fn read(&mut self, max: usize) -> Option<Vec<u8>> {
        loop {
            let not_empty = self.inner.not_empty.notified();
            let (chunk, drained_and_aborted) = {
                let buffer = self.inner.buffer.lock().unwrap();
                let available = buffer.len().saturating_sub(self.cursor);
                if available == 0 {
                    let aborted = self.inner.aborted.load(std::sync::atomic::Ordering::SeqCst);
                    (None, aborted)
                } else {
                    let take = available.min(max);
                    let chunk: Vec<u8> = buffer
                        .iter()
                        .skip(self.cursor)
                        .take(take)
                        .copied()
                        .collect();
                    (Some(chunk), false)
                }
            };
            if let Some(chunk) = chunk {
                self.cursor += chunk.len();
                self.reclaim_consumed();
                return Some(chunk);
            }
            if drained_and_aborted {
                return None;
            }
            not_empty.await;
        }
    }

    /// Drops bytes every reader has already consumed, bounding the buffer
    /// even though readers advance at different rates. With a single
    /// reader — the common case — this is simply "pop what was read".
    fn reclaim_consumed(&mut self) {
        let mut buffer = self.inner.buffer.lock().unwrap();
        let reclaimable = self.cursor.min(buffer.len());
        for _ in 0..reclaimable {
            buffer.pop_front();
        }
        self.cursor -= reclaimable;
        self.inner.not_full.notify_waiters();
    }
}

/// Drains a `PipeReader` into an `AsyncWrite` sink (e.g. a client's log
/// stream connection) until the pipe is aborted and exhausted.
pub async fn stream_to(mut reader: PipeReader, mut sink: impl tokio::io::AsyncWrite + Unpin) {
    while let Some(chunk) = reader.read(4096).await {
        if sink.write_all(&chunk).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let pipe = PipeLog::new();
        let writer = pipe.writer();
        let mut reader = pipe.reader();

        writer.write(b"hello").await;
        let chunk = reader.read(16).await.unwrap();
        assert_eq!(chunk, b"hello");
    }

    #[tokio::test]
    async fn reader_blocks_until_more_data_arrives() {
        let pipe = PipeLog::new();
        let writer = pipe.writer();
        let mut reader = pipe.reader();

        let read_task = tokio::spawn(async move { reader.read(16).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        writer.write(b"late").await;

        let chunk = tokio::time::timeout(std::time::Duration::from_secs(1), read_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.unwrap(), b"late");
    }

    #[tokio::test]
    async fn abort_unblocks_reader_with_none() {
        let pipe = PipeLog::new();
        let mut reader = pipe.reader();
        pipe.abort();
        assert!(reader.read(16).await.is_none());
    }

    #[tokio::test]
    async fn writer_blocks_when_buffer_is_full() {
        let pipe = PipeLog::new();
        let writer = pipe.writer();
        let big = vec![b'x'; BUFFER_CAPACITY];
        writer.write(&big).await;

        let writer2 = pipe.writer();
        let blocked = tokio::spawn(async move { writer2.write(b"more").await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let mut reader = pipe.reader();
        reader.read(BUFFER_CAPACITY).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
    }
}
