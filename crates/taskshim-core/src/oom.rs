//! OOM watcher: one task per container, polymorphic over the host's cgroup
//! version. A cgroup v1 host is watched by epolling the cgroup's
//! `memory.oom_control` event fd; a v2 host has no such fd and is watched by
//! draining an mpsc channel fed by a poller of `memory.events`' `oom_kill`
//! counter.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

/// A live OOM watch for one container's cgroup, tagged by cgroup version so
/// callers don't need a trait object for what is, in practice, exactly two
/// shapes.
pub enum CgroupHandle {
    V1 { event_fd: std::os::fd::RawFd },
    V2 { events_path: PathBuf },
}

/// Spawns the watch and returns a receiver that yields once per OOM kill
/// observed. Dropping the receiver stops the watch on the next poll tick.
pub fn watch(handle: CgroupHandle) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(8);
    match handle {
        CgroupHandle::V1 { event_fd } => spawn_v1_watch(event_fd, tx),
        CgroupHandle::V2 { events_path } => spawn_v2_watch(events_path, tx),
    }
    rx
}

#[cfg(target_os = "linux")]
fn spawn_v1_watch(event_fd: std::os::fd::RawFd, tx: mpsc::Sender<()>) {
    use nix::poll::{poll, PollFd, PollFlags};
    use std::os::fd::BorrowedFd;

    tokio::task::spawn_blocking(move || {
        loop {
            let borrowed = unsafe { BorrowedFd::borrow_raw(event_fd) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            let n = match poll(&mut fds, -1i32) {
                Ok(n) => n,
                Err(_) => break,
            };
            if n <= 0 {
                continue;
            }
            // The event fd is read-and-reset: draining it acknowledges the
            // notification and arms the next one.
            let mut buf = [0u8; 8];
            let _ = nix::unistd::read(event_fd, &mut buf);
            if tx.blocking_send(()).is_err() {
                break;
            }
        }
    });
}

#[cfg(not(target_os = "linux"))]
fn spawn_v1_watch(_event_fd: std::os::fd::RawFd, _tx: mpsc::Sender<()>) {}

/// cgroup v2 exposes no event fd; `memory.events`' `oom_kill` field is a
/// monotonic counter this side polls and diffs.
fn spawn_v2_watch(events_path: PathBuf, tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        let last = AtomicU64::new(read_oom_kill(&events_path).unwrap_or(0));
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let current = match read_oom_kill(&events_path) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let previous = last.swap(current, Ordering::SeqCst);
            if current > previous && tx.send(()).await.is_err() {
                break;
            }
        }
    });
}

fn read_oom_kill(events_path: &PathBuf) -> std::io::Result<u64> {
    let contents = std::fs::read_to_string(events_path)?;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("oom_kill ") {
            return Ok(value.trim().parse().unwrap_or(0));
        }
    }
    Ok(0)
}

/// Drives OOM notifications for a single container into the event bus,
/// independent of which cgroup version produced them.
pub async fn forward_to_exchange(
    mut rx: mpsc::Receiver<()>,
    exchange: Arc<crate::events::Exchange>,
    namespace: String,
    container_id: String,
) {
    while rx.recv().await.is_some() {
        exchange.publish(
            namespace.clone(),
            taskshim_proto::EventPayload::TaskOom {
                container_id: container_id.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_oom_kill_counter_from_memory_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.events");
        std::fs::write(&path, "low 0\nhigh 0\nmax 2\noom 1\noom_kill 3\n").unwrap();
        assert_eq!(read_oom_kill(&path).unwrap(), 3);
    }

    #[test]
    fn missing_oom_kill_line_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.events");
        std::fs::write(&path, "low 0\n").unwrap();
        assert_eq!(read_oom_kill(&path).unwrap(), 0);
    }

    #[tokio::test]
    async fn v2_watch_emits_once_per_counter_increase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.events");
        std::fs::write(&path, "oom_kill 0\n").unwrap();

        let mut rx = watch(CgroupHandle::V2 {
            events_path: path.clone(),
        });

        std::fs::write(&path, "oom_kill 1\n").unwrap();
        let notified = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watch should notify within timeout");
        assert!(notified.is_some());
    }
}
