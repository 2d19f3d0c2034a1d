//! Domain types for containers, tasks, execs, bundles and sandboxes.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub use taskshim_proto::Status;

/// Validates a container or exec ID per spec: 1..76 chars, `[A-Za-z0-9_.-]`,
/// not starting with `.` or `-`.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 76 {
        return Err(Error::invalid_argument(
            "id",
            format!("must be 1..76 characters, got {}", id.len()),
        ));
    }
    if id.contains('/') {
        return Err(Error::invalid_argument("id", "must not contain '/'"));
    }
    let first = id.chars().next().unwrap();
    if first == '.' || first == '-' {
        return Err(Error::invalid_argument(
            "id",
            "must not start with '.' or '-'",
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::invalid_argument(
            "id",
            "must match [A-Za-z0-9_.-]",
        ));
    }
    Ok(())
}

/// Current wall-clock time in nanoseconds since the epoch. Kept as a single
/// helper so the state machine's `FinishedAt == 0` idempotence guard has one
/// place to source "now" from.
pub fn now_ns() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i128
}

pub const START_ERROR_CODE: u32 = 128;
pub const UNKNOWN_EXIT_CODE: u32 = 255;

/// Label key used to mark a Container as a sandbox container.
pub const SANDBOX_KIND_LABEL: &str = "io.cri-containerd.kind";
pub const SANDBOX_KIND_VALUE: &str = "sandbox";

#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub runtime: String,
    /// Opaque OCI spec bytes, immutable after create.
    pub spec: Vec<u8>,
    pub labels: HashMap<String, String>,
    pub options: Option<serde_json::Value>,
}

impl Container {
    pub fn is_sandbox(&self) -> bool {
        self.labels.get(SANDBOX_KIND_LABEL).map(String::as_str) == Some(SANDBOX_KIND_VALUE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    Error,
    StartError,
    OomKilled,
    Unknown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::Completed => "Completed",
            ExitReason::Error => "Error",
            ExitReason::StartError => "StartError",
            ExitReason::OomKilled => "OOMKilled",
            ExitReason::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Mutable run-state for a Task (the init process of a container).
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub status: Status,
    pub starting: bool,
    pub removing: bool,
    pub unknown: bool,
    pub pid: u32,
    pub created_at_ns: i128,
    pub started_at_ns: i128,
    pub finished_at_ns: i128,
    pub exit_code: u32,
    pub exit_reason: Option<ExitReason>,
    pub exit_message: Option<String>,
}

impl TaskStatus {
    pub fn created(pid: u32) -> Self {
        Self {
            status: Status::Created,
            starting: false,
            removing: false,
            unknown: false,
            pid,
            created_at_ns: now_ns(),
            started_at_ns: 0,
            finished_at_ns: 0,
            exit_code: 0,
            exit_reason: None,
            exit_message: None,
        }
    }

    /// Start is refused unless Created, not removing, not already starting
    ///.
    pub fn can_start(&self) -> Result<()> {
        if self.removing {
            return Err(Error::failed_precondition("task is being removed"));
        }
        if self.starting {
            return Err(Error::failed_precondition("task is already starting"));
        }
        if self.status != Status::Created {
            return Err(Error::failed_precondition(format!(
                "cannot start task in state {:?}",
                self.status
            )));
        }
        Ok(())
    }

    /// Remove is refused while Running/Unknown unless forcibly stopped
    /// first, or while starting/already removing.
    pub fn can_remove(&self, force_stop: bool) -> Result<()> {
        if self.starting {
            return Err(Error::failed_precondition("task is starting"));
        }
        if self.removing {
            return Err(Error::failed_precondition("task removal already in progress"));
        }
        if (self.status == Status::Running || self.unknown) && !force_stop {
            return Err(Error::failed_precondition(
                "cannot remove a running task without a forcible stop",
            ));
        }
        Ok(())
    }

    pub fn mark_start_error(&mut self, message: impl Into<String>) {
        self.starting = false;
        self.status = Status::Stopped;
        self.exit_code = START_ERROR_CODE;
        self.exit_reason = Some(ExitReason::StartError);
        self.exit_message = Some(message.into());
        self.finished_at_ns = now_ns();
    }

    /// Applies a TaskExit event. Idempotent against double-signalling: Pid
    /// is only cleared the first time FinishedAt transitions from zero.
    pub fn apply_exit(&mut self, exit_status: u32, exited_at_ns: i128) {
        if self.finished_at_ns == 0 {
            self.pid = 0;
            self.finished_at_ns = exited_at_ns;
            self.exit_code = exit_status;
            self.exit_reason = Some(if exit_status == 0 {
                ExitReason::Completed
            } else {
                ExitReason::Error
            });
        }
        // Unknown may only transition to Stopped.
        self.unknown = false;
        self.status = Status::Stopped;
    }

    pub fn apply_oom(&mut self) {
        self.exit_reason = Some(ExitReason::OomKilled);
    }
}

/// A single process inside a task: the init process or an exec.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub exec_id: Option<String>,
    pub pid: u32,
    pub status: Status,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Ready,
    NotReady,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub state: SandboxState,
    pub pid: Option<u32>,
    pub ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_id_length_and_charset() {
        assert!(validate_id("").is_err());
        assert!(validate_id(&"a".repeat(77)).is_err());
        assert!(validate_id(".hidden").is_err());
        assert!(validate_id("-dash").is_err());
        assert!(validate_id("has/slash").is_err());
        assert!(validate_id("bad space").is_err());
        assert!(validate_id("container_1.v2-final").is_ok());
        assert!(validate_id(&"a".repeat(76)).is_ok());
    }

    #[test]
    fn start_refused_unless_created() {
        let mut t = TaskStatus::created(42);
        t.status = Status::Running;
        assert!(t.can_start().is_err());
        t.status = Status::Created;
        assert!(t.can_start().is_ok());
        t.starting = true;
        assert!(t.can_start().is_err());
    }

    #[test]
    fn apply_exit_is_idempotent_against_double_signal() {
        let mut t = TaskStatus::created(42);
        t.status = Status::Running;
        t.apply_exit(0, 1000);
        assert_eq!(t.pid, 0);
        assert_eq!(t.finished_at_ns, 1000);
        assert_eq!(t.exit_reason, Some(ExitReason::Completed));

        // A second, later exit signal must not move FinishedAt or ExitCode.
        t.apply_exit(9, 2000);
        assert_eq!(t.finished_at_ns, 1000);
        assert_eq!(t.exit_reason, Some(ExitReason::Completed));
    }

    #[test]
    fn non_zero_exit_reason_is_error() {
        let mut t = TaskStatus::created(1);
        t.apply_exit(1, 500);
        assert_eq!(t.exit_reason, Some(ExitReason::Error));
    }

    #[test]
    fn remove_refused_while_running_without_force() {
        let mut t = TaskStatus::created(1);
        t.status = Status::Running;
        assert!(t.can_remove(false).is_err());
        assert!(t.can_remove(true).is_ok());
    }
}
