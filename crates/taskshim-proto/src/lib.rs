//! Wire types shared between the task manager and a shim process.
//!
//! The transport itself (ttrpc framing, connection lifecycle) is an assumed
//! external dependency; this crate only fixes the payloads carried over it.
//! Every request/response pair is `bincode`-encoded and sent as the opaque
//! byte payload of a ttrpc unary call keyed by method name (see
//! `taskshim_core::ipc`). Because `bincode` is not self-describing, any
//! field that would otherwise be a free-form `serde_json::Value` is carried
//! as a JSON-encoded `String` instead (`CreateTaskRequest.options`,
//! `ExecProcessRequest.spec`, `StatsResponse.stats`, `ProcessInfo.info`) —
//! `Value`'s `Deserialize` impl always calls `deserialize_any`, which
//! `bincode` rejects. `StartOptions.extra` is the one exception, since it
//! travels over the shim's stdin as plain JSON rather than this frame.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a task or exec process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

/// A single rootfs mount entry, as recorded in the OCI bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub mount_type: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryResources {
    pub limit: i64,
    pub swap: i64,
    pub reservation: i64,
    pub disable_oom_killer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CpuResources {
    pub shares: u64,
    pub quota: i64,
    pub period: u64,
    pub cpus: String,
    pub mems: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PidsResources {
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Resources {
    pub memory: Option<MemoryResources>,
    pub cpu: Option<CpuResources>,
    pub pids: Option<PidsResources>,
}

/// Options blob handed to the shim on `start`, over stdin. This is the one
/// payload in this file that keeps `extra` as a bare `serde_json::Value`:
/// it never goes through the `bincode`-framed RPC call path in `shim.rs`,
/// only a one-shot JSON write to the child's stdin, so `Value`'s
/// non-self-describing `Deserialize` impl is never a problem for it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartOptions {
    pub debug: bool,
    pub namespace: String,
    pub id: String,
    pub containerd_address: String,
    pub ttrpc_address: String,
    pub extra: serde_json::Value,
}

// ---- Create -----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub id: String,
    pub bundle: String,
    pub rootfs: Vec<Mount>,
    pub terminal: bool,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub checkpoint: Option<String>,
    /// JSON-encoded runtime options, carried as text rather than
    /// `serde_json::Value`: the wire is `bincode`, which is not
    /// self-describing and rejects `Value`'s `deserialize_any` at runtime.
    pub options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub pid: u32,
}

// ---- Start / Exec -------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub id: String,
    pub exec_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProcessRequest {
    pub id: String,
    pub exec_id: String,
    pub terminal: bool,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    /// JSON-encoded process spec, as text for the same reason
    /// `CreateTaskRequest.options` is: `bincode` cannot deserialize a bare
    /// `serde_json::Value`.
    pub spec: String,
}

// ---- Kill / Pause / Resume ---------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    pub id: String,
    pub exec_id: Option<String>,
    pub signal: u32,
    pub all: bool,
}

// ---- ResizePty / CloseIO ------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizePtyRequest {
    pub id: String,
    pub exec_id: Option<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseIoRequest {
    pub id: String,
    pub exec_id: Option<String>,
    pub stdin: bool,
}

// ---- State / Wait / Delete ----------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub id: String,
    pub exec_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub id: String,
    pub bundle: String,
    pub pid: u32,
    pub status: Status,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub exit_status: u32,
    pub exited_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRequest {
    pub id: String,
    pub exec_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub exit_status: u32,
    pub exited_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub id: String,
    pub exec_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: u64,
}

// ---- Checkpoint / Update / Stats / Pids ---------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointOptions {
    pub exit: bool,
    pub work_path: String,
    pub image_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTaskRequest {
    pub id: String,
    pub path: String,
    pub options: CheckpointOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    pub id: String,
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    /// JSON-encoded stats blob, as text: see `CreateTaskRequest.options` for
    /// why this isn't a bare `serde_json::Value` over the `bincode` wire.
    pub stats: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub exec_id: Option<String>,
    /// JSON-encoded per-process detail, as text for the same `bincode`/
    /// `serde_json::Value` reason as the other payloads in this file.
    pub info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsResponse {
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub shim_pid: u32,
    pub task_pid: u32,
    pub version: String,
}

/// The method names routed over the IPC transport. Kept as `&'static str`
/// constants rather than an enum so the ttrpc service-name dispatch in
/// `taskshim-core::ipc` stays a straight string match against a task
/// service's own RPC method names.
pub mod method {
    pub const CONNECT: &str = "Connect";
    pub const CREATE: &str = "Create";
    pub const START: &str = "Start";
    pub const DELETE: &str = "Delete";
    pub const PIDS: &str = "Pids";
    pub const PAUSE: &str = "Pause";
    pub const RESUME: &str = "Resume";
    pub const CHECKPOINT: &str = "Checkpoint";
    pub const KILL: &str = "Kill";
    pub const EXEC: &str = "Exec";
    pub const RESIZE_PTY: &str = "ResizePty";
    pub const CLOSE_IO: &str = "CloseIO";
    pub const UPDATE: &str = "Update";
    pub const WAIT: &str = "Wait";
    pub const STATS: &str = "Stats";
    pub const STATE: &str = "State";
    pub const SHUTDOWN: &str = "Shutdown";
}

// ---- Event bus envelope --------------------------------------------------

/// A published lifecycle event. `namespace` + `topic` are the pub/sub
/// routing key; `payload` carries the typed body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub namespace: String,
    pub topic: String,
    pub timestamp_ns: i128,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitInfo {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at_ns: i128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    TaskCreate {
        container_id: String,
        pid: u32,
        bundle: String,
    },
    TaskStart {
        container_id: String,
        pid: u32,
    },
    TaskExecAdded {
        container_id: String,
        exec_id: String,
    },
    TaskExecStarted {
        container_id: String,
        exec_id: String,
        pid: u32,
    },
    TaskPaused {
        container_id: String,
    },
    TaskResumed {
        container_id: String,
    },
    TaskOom {
        container_id: String,
    },
    TaskExit {
        container_id: String,
        exec_id: Option<String>,
        exit: ExitInfo,
    },
    TaskDelete {
        container_id: String,
        exit: ExitInfo,
    },
    TaskCheckpointed {
        container_id: String,
        path: String,
    },
    ImageCreate {
        name: String,
        labels: HashMap<String, String>,
    },
    ImageUpdate {
        name: String,
        labels: HashMap<String, String>,
    },
    ImageDelete {
        name: String,
    },
}

impl EventPayload {
    /// Topic string this payload publishes under, e.g. `"tasks/exit"`.
    pub fn topic(&self) -> &'static str {
        match self {
            EventPayload::TaskCreate { .. } => "tasks/create",
            EventPayload::TaskStart { .. } => "tasks/start",
            EventPayload::TaskExecAdded { .. } => "tasks/exec-added",
            EventPayload::TaskExecStarted { .. } => "tasks/exec-started",
            EventPayload::TaskPaused { .. } => "tasks/paused",
            EventPayload::TaskResumed { .. } => "tasks/resumed",
            EventPayload::TaskOom { .. } => "tasks/oom",
            EventPayload::TaskExit { .. } => "tasks/exit",
            EventPayload::TaskDelete { .. } => "tasks/delete",
            EventPayload::TaskCheckpointed { .. } => "tasks/checkpointed",
            EventPayload::ImageCreate { .. } => "images/create",
            EventPayload::ImageUpdate { .. } => "images/update",
            EventPayload::ImageDelete { .. } => "images/delete",
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match self {
            EventPayload::TaskCreate { container_id, .. }
            | EventPayload::TaskStart { container_id, .. }
            | EventPayload::TaskExecAdded { container_id, .. }
            | EventPayload::TaskExecStarted { container_id, .. }
            | EventPayload::TaskPaused { container_id }
            | EventPayload::TaskResumed { container_id }
            | EventPayload::TaskOom { container_id }
            | EventPayload::TaskExit { container_id, .. }
            | EventPayload::TaskDelete { container_id, .. }
            | EventPayload::TaskCheckpointed { container_id, .. } => Some(container_id),
            EventPayload::ImageCreate { .. }
            | EventPayload::ImageUpdate { .. }
            | EventPayload::ImageDelete { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_bincode() {
        let env = Envelope {
            namespace: "default".into(),
            topic: "tasks/exit".into(),
            timestamp_ns: 42,
            payload: EventPayload::TaskExit {
                container_id: "c1".into(),
                exec_id: None,
                exit: ExitInfo {
                    pid: 100,
                    exit_status: 0,
                    exited_at_ns: 42,
                },
            },
        };
        let bytes = bincode::serialize(&env).unwrap();
        let back: Envelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.topic, "tasks/exit");
        assert_eq!(back.payload.container_id(), Some("c1"));
    }

    #[test]
    fn topic_strings_match_spec_names() {
        assert_eq!(
            EventPayload::TaskOom {
                container_id: "x".into()
            }
            .topic(),
            "tasks/oom"
        );
        assert_eq!(
            EventPayload::ImageCreate {
                name: "x".into(),
                labels: HashMap::new()
            }
            .topic(),
            "images/create"
        );
    }
}
