//! Reference shim process: the out-of-process peer `taskshim-core` spawns
//! and supervises. On `start` it serves the task contract over a Unix
//! socket; on `delete` it tells a previously-started sibling instance (via
//! the same socket) to tear the container down and exits.
//!
//! This is a reference implementation, not a production container runtime
//! shim: the "container" it supervises is just the bundle's configured
//! command run as a plain child process, with no namespace/cgroup isolation
//! of its own. It exists to give `taskshim-core` something real to drive
//! end-to-end.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use taskshim_proto::*;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

struct AgentConfig {
    namespace: String,
    id: String,
    address: String,
    bundle: String,
    debug: bool,
    action: Action,
}

enum Action {
    Start,
    Delete,
}

fn parse_args() -> AgentConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut namespace = String::new();
    let mut id = String::new();
    let mut address = String::new();
    let mut bundle = String::new();
    let mut debug = false;
    let mut action = Action::Start;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-namespace" => {
                i += 1;
                namespace = args.get(i).cloned().unwrap_or_default();
            }
            "-id" => {
                i += 1;
                id = args.get(i).cloned().unwrap_or_default();
            }
            "-address" => {
                i += 1;
                address = args.get(i).cloned().unwrap_or_default();
            }
            "-bundle" => {
                i += 1;
                bundle = args.get(i).cloned().unwrap_or_default();
            }
            "-debug" => debug = true,
            "start" => action = Action::Start,
            "delete" => action = Action::Delete,
            other => eprintln!("unrecognized argument: {}", other),
        }
        i += 1;
    }

    AgentConfig {
        namespace,
        id,
        address,
        bundle,
        debug,
        action,
    }
}

#[derive(Serialize, Deserialize)]
struct ContainerSpec {
    #[serde(default)]
    process: ProcessSpec,
}

#[derive(Serialize, Deserialize, Default)]
struct ProcessSpec {
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default = "default_cwd")]
    cwd: String,
}

fn default_cwd() -> String {
    "/".to_string()
}

struct ProcessEntry {
    child: Child,
    pid: u32,
    exit_status: Option<u32>,
}

struct Agent {
    #[allow(dead_code)]
    namespace: String,
    id: String,
    bundle_dir: std::path::PathBuf,
    processes: RwLock<HashMap<Option<String>, ProcessEntry>>,
    // Mirrors the pids already tracked in `processes`, but behind a plain
    // std Mutex so the signal handler thread (no async runtime of its own)
    // can read it without blocking on the tokio lock.
    live_pids: std::sync::Mutex<Vec<u32>>,
}

impl Agent {
    fn new(namespace: String, id: String) -> Self {
        Self {
            namespace,
            id,
            bundle_dir: std::env::current_dir().unwrap_or_default(),
            processes: RwLock::new(HashMap::new()),
            live_pids: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn track_pid(&self, pid: u32) {
        self.live_pids.lock().unwrap().push(pid);
    }

    fn untrack_pid(&self, pid: u32) {
        self.live_pids.lock().unwrap().retain(|p| *p != pid);
    }

    /// Sends `SIGTERM` to every process this agent has spawned. Run from the
    /// signal handler thread on `SIGTERM`/`SIGINT`, so it only touches the
    /// plain-mutex pid list rather than the async process registry.
    fn graceful_shutdown(&self) {
        let pids = self.live_pids.lock().unwrap().clone();
        log::info!("graceful shutdown: signaling {} process(es)", pids.len());
        for pid in pids {
            // SAFETY: `kill` with a pid this process itself spawned and a
            // plain termination signal.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                log::debug!("SIGTERM to pid {} failed: {}", pid, std::io::Error::last_os_error());
            }
        }
    }

    fn read_spec(&self) -> ContainerSpec {
        std::fs::read_to_string(self.bundle_dir.join("config.json"))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(ContainerSpec {
                process: ProcessSpec {
                    args: vec!["/bin/sh".to_string()],
                    env: Vec::new(),
                    cwd: default_cwd(),
                },
            })
    }

    async fn handle_create(&self, request: CreateTaskRequest) -> Result<CreateTaskResponse, String> {
        let spec = self.read_spec();
        let mut command = build_command(&spec.process);
        let child = command.spawn().map_err(|e| e.to_string())?;
        let pid = child.id().unwrap_or(0);
        self.track_pid(pid);
        self.processes.write().await.insert(
            None,
            ProcessEntry {
                child,
                pid,
                exit_status: None,
            },
        );
        let _ = request.id;
        Ok(CreateTaskResponse { pid })
    }

    async fn handle_start(&self, request: StartRequest) -> Result<StartResponse, String> {
        let processes = self.processes.read().await;
        let entry = processes
            .get(&request.exec_id)
            .ok_or_else(|| "no such process".to_string())?;
        Ok(StartResponse { pid: entry.pid })
    }

    async fn handle_exec(&self, request: ExecProcessRequest) -> Result<(), String> {
        let spec: ProcessSpec = serde_json::from_str(&request.spec).unwrap_or_default();
        let mut command = build_command(&spec);
        let child = command.spawn().map_err(|e| e.to_string())?;
        let pid = child.id().unwrap_or(0);
        self.track_pid(pid);
        self.processes.write().await.insert(
            Some(request.exec_id),
            ProcessEntry {
                child,
                pid,
                exit_status: None,
            },
        );
        Ok(())
    }

    async fn handle_kill(&self, request: KillRequest) -> Result<(), String> {
        let mut processes = self.processes.write().await;
        if request.all {
            for entry in processes.values_mut() {
                let _ = entry.child.start_kill();
            }
        } else if let Some(entry) = processes.get_mut(&request.exec_id) {
            let _ = entry.child.start_kill();
        } else {
            return Err("no such process".to_string());
        }
        Ok(())
    }

    async fn handle_wait(&self, request: WaitRequest) -> Result<WaitResponse, String> {
        // Take ownership of the Child out of the map to await it without
        // holding the registry lock across the wait.
        let mut owned = {
            let mut processes = self.processes.write().await;
            processes.remove(&request.exec_id)
        }
        .ok_or_else(|| "no such process".to_string())?;

        let status = owned.child.wait().await.map_err(|e| e.to_string())?;
        let exit_status = status.code().unwrap_or(-1) as u32;
        owned.exit_status = Some(exit_status);
        self.untrack_pid(owned.pid);
        self.processes
            .write()
            .await
            .insert(request.exec_id.clone(), owned);

        Ok(WaitResponse {
            exit_status,
            exited_at: now_seconds(),
        })
    }

    async fn handle_state(&self, request: StateRequest) -> Result<StateResponse, String> {
        let processes = self.processes.read().await;
        let entry = processes
            .get(&request.exec_id)
            .ok_or_else(|| "no such process".to_string())?;
        Ok(StateResponse {
            id: self.id.clone(),
            bundle: self.bundle_dir.display().to_string(),
            pid: entry.pid,
            status: if entry.exit_status.is_some() {
                Status::Stopped
            } else {
                Status::Running
            },
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            terminal: false,
            exit_status: entry.exit_status.unwrap_or(0),
            exited_at: 0,
        })
    }

    async fn handle_delete(&self, request: DeleteRequest) -> Result<DeleteResponse, String> {
        let mut processes = self.processes.write().await;
        let mut entry = processes
            .remove(&request.exec_id)
            .ok_or_else(|| "no such process".to_string())?;
        let exit_status = match entry.exit_status {
            Some(s) => s,
            None => {
                let _ = entry.child.start_kill();
                entry
                    .child
                    .wait()
                    .await
                    .ok()
                    .and_then(|s| s.code())
                    .unwrap_or(-1) as u32
            }
        };
        self.untrack_pid(entry.pid);
        Ok(DeleteResponse {
            pid: entry.pid,
            exit_status,
            exited_at: now_seconds(),
        })
    }

    async fn handle_pids(&self) -> Result<PidsResponse, String> {
        let processes = self.processes.read().await;
        Ok(PidsResponse {
            processes: processes
                .iter()
                .map(|(exec_id, entry)| ProcessInfo {
                    pid: entry.pid,
                    exec_id: exec_id.clone(),
                    info: None,
                })
                .collect(),
        })
    }

    /// This reference agent runs children without a pty of their own, so
    /// there is no terminal size to forward; the call just acknowledges.
    async fn handle_resize_pty(&self, _request: ResizePtyRequest) -> Result<(), String> {
        Ok(())
    }

    /// No stdio streams are wired up for this reference agent to close.
    async fn handle_close_io(&self, _request: CloseIoRequest) -> Result<(), String> {
        Ok(())
    }

    async fn handle_stats(&self, request: StatsRequest) -> Result<StatsResponse, String> {
        let processes = self.processes.read().await;
        let pids: Vec<u32> = processes.values().map(|e| e.pid).collect();
        let stats = serde_json::json!({ "id": request.id, "pids": pids });
        Ok(StatsResponse {
            stats: stats.to_string(),
        })
    }

    async fn handle_connect(&self) -> Result<ConnectResponse, String> {
        let task_pid = self
            .processes
            .read()
            .await
            .get(&None)
            .map(|e| e.pid)
            .unwrap_or(0);
        Ok(ConnectResponse {
            shim_pid: std::process::id(),
            task_pid,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn dispatch(&self, method: String, payload: Vec<u8>) -> Result<Vec<u8>, String> {
        match method.as_str() {
            method::CONNECT => encode(self.handle_connect().await?),
            method::CREATE => {
                encode(self.handle_create(decode(&payload)?).await?)
            }
            method::START => encode(self.handle_start(decode(&payload)?).await?),
            method::EXEC => {
                self.handle_exec(decode(&payload)?).await?;
                encode(())
            }
            method::KILL => {
                self.handle_kill(decode(&payload)?).await?;
                encode(())
            }
            method::WAIT => encode(self.handle_wait(decode(&payload)?).await?),
            method::STATE => encode(self.handle_state(decode(&payload)?).await?),
            method::DELETE => encode(self.handle_delete(decode(&payload)?).await?),
            method::PIDS => encode(self.handle_pids().await?),
            method::RESIZE_PTY => {
                self.handle_resize_pty(decode(&payload)?).await?;
                encode(())
            }
            method::CLOSE_IO => {
                self.handle_close_io(decode(&payload)?).await?;
                encode(())
            }
            method::STATS => encode(self.handle_stats(decode(&payload)?).await?),
            method::PAUSE | method::RESUME => encode(()),
            other => Err(format!("unsupported method: {}", other)),
        }
    }
}

fn build_command(spec: &ProcessSpec) -> Command {
    let args = if spec.args.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        spec.args.clone()
    };
    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for kv in &spec.env {
        if let Some((k, v)) = kv.split_once('=') {
            command.env(k, v);
        }
    }
    command
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode<T: Serialize>(value: T) -> Result<Vec<u8>, String> {
    bincode::serialize(&value).map_err(|e| e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, String> {
    bincode::deserialize(payload).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let config = parse_args();
    env_logger::Builder::from_default_env()
        .filter_level(if config.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match config.action {
        Action::Start => run_server(config).await,
        Action::Delete => run_delete(config).await,
    }
}

/// `SIGTERM`/`SIGINT` tear down whatever this agent spawned before exiting;
/// `SIGHUP` is just logged, since this reference agent keeps no on-disk
/// state to reload.
fn spawn_signal_thread(agent: Arc<Agent>) {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to register signal handlers: {}", e);
            return;
        }
    };
    std::thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGTERM => {
                    log::info!("received SIGTERM, shutting down");
                    agent.graceful_shutdown();
                    std::process::exit(0);
                }
                SIGINT => {
                    log::info!("received SIGINT, shutting down");
                    agent.graceful_shutdown();
                    std::process::exit(0);
                }
                SIGHUP => {
                    log::info!("received SIGHUP (no state to reload)");
                }
                _ => {}
            }
        }
    });
}

async fn run_server(config: AgentConfig) {
    log::info!(
        "taskshim-agent starting for {}/{} on {}",
        config.namespace,
        config.id,
        config.address
    );
    if let Some(parent) = std::path::Path::new(&config.address).parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let agent = Arc::new(Agent::new(config.namespace, config.id));
    let socket_path = std::path::PathBuf::from(&config.address);

    spawn_signal_thread(agent.clone());

    // Advertise the address on stdout, newline-terminated, the handshake
    // `taskshim-core::binary::spawn_shim` waits on.
    println!("{}", config.address);
    use std::io::Write;
    let _ = std::io::stdout().flush();

    let agent_for_serve = agent.clone();
    let result = taskshim_core::ipc::serve_unix(&socket_path, move |method, payload| {
        let agent = agent_for_serve.clone();
        async move {
            agent
                .dispatch(method, payload)
                .await
                .map_err(taskshim_core::Error::runtime)
        }
    })
    .await;

    if let Err(e) = result {
        log::error!("agent server exited: {}", e);
        std::process::exit(1);
    }
}

async fn run_delete(config: AgentConfig) {
    // The `delete` ABI passes `-bundle PATH` rather than `-address`; the
    // running instance's rendezvous address lives in that bundle's
    // `address` file. Fall back to `-address` if it was given directly.
    let address = if !config.bundle.is_empty() {
        std::fs::read_to_string(std::path::Path::new(&config.bundle).join("address"))
            .map(|s| s.trim().to_string())
            .unwrap_or(config.address)
    } else {
        config.address
    };

    // A standalone `delete` invocation against an agent that is no longer
    // running is a success: there is nothing left to tear down.
    let channel = taskshim_core::ipc::dial(&address, std::time::Duration::from_secs(2)).await;
    let Ok(channel) = channel else {
        return;
    };
    use taskshim_core::ipc::IpcChannel;
    let request = DeleteRequest {
        id: config.id.clone(),
        exec_id: None,
    };
    let payload = bincode::serialize(&request).unwrap_or_default();
    let _ = channel.call(method::DELETE, payload).await;
}
