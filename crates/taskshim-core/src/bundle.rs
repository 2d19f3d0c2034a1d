//! On-disk bundle layout: `<state>/<ns>/<id>/{config.json,rootfs/,work,
//! address,log,options.json,runtime}`.
//!
//! Creation and deletion are atomic from an observer's point of view:
//! partial states are confined to a dot-prefixed directory name that is
//! renamed into place (or away) in a single syscall.

use crate::error::{Error, Result};
use crate::types::validate_id;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const ADDRESS_FILE: &str = "address";
const LOG_FIFO: &str = "log";
const OPTIONS_FILE: &str = "options.json";
const RUNTIME_FILE: &str = "runtime";
const WORK_LINK: &str = "work";
const ROOTFS_DIR: &str = "rootfs";

/// Handle to a container's on-disk bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub namespace: String,
    pub id: String,
    /// Volatile state directory: `<state-root>/<namespace>/<id>`.
    pub path: PathBuf,
    /// Persistent work directory: `<work-root>/<namespace>/<id>`.
    pub work_path: PathBuf,
}

impl Bundle {
    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn rootfs_path(&self) -> PathBuf {
        self.path.join(ROOTFS_DIR)
    }

    pub fn address_path(&self) -> PathBuf {
        self.path.join(ADDRESS_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FIFO)
    }

    pub fn options_path(&self) -> PathBuf {
        self.path.join(OPTIONS_FILE)
    }

    pub fn runtime_path(&self) -> PathBuf {
        self.path.join(RUNTIME_FILE)
    }

    pub fn read_address(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.address_path())?
            .trim()
            .to_string())
    }

    pub fn write_address(&self, address: &str) -> Result<()> {
        std::fs::write(self.address_path(), address)?;
        Ok(())
    }

    pub fn read_runtime(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.runtime_path())?
            .trim()
            .to_string())
    }
}

/// Filesystem root the task manager stores bundles under.
#[derive(Clone)]
pub struct BundleStore {
    state_root: PathBuf,
    work_root: PathBuf,
}

impl BundleStore {
    pub fn new(state_root: impl Into<PathBuf>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            work_root: work_root.into(),
        }
    }

    fn state_dir(&self, namespace: &str, id: &str) -> PathBuf {
        self.state_root.join(namespace).join(id)
    }

    fn work_dir(&self, namespace: &str, id: &str) -> PathBuf {
        self.work_root.join(namespace).join(id)
    }

    /// Atomically create the bundle: write to a dot-prefixed sibling
    /// directory, write config.json/options.json/runtime, then rename into
    /// place. Any failure rolls back via the dot-prefixed directory removal.
    pub fn create(
        &self,
        namespace: &str,
        id: &str,
        runtime: &str,
        spec: &[u8],
        options: Option<&serde_json::Value>,
    ) -> Result<Bundle> {
        validate_id(id)?;
        let final_path = self.state_dir(namespace, id);
        if final_path.exists() {
            return Err(Error::already_exists(format!(
                "bundle {}/{}",
                namespace, id
            )));
        }
        let work_path = self.work_dir(namespace, id);
        let tmp_path = self.tmp_sibling(&final_path);

        let result = self.create_inner(&tmp_path, &work_path, runtime, spec, options);
        match result {
            Ok(()) => {
                std::fs::create_dir_all(work_path.parent().unwrap())?;
                std::fs::rename(&tmp_path, &final_path).map_err(|e| {
                    let _ = std::fs::remove_dir_all(&tmp_path);
                    Error::io_with_context(e, "renaming bundle into place")
                })?;
                Ok(Bundle {
                    namespace: namespace.to_string(),
                    id: id.to_string(),
                    path: final_path,
                    work_path,
                })
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&tmp_path);
                Err(e)
            }
        }
    }

    fn create_inner(
        &self,
        tmp_path: &Path,
        work_path: &Path,
        runtime: &str,
        spec: &[u8],
        options: Option<&serde_json::Value>,
    ) -> Result<()> {
        std::fs::create_dir_all(tmp_path)?;
        std::fs::create_dir_all(work_path)?;
        std::fs::write(tmp_path.join(CONFIG_FILE), spec)?;
        std::fs::write(tmp_path.join(RUNTIME_FILE), runtime)?;
        if let Some(opts) = options {
            std::fs::write(tmp_path.join(OPTIONS_FILE), serde_json::to_vec_pretty(opts)?)?;
        }
        #[cfg(unix)]
        {
            use nix::sys::stat::Mode;
            use nix::unistd::mkfifo;
            let fifo = tmp_path.join(LOG_FIFO);
            let _ = mkfifo(&fifo, Mode::from_bits_truncate(0o600));
        }
        self.relink_work(tmp_path, work_path)?;
        Ok(())
    }

    fn relink_work(&self, bundle_path: &Path, work_path: &Path) -> Result<()> {
        let link = bundle_path.join(WORK_LINK);
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(work_path, &link)?;
        }
        #[cfg(not(unix))]
        {
            let _ = link;
        }
        Ok(())
    }

    /// Re-creates the `work` symlink for a bundle whose target has been
    /// lost (e.g. a stale link surviving a parent restart), used during
    /// `Load` reconciliation.
    pub fn ensure_work_link(&self, bundle: &Bundle) -> Result<()> {
        let link = bundle.path.join(WORK_LINK);
        if link.symlink_metadata().is_ok() {
            return Ok(());
        }
        self.relink_work(&bundle.path, &bundle.work_path)
    }

    fn tmp_sibling(&self, path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| format!(".{}", n.to_string_lossy()))
            .unwrap_or_else(|| ".bundle-tmp".to_string());
        path.with_file_name(file_name)
    }

    /// Loads an already-existing bundle from disk (boot-time reconciliation).
    pub fn load(&self, namespace: &str, id: &str) -> Result<Bundle> {
        let path = self.state_dir(namespace, id);
        if !path.exists() {
            return Err(Error::not_found(format!("bundle {}/{}", namespace, id)));
        }
        Ok(Bundle {
            namespace: namespace.to_string(),
            id: id.to_string(),
            work_path: self.work_dir(namespace, id),
            path,
        })
    }

    /// Lists namespaces and ids under the state root, for boot reconciliation.
    pub fn list_all(&self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        if !self.state_root.exists() {
            return Ok(out);
        }
        for ns_entry in std::fs::read_dir(&self.state_root)? {
            let ns_entry = ns_entry?;
            if !ns_entry.file_type()?.is_dir() {
                continue;
            }
            let namespace = ns_entry.file_name().to_string_lossy().to_string();
            for id_entry in std::fs::read_dir(ns_entry.path())? {
                let id_entry = id_entry?;
                if !id_entry.file_type()?.is_dir() {
                    continue;
                }
                let name = id_entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                out.push((namespace.clone(), name));
            }
        }
        Ok(out)
    }

    /// Atomic bundle deletion: rename to a dot-prefixed name, then recursive
    /// remove. Falls through to removing the work dir even if the state
    /// dir's removal fails, wrapping both errors.
    pub fn delete(&self, bundle: &Bundle) -> Result<()> {
        let tmp = self.tmp_sibling(&bundle.path);
        let state_result = if bundle.path.exists() {
            std::fs::rename(&bundle.path, &tmp)
                .and_then(|_| std::fs::remove_dir_all(&tmp))
                .map_err(Error::from)
        } else {
            Ok(())
        };
        let work_result = std::fs::remove_dir_all(&bundle.work_path)
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(Error::from);

        match (state_result, work_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(e1), Err(e2)) => Err(Error::runtime(format!(
                "bundle delete failed: state dir: {}; work dir: {}",
                e1, e2
            ))),
        }
    }

    /// Removes working directories whose task did not load, given the set
    /// of ids that loaded successfully.
    pub fn purge_orphan_work_dirs(&self, namespace: &str, loaded_ids: &[String]) -> Result<()> {
        let ns_work = self.work_root.join(namespace);
        if !ns_work.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&ns_work)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !loaded_ids.iter().any(|id| id == &name) {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BundleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().join("state"), dir.path().join("work"));
        (dir, store)
    }

    #[test]
    fn create_then_delete_leaves_nothing_behind() {
        let (_dir, store) = store();
        let bundle = store
            .create("default", "c1", "io.containerd.runc.v2", b"{}", None)
            .unwrap();
        assert!(bundle.config_path().exists());
        assert!(bundle.path.join("work").exists() || bundle.path.join("work").symlink_metadata().is_ok());
        store.delete(&bundle).unwrap();
        assert!(!bundle.path.exists());
        assert!(!bundle.work_path.exists());
    }

    #[test]
    fn create_rejects_invalid_id() {
        let (_dir, store) = store();
        assert!(store.create("default", "-bad", "rt", b"{}", None).is_err());
    }

    #[test]
    fn create_rejects_duplicate() {
        let (_dir, store) = store();
        store.create("default", "dup", "rt", b"{}", None).unwrap();
        assert!(store.create("default", "dup", "rt", b"{}", None).is_err());
    }

    #[test]
    fn options_json_round_trips() {
        let (_dir, store) = store();
        let opts = serde_json::json!({"a": 1, "b": "two"});
        let bundle = store
            .create("default", "c2", "rt", b"{}", Some(&opts))
            .unwrap();
        let read_back: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(bundle.options_path()).unwrap())
                .unwrap();
        assert_eq!(read_back, opts);
    }

    #[test]
    fn delete_on_nonexistent_bundle_is_noop() {
        let (_dir, store) = store();
        let bundle = Bundle {
            namespace: "default".into(),
            id: "ghost".into(),
            path: store.state_dir("default", "ghost"),
            work_path: store.work_dir("default", "ghost"),
        };
        assert!(store.delete(&bundle).is_ok());
    }

    #[test]
    fn list_all_finds_created_bundles() {
        let (_dir, store) = store();
        store.create("ns1", "a", "rt", b"{}", None).unwrap();
        store.create("ns1", "b", "rt", b"{}", None).unwrap();
        let mut found = store.list_all().unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("ns1".to_string(), "a".to_string()),
                ("ns1".to_string(), "b".to_string())
            ]
        );
    }
}
