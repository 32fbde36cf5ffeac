//! Per-container state directory: `<state-root>/<id>/state.json`, plus
//! the config documents kept alongside it (see `config.rs`).

use std::collections::HashMap;
use std::convert::AsRef;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::error::RunjError;

const STATE_FILE: &str = "state.json";
pub const DEFAULT_STATE_ROOT: &str = "/var/lib/runj/jails";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
        }
    }
}

/// The state of a single container, persisted as JSON.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct State {
    pub id: String,
    pub jid: i32,
    pub status: Status,
    pub bundle: PathBuf,
    pub pid: i32,
}

/// The JSON shape returned by `runj state` / the shim's `State` RPC — a
/// subset of `State`, in the layout the OCI spec and hooks expect.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StateOutput {
    pub oci_version: String,
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl State {
    pub fn output(&self) -> StateOutput {
        StateOutput {
            oci_version: oci::OCI_VERSION.to_string(),
            id: self.id.clone(),
            status: self.status.as_str().to_string(),
            pid: if self.pid == 0 { None } else { Some(self.pid) },
            bundle: self.bundle.clone(),
            annotations: None,
        }
    }

    /// Attaches the OCI config's `annotations` map, if any, to this
    /// output. Called by the runtime once it has loaded the container's
    /// config alongside its state.
    pub fn output_with_annotations(&self, annotations: Option<HashMap<String, String>>) -> StateOutput {
        StateOutput {
            annotations: annotations.filter(|map| !map.is_empty()),
            ..self.output()
        }
    }
}

/// Manages the state directory tree rooted at `root` (normally
/// `/var/lib/runj/jails`, overridable via `RUNJ_STATE_DIR` for tests).
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("RUNJ_STATE_DIR").unwrap_or_else(|_| DEFAULT_STATE_ROOT.into());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.dir(id).join(STATE_FILE)
    }

    /// Creates the state directory and the initial `state.json`. Fails if
    /// a state file for `id` already exists, guarding against overwriting
    /// an in-flight container (the O_EXCL guard the original Go
    /// implementation relies on).
    #[fehler::throws(Error)]
    pub fn create(&self, state: &State) {
        fs::create_dir_all(self.dir(&state.id))?;

        let guard = OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode_or_default(0o600)
            .open(self.state_path(&state.id));

        match guard {
            Ok(mut file) => {
                let bytes = serde_json::to_vec(state)?;
                file.write_all(&bytes)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                fehler::throw!(RunjError::AlreadyExists(format!(
                    "container '{}' already exists",
                    state.id
                )));
            }
            Err(err) => fehler::throw!(RunjError::from(err)),
        }
    }

    #[fehler::throws(Error)]
    pub fn load(&self, id: &str) -> State {
        let path = self.state_path(id);
        let bytes = fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RunjError::NotFound(format!("container '{}' does not exist", id))
            } else {
                RunjError::from(err)
            }
        })?;

        serde_json::from_slice(&bytes).map_err(RunjError::from)?
    }

    /// Atomically overwrites `state.json`: write to a temp file in the
    /// same directory, then `rename(2)` over the original so a reader
    /// never observes a partial write.
    #[fehler::throws(Error)]
    pub fn save(&self, state: &State) {
        let dir = self.dir(&state.id);
        let mut tmp_path = dir.join(format!(".state.json.{}.tmp", std::process::id()));
        let bytes = serde_json::to_vec(state)?;

        loop {
            match OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp_path)
            {
                Ok(mut file) => {
                    file.write_all(&bytes)?;
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    tmp_path = dir.join(format!(
                        ".state.json.{}.{}.tmp",
                        std::process::id(),
                        fastrand_nonce()
                    ));
                }
                Err(err) => fehler::throw!(RunjError::from(err)),
            }
        }

        fs::rename(&tmp_path, self.state_path(&state.id))?;
    }

    /// Removes the container's entire state directory.
    #[fehler::throws(Error)]
    pub fn remove(&self, id: &str) {
        match fs::remove_dir_all(self.dir(id)) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => fehler::throw!(RunjError::from(err)),
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state_path(id).exists()
    }
}

fn fastrand_nonce() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}

/// `OpenOptionsExt::mode` is unix-only and pulled in via trait; named
/// helper so call sites don't need their own `use` for the extension
/// trait when the default (0o666 & !umask) isn't appropriate.
trait OpenOptionsModeExt {
    fn mode_or_default(&mut self, mode: u32) -> &mut Self;
}

impl OpenOptionsModeExt for OpenOptions {
    fn mode_or_default(&mut self, mode: u32) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(mode);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (StateStore::new(dir.path()), dir)
    }

    fn sample(id: &str) -> State {
        State {
            id: id.to_string(),
            jid: 0,
            status: Status::Creating,
            bundle: PathBuf::from("/bundle"),
            pid: 0,
        }
    }

    #[test]
    fn test_create_then_load_roundtrip() {
        let (store, _dir) = store();
        store.create(&sample("container1")).unwrap();

        let loaded = store.load("container1").unwrap();
        assert_eq!(loaded.status, Status::Creating);
    }

    #[test]
    fn test_create_twice_fails_with_already_exists() {
        let (store, _dir) = store();
        store.create(&sample("container1")).unwrap();

        let err = store.create(&sample("container1")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_load_missing_fails_with_not_found() {
        let (store, _dir) = store();
        let err = store.load("nope").unwrap_err();
        assert!(err.to_string().contains("not found") || err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_save_is_atomic_overwrite() {
        let (store, _dir) = store();
        let mut state = sample("container1");
        store.create(&state).unwrap();

        state.status = Status::Running;
        state.pid = 4242;
        store.save(&state).unwrap();

        let loaded = store.load("container1").unwrap();
        assert_eq!(loaded.status, Status::Running);
        assert_eq!(loaded.pid, 4242);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (store, _dir) = store();
        store.create(&sample("container1")).unwrap();

        store.remove("container1").unwrap();
        store.remove("container1").unwrap();
        assert!(!store.exists("container1"));
    }
}
