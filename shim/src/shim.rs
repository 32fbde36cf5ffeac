//! The per-container supervisor: owns the primary process and any
//! auxiliary (`exec`) processes, demultiplexes kernel exits to the right
//! one, and turns each lifecycle transition into a published event. Kept
//! free of generated-proto types so the RPC layer (`task_service.rs`)
//! stays a thin translation over this plain-Rust type.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;

use anyhow::{anyhow, bail, Error};
use mount::Mountable;
use oci::Process;
use runj::{KillTarget, ProcessIo, Runtime};

use crate::events::{Event, EventSink};
use crate::io::{self, StdioPaths};
use crate::managed_process::{ExitRecord, ManagedProcess, Status};
use crate::protocols::shim::Mount as WireMount;
use crate::reaper::{self, Exit};

/// A snapshot of one process's lifecycle, used by `TaskService::state`.
pub struct ProcessState {
    pub exec_id: String,
    pub pid: u32,
    pub status: String,
    pub bundle: PathBuf,
    pub stdio: StdioPaths,
    pub exit: Option<ExitRecord>,
}

pub(crate) fn optional_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

/// One managed container. Indexed by pid (not just exec id) so the exit
/// demultiplexer can resolve a `reaper::Exit` in O(1) without scanning
/// every auxiliary.
pub struct Shim {
    id: String,
    runtime: Runtime,
    bundle: Mutex<Option<PathBuf>>,
    rootfs_mounts: Mutex<Vec<WireMount>>,
    primary: Arc<ManagedProcess>,
    auxiliaries: Mutex<HashMap<String, Arc<ManagedProcess>>>,
    pid_index: Mutex<HashMap<i32, (String, Arc<ManagedProcess>)>>,
    events: EventSink,
    /// Guards the ordering of `TaskStart`/`TaskExit` publishes: a `Start`
    /// in flight must publish before the corresponding exit can, even
    /// though the exit is observed on a different thread.
    send_lock: Mutex<()>,
}

impl Shim {
    #[fehler::throws]
    pub fn new(id: &str, runtime: Runtime, events: EventSink) -> Arc<Self> {
        let exits = reaper::install()?;

        let shim = Arc::new(Self {
            id: id.to_string(),
            runtime,
            bundle: Mutex::new(None),
            rootfs_mounts: Mutex::new(Vec::new()),
            primary: ManagedProcess::new(Status::Creating),
            auxiliaries: Mutex::new(HashMap::new()),
            pid_index: Mutex::new(HashMap::new()),
            events,
            send_lock: Mutex::new(()),
        });

        let demultiplexer = shim.clone();
        thread::spawn(move || demultiplexer.demultiplex(exits));

        shim
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn demultiplex(&self, exits: std::sync::mpsc::Receiver<Exit>) {
        while let Ok(exit) = exits.recv() {
            self.handle_exit(exit);
        }
    }

    fn handle_exit(&self, exit: Exit) {
        let entry = self.pid_index.lock().unwrap().get(&exit.pid).cloned();
        let (exec_id, process) = match entry {
            Some(found) => found,
            None => return,
        };

        if exec_id.is_empty() {
            if let Ok(jail) = jail::RunningJail::from_name(&self.id) {
                if let Err(err) = reaper::kill_all(&jail, libc::SIGKILL) {
                    tracing::error!("kill_all after primary exit failed: {}", err);
                }
            }
        }

        process.mark_exited(exit.status, exit.at);

        {
            let _guard = self.send_lock.lock().unwrap();
            self.events.send(Event::TaskExit {
                id: self.id.clone(),
                exec_id,
                pid: exit.pid as u32,
                exit_status: exit.status,
                exited_at: exit.at,
            });
        }

        process.close_io();
    }

    #[fehler::throws]
    pub fn create(
        &self,
        id: &str,
        bundle: impl Into<PathBuf>,
        rootfs: &[WireMount],
        stdio: StdioPaths,
    ) -> u32 {
        if id != self.id {
            bail!("shim is bound to container '{}', got '{}'", self.id, id);
        }

        let bundle = bundle.into();
        {
            let mut guard = self.bundle.lock().unwrap();
            if guard.is_some() {
                bail!("container '{}' already created", self.id);
            }
            *guard = Some(bundle.clone());
        }

        let rootfs_path = bundle.join("rootfs");
        if let Err(err) = mount_rootfs(&rootfs_path, rootfs) {
            *self.bundle.lock().unwrap() = None;
            fehler::throw!(err);
        }
        *self.rootfs_mounts.lock().unwrap() = rootfs.to_vec();

        let (console_socket, handles) = if stdio.terminal {
            let (path, handles) = io::setup_console(&stdio)?;
            (Some(path), handles)
        } else {
            (None, io::IoHandles::open_fifos(&stdio)?)
        };

        let process_io = ProcessIo {
            stdin: handles.stdin_file(),
            stdout: handles.stdout_file(),
            stderr: handles.stderr_file(),
        };

        self.runtime
            .create(&self.id, &bundle, console_socket.as_deref(), None, process_io)?;

        let output = self.runtime.state(&self.id)?;
        let pid = output
            .pid
            .ok_or_else(|| anyhow!("runtime reported no pid after create"))?;

        self.primary.set_pid(pid)?;
        self.primary.set_status(Status::Created);
        self.primary.set_io(handles);
        self.pid_index
            .lock()
            .unwrap()
            .insert(pid, (String::new(), self.primary.clone()));

        self.events.send(Event::TaskCreate {
            id: self.id.clone(),
            pid: pid as u32,
        });

        pid as u32
    }

    #[fehler::throws]
    pub fn start_primary(&self) -> u32 {
        if self.primary.status() != Status::Created {
            bail!("cannot start container in '{}' state", self.primary.status().as_str());
        }

        let _guard = self.send_lock.lock().unwrap();
        self.runtime.start(&self.id)?;
        self.primary.set_status(Status::Running);

        let pid = self.primary.pid();
        self.events.send(Event::TaskStart {
            id: self.id.clone(),
            exec_id: String::new(),
            pid: pid as u32,
        });

        pid as u32
    }

    #[fehler::throws]
    pub fn exec(&self, exec_id: &str, stdio: StdioPaths, spec: &[u8]) {
        if exec_id.is_empty() {
            bail!("exec: exec_id must be non-empty");
        }

        let bundle = self
            .bundle
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("exec: container has not been created"))?;

        let process: Process = serde_json::from_slice(spec)
            .map_err(|err| anyhow!("exec: invalid process spec: {}", err))?;

        let specs_dir = bundle.join("execs");
        fs::create_dir_all(&specs_dir)?;
        let spec_path = specs_dir.join(format!("{}.json", exec_id));
        fs::write(&spec_path, serde_json::to_vec(&process)?)?;

        let managed = ManagedProcess::with_spec_path(Status::Created, spec_path);
        managed.set_pending_stdio(stdio);

        {
            let mut auxiliaries = self.auxiliaries.lock().unwrap();
            if auxiliaries.contains_key(exec_id) {
                bail!("exec id '{}' already exists", exec_id);
            }
            auxiliaries.insert(exec_id.to_string(), managed);
        }

        self.events.send(Event::TaskExecAdded {
            id: self.id.clone(),
            exec_id: exec_id.to_string(),
        });
    }

    #[fehler::throws]
    pub fn start_exec(&self, exec_id: &str) -> u32 {
        let aux = self.lookup_aux(exec_id)?;
        if aux.status() != Status::Created {
            bail!(
                "cannot start exec '{}' in '{}' state",
                exec_id,
                aux.status().as_str()
            );
        }

        let stdio = aux
            .take_pending_stdio()
            .ok_or_else(|| anyhow!("exec '{}' has no recorded I/O configuration", exec_id))?;

        let spec_path = aux
            .spec_path
            .clone()
            .ok_or_else(|| anyhow!("exec '{}' has no recorded process spec", exec_id))?;
        let process: Process = serde_json::from_slice(&fs::read(&spec_path)?)?;

        let (console_socket, handles) = if stdio.terminal {
            let (path, handles) = io::setup_console(&stdio)?;
            (Some(path), handles)
        } else {
            (None, io::IoHandles::open_fifos(&stdio)?)
        };

        let process_io = ProcessIo {
            stdin: handles.stdin_file(),
            stdout: handles.stdout_file(),
            stderr: handles.stderr_file(),
        };

        let pid = self
            .runtime
            .spawn_aux(&self.id, &process, console_socket.as_deref(), process_io)?;

        aux.set_pid(pid)?;
        aux.set_status(Status::Running);
        aux.set_io(handles);
        self.pid_index
            .lock()
            .unwrap()
            .insert(pid, (exec_id.to_string(), aux.clone()));

        let _guard = self.send_lock.lock().unwrap();
        self.events.send(Event::TaskStart {
            id: self.id.clone(),
            exec_id: exec_id.to_string(),
            pid: pid as u32,
        });

        pid as u32
    }

    #[fehler::throws]
    pub fn kill(&self, exec_id: &str, signal: i32, all: bool) {
        if exec_id.is_empty() {
            let target = if all { KillTarget::All } else { KillTarget::Primary };
            self.runtime.kill(&self.id, signal, target)?;
        } else {
            let aux = self.lookup_aux(exec_id)?;
            if aux.status() != Status::Running {
                bail!("cannot signal exec '{}' in '{}' state", exec_id, aux.status().as_str());
            }
            self.runtime.kill(&self.id, signal, KillTarget::Pid(aux.pid()))?;
        }
    }

    #[fehler::throws]
    pub fn state(&self, exec_id: &str) -> ProcessState {
        if exec_id.is_empty() {
            let bundle = self
                .bundle
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow!("state: container has not been created"))?;
            let output = self.runtime.state(&self.id)?;

            ProcessState {
                exec_id: String::new(),
                pid: self.primary.pid() as u32,
                status: output.status,
                bundle,
                stdio: StdioPaths::default(),
                exit: self.primary.exit_record(),
            }
        } else {
            let aux = self.lookup_aux(exec_id)?;
            let bundle = self.bundle.lock().unwrap().clone().unwrap_or_default();

            ProcessState {
                exec_id: exec_id.to_string(),
                pid: aux.pid() as u32,
                status: aux.status().as_str().to_string(),
                bundle,
                stdio: StdioPaths::default(),
                exit: aux.exit_record(),
            }
        }
    }

    #[fehler::throws]
    pub fn resize_pty(&self, exec_id: &str, _width: u32, _height: u32) {
        if !exec_id.is_empty() {
            bail!("resize_pty: unsupported for auxiliary processes");
        }
        bail!("resize_pty: unsupported (console master fd is owned by the I/O pump, not exposed for ioctl)");
    }

    #[fehler::throws]
    pub fn wait(&self, exec_id: &str) -> ExitRecord {
        if exec_id.is_empty() {
            self.primary.wait()
        } else {
            self.lookup_aux(exec_id)?.wait()
        }
    }

    #[fehler::throws]
    pub fn delete(&self, exec_id: &str) -> (u32, ExitRecord) {
        if exec_id.is_empty() {
            if self.primary.status() == Status::Running {
                bail!("cannot delete a running container");
            }

            if let Ok(jail) = jail::RunningJail::from_name(&self.id) {
                if let Err(err) = reaper::kill_all(&jail, libc::SIGKILL) {
                    tracing::error!("kill-all before delete for {} failed: {}", self.id, err);
                }
            }

            self.runtime.delete(&self.id)?;

            let rootfs = self
                .bundle
                .lock()
                .unwrap()
                .as_ref()
                .map(|bundle| bundle.join("rootfs"));
            if let Some(rootfs) = rootfs {
                let mounts = self.rootfs_mounts.lock().unwrap().clone();
                if let Err(err) = unmount_rootfs(&rootfs, &mounts) {
                    tracing::error!("failed to unmount rootfs for {}: {}", self.id, err);
                }
            }

            let pid = self.primary.pid() as u32;
            let exit = self.primary.exit_record().unwrap_or(ExitRecord {
                exit_status: 128 + libc::SIGKILL as u32,
                exited_at: now(),
            });

            self.events.send(Event::TaskDelete { id: self.id.clone() });

            (pid, exit)
        } else {
            let aux = self.lookup_aux(exec_id)?;
            if aux.status() == Status::Running {
                bail!("cannot delete a running exec process");
            }
            if aux.status() == Status::Created {
                aux.mark_exited(0, now());
            }

            if let Some(spec_path) = &aux.spec_path {
                let _ = fs::remove_file(spec_path);
            }

            self.auxiliaries.lock().unwrap().remove(exec_id);

            let pid = aux.pid() as u32;
            let exit = aux.exit_record().unwrap_or(ExitRecord {
                exit_status: 0,
                exited_at: now(),
            });
            (pid, exit)
        }
    }

    /// A standalone `Delete` issued without the usual `Create`/`Start`
    /// lifecycle preceding it, used to reclaim state left behind by a
    /// shim that crashed before it could run its own `Delete`.
    #[fehler::throws]
    pub fn cleanup(&self) {
        if let Err(err) = self.runtime.delete(&self.id) {
            tracing::debug!("cleanup: runtime delete for {} failed: {}", self.id, err);
        }

        let rootfs = self
            .bundle
            .lock()
            .unwrap()
            .as_ref()
            .map(|bundle| bundle.join("rootfs"));
        if let Some(rootfs) = rootfs {
            let mounts = self.rootfs_mounts.lock().unwrap().clone();
            let _ = unmount_rootfs(&rootfs, &mounts);
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("shim for {} shutting down", self.id);
    }

    fn lookup_aux(&self, exec_id: &str) -> anyhow::Result<Arc<ManagedProcess>> {
        self.auxiliaries
            .lock()
            .unwrap()
            .get(exec_id)
            .cloned()
            .ok_or_else(|| anyhow!("exec id '{}' not found", exec_id))
    }
}

fn now() -> SystemTime {
    SystemTime::now()
}

#[fehler::throws]
fn mount_rootfs(rootfs: &std::path::Path, mounts: &[WireMount]) {
    for (index, entry) in mounts.iter().enumerate() {
        if let Err(err) = entry.mount(rootfs) {
            for already_mounted in mounts[..index].iter().rev() {
                if let Err(unwind_err) = already_mounted.unmount(rootfs) {
                    tracing::error!("failed to unwind rootfs mount: {}", unwind_err);
                }
            }
            fehler::throw!(err);
        }
    }
}

fn unmount_rootfs(rootfs: &std::path::Path, mounts: &[WireMount]) -> anyhow::Result<()> {
    let mut first_error = None;
    for entry in mounts.iter().rev() {
        if let Err(err) = entry.unmount(rootfs) {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_path_empty_is_none() {
        assert!(optional_path("").is_none());
        assert_eq!(optional_path("/tmp/x"), Some(PathBuf::from("/tmp/x")));
    }
}
