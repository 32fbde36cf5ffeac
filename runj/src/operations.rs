//! The runtime CLI verbs (`create`/`start`/`state`/`kill`/`delete`/
//! `exec`), composing the `jail`, `state`, `mount` and `fifo` crates for
//! a container's full lifecycle.

use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Error};
use jail::param::Mode;
use jail::{RunningJail, StoppedJail};
use oci::{Process, RuntimeConfig};
use state::{ConfigStore, State, StateOutput, StateStore, Status};

const ENTRYPOINT_BIN: &str = "runj-entrypoint";
const CONSOLE_SOCKET_ENV: &str = "__RUNJ_CONSOLE_SOCKET";
const CONSOLE_SOCKET_FD: i32 = 3;

pub enum KillTarget {
    Primary,
    All,
    Pid(i32),
}

/// Stdio redirections for the spawned entrypoint helper. A container
/// manager that owns the FIFO endpoints (see the shim's I/O endpoint
/// handling) passes them here; the bare CLI leaves these `None` and lets
/// the entrypoint inherit the runtime process's own stdio.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<std::fs::File>,
    pub stdout: Option<std::fs::File>,
    pub stderr: Option<std::fs::File>,
}

impl ProcessIo {
    fn apply(self, cmd: &mut Command) {
        if let Some(stdin) = self.stdin {
            cmd.stdin(stdin);
        }
        if let Some(stdout) = self.stdout {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = self.stderr {
            cmd.stderr(stderr);
        }
    }
}

pub struct Runtime {
    state: StateStore,
    config: ConfigStore,
}

impl Runtime {
    pub fn from_env() -> Self {
        let state = StateStore::from_env();
        let config = ConfigStore::new(state.root());
        Self { state, config }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state: StateStore::new(root.clone()),
            config: ConfigStore::new(root),
        }
    }

    #[fehler::throws]
    pub fn create(
        &self,
        id: &str,
        bundle: impl AsRef<Path>,
        console_socket: Option<&Path>,
        pid_file: Option<&Path>,
        io: ProcessIo,
    ) {
        let bundle = bundle.as_ref();

        self.state.create(&State {
            id: id.to_string(),
            jid: 0,
            status: Status::Creating,
            bundle: bundle.to_path_buf(),
            pid: 0,
        })?;

        if let Err(err) = self.try_create(id, bundle, console_socket, pid_file, io) {
            tracing::error!("create failed, rolling back: {}", err);
            let _ = self.state.remove(id);
            fehler::throw!(err);
        }
    }

    #[fehler::throws]
    fn try_create(
        &self,
        id: &str,
        bundle: &Path,
        console_socket: Option<&Path>,
        pid_file: Option<&Path>,
        io: ProcessIo,
    ) {
        let config = self.config.lock(id, bundle)?;
        let process = config
            .process
            .clone()
            .ok_or_else(|| anyhow!("runtime config: process field must be set"))?;

        validate_console_socket(&process, console_socket)?;

        let root = config
            .root
            .as_ref()
            .ok_or_else(|| anyhow!("runtime config: root field must be set"))?;
        let rootfs = if root.path.is_absolute() {
            root.path.clone()
        } else {
            bundle.join(&root.path)
        };

        self.config.write_jail_conf(id, &rootfs, &config)?;
        let jail = start_jail(id, &rootfs, &config)?;

        if let Err(err) = self.finish_create(id, bundle, &jail, &rootfs, &config, &process, console_socket, pid_file, io) {
            let _ = jail.remove();
            fehler::throw!(err);
        }
    }

    #[fehler::throws]
    #[allow(clippy::too_many_arguments)]
    fn finish_create(
        &self,
        id: &str,
        bundle: &Path,
        jail: &RunningJail,
        rootfs: &Path,
        config: &RuntimeConfig,
        process: &Process,
        console_socket: Option<&Path>,
        pid_file: Option<&Path>,
        io: ProcessIo,
    ) {
        let mounts = config.mounts.clone().unwrap_or_default();
        if let Err(err) = mount::mount_all(rootfs, &mounts) {
            fehler::throw!(err);
        }

        if let Err(err) = mount::limit::apply(id, config) {
            let _ = mount::unmount_all(rootfs, &mounts);
            fehler::throw!(err);
        }

        let fifo_path = match fifo::create(self.state.dir(id)) {
            Ok(path) => path,
            Err(err) => {
                let _ = mount::unmount_all(rootfs, &mounts);
                fehler::throw!(err);
            }
        };

        let pid = match spawn_entrypoint(id, &fifo_path, process, console_socket, io) {
            Ok(pid) => pid,
            Err(err) => {
                let _ = mount::unmount_all(rootfs, &mounts);
                fehler::throw!(err);
            }
        };

        if let Some(pid_file) = pid_file {
            std::fs::write(pid_file, pid.to_string())?;
        }

        self.state.save(&State {
            id: id.to_string(),
            jid: jail.jid,
            status: Status::Created,
            bundle: bundle.to_path_buf(),
            pid,
        })?;
    }

    #[fehler::throws]
    pub fn start(&self, id: &str) {
        let config = self.config.load(id)?;
        let mut state = self.state.load(id)?;

        let process = config
            .process
            .ok_or_else(|| anyhow!("runtime config: process field must be set"))?;
        if process.args.as_ref().map_or(true, |a| a.is_empty()) {
            bail!("runtime config: process.args must be non-empty");
        }

        if state.status == Status::Running && probe_running(id, state.pid) {
            bail!("cannot start an already running container");
        }

        fifo::await_open(self.state.dir(id), std::time::Duration::from_secs(30))?;

        state.status = Status::Running;
        self.state.save(&state)?;
    }

    #[fehler::throws]
    pub fn state(&self, id: &str) -> StateOutput {
        let mut state = self.state.load(id)?;

        if state.status == Status::Running && !probe_running(id, state.pid) {
            state.pid = 0;
            state.status = Status::Stopped;
            self.state.save(&state)?;
        }

        let annotations = self.config.load(id).ok().and_then(|config| config.annotations);
        state.output_with_annotations(annotations)
    }

    #[fehler::throws]
    pub fn kill(&self, id: &str, signal: i32, target: KillTarget) {
        let mut state = self.state.load(id)?;

        if state.status == Status::Running && !probe_running(id, state.pid) {
            state.status = Status::Stopped;
            state.pid = 0;
            self.state.save(&state)?;
        }

        if state.status != Status::Running {
            bail!("cannot signal a {} container", state.status.as_str());
        }

        let jail = RunningJail::from_name(id)?;

        match target {
            KillTarget::Primary => signal_pid(&jail, state.pid, signal)?,
            KillTarget::Pid(pid) => signal_pid(&jail, pid, signal)?,
            KillTarget::All => signal_all(&jail, signal)?,
        }
    }

    #[fehler::throws]
    pub fn delete(&self, id: &str) {
        let state = self.state.load(id)?;

        if state.status == Status::Running && probe_running(id, state.pid) {
            bail!("cannot delete a running container");
        }

        if state.pid != 0 {
            unsafe {
                libc::kill(state.pid, libc::SIGTERM);
            }
        }

        if let Ok(jail) = RunningJail::from_name(id) {
            let _ = jail.remove();
        }

        let mut first_error = None;
        if let Ok(config) = self.config.load(id) {
            let rootfs = config
                .root
                .as_ref()
                .map(|root| state.bundle.join(&root.path))
                .unwrap_or_else(|| state.bundle.clone());
            let mounts = config.mounts.clone().unwrap_or_default();

            if let Err(err) = mount::unmount_all(&rootfs, &mounts) {
                first_error.get_or_insert(err);
            }
            if let Err(err) = mount::limit::revert(id, &config) {
                first_error.get_or_insert(err);
            }

            if let Some(hooks) = &config.hooks {
                run_poststop_hooks(hooks, id, &state);
            }
        }

        self.state.remove(id)?;

        if let Some(err) = first_error {
            fehler::throw!(err);
        }
    }

    /// Replaces this process image with the entrypoint helper (the `-`
    /// sentinel skips the FIFO wait). Only returns on failure: success
    /// means the process image is gone.
    #[fehler::throws(Error)]
    pub fn exec(&self, id: &str, process: Process, console_socket: Option<&Path>, io: ProcessIo) {
        let state = self.state.load(id)?;
        if state.status != Status::Running {
            bail!("cannot exec in a {} container", state.status.as_str());
        }
        validate_console_socket(&process, console_socket)?;

        let argv = process
            .args
            .ok_or_else(|| anyhow!("exec: process.args is required"))?;
        if argv.is_empty() {
            bail!("exec: process.args must be non-empty");
        }

        let envs = process.env.unwrap_or_default();
        let mut cmd = Command::new(ENTRYPOINT_BIN);
        cmd.arg(id).arg(fifo::SKIP).args(&argv);
        cmd.env_clear();
        for pair in &envs {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }
        io.apply(&mut cmd);

        let _console_guard = attach_console_socket(&mut cmd, console_socket)?;

        let err = cmd.exec();
        fehler::throw!(anyhow!("failed to exec entrypoint: {}", err));
    }

    /// Spawns an auxiliary (exec) process non-interactively, returning its
    /// pid without blocking on it — used by the shim's `Start` (exec id)
    /// verb, which needs the pid immediately and waits for completion via
    /// its own managed-process record instead of an FIFO handshake.
    #[fehler::throws]
    pub fn spawn_aux(
        &self,
        id: &str,
        process: &Process,
        console_socket: Option<&Path>,
        io: ProcessIo,
    ) -> i32 {
        spawn_entrypoint(id, Path::new(fifo::SKIP), process, console_socket, io)?
    }
}

#[fehler::throws]
fn validate_console_socket(process: &Process, console_socket: Option<&Path>) {
    let terminal = process.terminal.unwrap_or(false);
    match (terminal, console_socket) {
        (true, None) => bail!("process.terminal is set but no console-socket was provided"),
        (false, Some(_)) => bail!("console-socket provided for a non-terminal process"),
        (true, Some(path)) if !path.exists() => {
            bail!("console-socket {:?} does not exist", path)
        }
        _ => {}
    }
}

#[fehler::throws]
fn start_jail(id: &str, rootfs: &Path, config: &RuntimeConfig) -> RunningJail {
    let mut builder = StoppedJail::new(rootfs).name(id);

    if let Some(hostname) = &config.hostname {
        builder = builder.hostname(hostname);
    }

    if let Some(network) = config.freebsd.as_ref().and_then(|f| f.network.as_ref()) {
        if let Some(ipv4) = &network.ipv4 {
            if let Some(mode) = &ipv4.mode {
                builder = builder.ip4(Mode::parse(mode)?);
            }
            if let Some(addrs) = &ipv4.addr {
                let parsed: Result<Vec<Ipv4Addr>, _> = addrs.iter().map(|a| a.parse()).collect();
                builder = builder.ip4_addrs(parsed.map_err(|_| anyhow!("invalid ip4.addr entry"))?);
            }
        }

        if let Some(vnet) = &network.vnet {
            if let Some(mode) = &vnet.mode {
                builder = builder.vnet(Mode::parse(mode)?);
            }
        }
    }

    let jail = builder.start()?;

    if let Some(vnet) = config
        .freebsd
        .as_ref()
        .and_then(|f| f.network.as_ref())
        .and_then(|n| n.vnet.as_ref())
    {
        if let Some(interfaces) = &vnet.interfaces {
            jail::vnet::move_interfaces(jail.jid, interfaces, jail::vnet::Direction::In)?;
        }
    }

    jail
}

#[fehler::throws]
fn spawn_entrypoint(
    id: &str,
    fifo_path: &Path,
    process: &Process,
    console_socket: Option<&Path>,
    io: ProcessIo,
) -> i32 {
    let argv = process
        .args
        .clone()
        .ok_or_else(|| anyhow!("runtime config: process.args is required"))?;
    if argv.is_empty() {
        bail!("runtime config: process.args must be non-empty");
    }

    let mut cmd = Command::new(ENTRYPOINT_BIN);
    cmd.arg(id).arg(fifo_path).args(&argv);
    cmd.env_clear();
    for pair in process.env.clone().unwrap_or_default() {
        if let Some((key, value)) = pair.split_once('=') {
            cmd.env(key, value);
        }
    }
    io.apply(&mut cmd);

    let _console_guard = attach_console_socket(&mut cmd, console_socket)?;

    let child = cmd.spawn()?;
    child.id() as i32
}

/// Connects to the console socket (if any) and arranges for its fd to
/// land at a fixed descriptor in the child, so the entrypoint can find
/// it without relying on inherited fd order.
/// The returned `UnixStream` must be kept alive until after `spawn()`.
#[fehler::throws]
fn attach_console_socket(cmd: &mut Command, console_socket: Option<&Path>) -> Option<UnixStream> {
    let socket = match console_socket {
        Some(path) => UnixStream::connect(path)?,
        None => return None,
    };

    let raw_fd = socket.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(raw_fd, CONSOLE_SOCKET_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.env(CONSOLE_SOCKET_ENV, CONSOLE_SOCKET_FD.to_string());

    Some(socket)
}

/// Probes whether `pid` is still alive via `kill(pid, 0)`.
fn probe_pid(pid: i32) -> bool {
    pid != 0 && unsafe { libc::kill(pid, 0) == 0 }
}

/// Probes whether the container is still running: the recorded pid may
/// have exited while a re-parented descendant is still alive inside the
/// jail, so `probe_pid` alone can report a false negative.
fn probe_running(id: &str, pid: i32) -> bool {
    probe_pid(pid) || jail::ps::is_running(id).unwrap_or(false)
}

#[fehler::throws]
fn signal_pid(jail: &RunningJail, pid: i32, signal: i32) {
    jail::fork::run_in_fork(|| {
        jail.attach()?;
        if unsafe { libc::kill(pid, signal) } < 0 {
            bail!("kill failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    })?
}

#[fehler::throws]
fn signal_all(jail: &RunningJail, signal: i32) {
    jail::fork::run_in_fork(|| {
        jail.attach()?;
        if unsafe { libc::kill(-1, signal) } < 0 {
            bail!("kill(-1, ..) failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    })?
}

fn run_poststop_hooks(hooks: &oci::Hooks, id: &str, state: &State) {
    let output = state.output();
    let payload = serde_json::to_vec(&output).unwrap_or_default();

    for hook in hooks.poststop.clone().unwrap_or_default() {
        let result = run_hook(&hook, &payload);
        if let Err(err) = result {
            tracing::error!("poststop hook {} for {} failed: {}", hook.path, id, err);
        }
    }
}

#[fehler::throws]
fn run_hook(hook: &oci::Hook, stdin_payload: &[u8]) {
    use std::io::Write;
    use std::process::Stdio;

    let mut cmd = Command::new(&hook.path);
    cmd.args(hook.args.clone().unwrap_or_default());
    cmd.envs(
        hook.env
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|pair| pair.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))),
    );
    cmd.stdin(Stdio::piped());

    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(stdin_payload)?;
    }

    // TODO: honor hook.timeout by racing child.wait() against a deadline.
    child.wait()?;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> (Runtime, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Runtime::with_root(dir.path()), dir)
    }

    fn process(terminal: Option<bool>) -> Process {
        Process {
            terminal,
            console_size: None,
            cwd: "/".to_string(),
            env: None,
            args: Some(vec!["/bin/sh".to_string()]),
            rlimits: None,
            user: oci::User {
                uid: 0,
                gid: 0,
                umask: None,
                additional_gids: None,
            },
        }
    }

    #[test]
    fn test_validate_console_socket_terminal_requires_socket() {
        let err = validate_console_socket(&process(Some(true)), None).unwrap_err();
        assert!(err.to_string().contains("no console-socket"));
    }

    #[test]
    fn test_validate_console_socket_rejects_socket_without_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("console.sock");
        std::fs::write(&socket_path, b"").unwrap();

        let err = validate_console_socket(&process(Some(false)), Some(&socket_path)).unwrap_err();
        assert!(err.to_string().contains("non-terminal"));
    }

    #[test]
    fn test_validate_console_socket_rejects_missing_path() {
        let err = validate_console_socket(&process(Some(true)), Some(Path::new("/nope/nope")))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_validate_console_socket_allows_no_terminal_no_socket() {
        validate_console_socket(&process(Some(false)), None).unwrap();
        validate_console_socket(&process(None), None).unwrap();
    }

    #[test]
    fn test_probe_pid_false_for_zero() {
        assert!(!probe_pid(0));
    }

    #[test]
    fn test_probe_pid_false_for_reaped_child() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        assert!(!probe_pid(pid));
    }

    #[test]
    fn test_probe_pid_true_for_self() {
        assert!(probe_pid(std::process::id() as i32));
    }

    fn dead_state(id: &str) -> State {
        State {
            id: id.to_string(),
            jid: 0,
            status: Status::Running,
            bundle: PathBuf::from("/bundle"),
            pid: reap_a_pid(),
        }
    }

    fn reap_a_pid() -> i32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_state_self_heals_dead_pid_to_stopped() {
        let (runtime, _dir) = runtime();
        runtime.state.create(&dead_state("c1")).unwrap();

        let output = runtime.state("c1").unwrap();
        assert_eq!(output.status, "stopped");
        assert_eq!(output.pid, None);

        let persisted = runtime.state.load("c1").unwrap();
        assert_eq!(persisted.status, Status::Stopped);
    }

    #[test]
    fn test_kill_self_heals_then_rejects_stopped_container() {
        let (runtime, _dir) = runtime();
        runtime.state.create(&dead_state("c1")).unwrap();

        let err = runtime.kill("c1", libc::SIGTERM, KillTarget::Primary).unwrap_err();
        assert!(err.to_string().contains("cannot signal a stopped container"));
    }

    #[test]
    fn test_delete_rejects_running_container_with_live_pid() {
        let (runtime, _dir) = runtime();
        let mut state = dead_state("c1");
        state.pid = std::process::id() as i32;
        runtime.state.create(&state).unwrap();

        let err = runtime.delete("c1").unwrap_err();
        assert!(err.to_string().contains("cannot delete a running container"));
    }
}
