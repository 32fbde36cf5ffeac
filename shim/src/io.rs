//! I/O endpoint handling for a managed process: opening the standard-I/O
//! FIFOs the container manager supplies, or — in terminal mode — creating
//! the temporary console socket the runtime sends a pty master fd over
//! and pumping bytes between it and the supplied FIFOs. The runtime, not
//! the shim, opens the pty itself; this module only relays bytes once the
//! master fd arrives over the socket.

use std::fs::{File, OpenOptions};
use std::io::copy;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Error};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;

/// The I/O endpoints requested by the container manager for one process,
/// before they're opened.
#[derive(Debug, Clone, Default)]
pub struct StdioPaths {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub terminal: bool,
}

impl StdioPaths {
    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

/// Opened endpoints, owned by a `ManagedProcess` and closed exactly once
/// (on `Drop`, which `ManagedProcess::close_io` triggers by dropping
/// this value).
#[derive(Debug)]
pub struct IoHandles {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    /// Kept alive so the console socket directory is removed once the
    /// process using it has exited.
    console_socket_dir: Option<tempfile::TempDir>,
}

impl IoHandles {
    /// Opens the FIFOs named in `paths`: stdin non-blocking read-only,
    /// stdout/stderr write-only, per 4.H.4. A FIFO is only opened if its
    /// path was actually supplied.
    #[fehler::throws]
    pub fn open_fifos(paths: &StdioPaths) -> Self {
        let stdin = match &paths.stdin {
            Some(path) => Some(
                OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(path)?,
            ),
            None => None,
        };
        let stdout = match &paths.stdout {
            Some(path) => Some(OpenOptions::new().write(true).open(path)?),
            None => None,
        };
        let stderr = match &paths.stderr {
            Some(path) => Some(OpenOptions::new().write(true).open(path)?),
            None => None,
        };

        Self {
            stdin,
            stdout,
            stderr,
            console_socket_dir: None,
        }
    }

    pub fn stdin_file(&self) -> Option<File> {
        self.stdin.as_ref().and_then(|f| f.try_clone().ok())
    }

    pub fn stdout_file(&self) -> Option<File> {
        self.stdout.as_ref().and_then(|f| f.try_clone().ok())
    }

    pub fn stderr_file(&self) -> Option<File> {
        self.stderr.as_ref().and_then(|f| f.try_clone().ok())
    }
}

/// Creates a temporary Unix-domain socket for the runtime to send a pty
/// master fd over, accepts exactly one connection, receives the fd, and
/// spawns pump threads copying to/from the supplied FIFOs until EOF.
/// Returns the path to hand to the runtime as `--console-socket` and the
/// `IoHandles` record to attach to the managed process (holding the
/// tempdir alive, not the FIFOs themselves, since the pty subsumes them).
#[fehler::throws]
pub fn setup_console(paths: &StdioPaths) -> (PathBuf, IoHandles) {
    let dir = tempfile::tempdir()?;
    let socket_path = dir.path().join("console.sock");
    let listener = UnixListener::bind(&socket_path)?;

    let stdin_path = paths.stdin.clone();
    let stdout_path = paths.stdout.clone();
    let socket_path_for_accept = socket_path.clone();

    thread::spawn(move || {
        let (stream, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!("console socket accept failed: {}", err);
                return;
            }
        };

        let master = match receive_fd(&stream) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::error!("failed to receive pty master: {}", err);
                return;
            }
        };

        pump_console(master, stdin_path, stdout_path);
        let _ = socket_path_for_accept;
    });

    (
        socket_path,
        IoHandles {
            stdin: None,
            stdout: None,
            stderr: None,
            console_socket_dir: Some(dir),
        },
    )
}

fn pump_console(master: RawFd, stdin_path: Option<PathBuf>, stdout_path: Option<PathBuf>) {
    if let Some(path) = stdin_path {
        let writer_fd = master;
        thread::spawn(move || {
            let mut input = match OpenOptions::new().read(true).open(&path) {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!("failed to open stdin fifo {:?}: {}", path, err);
                    return;
                }
            };
            let mut writer = unsafe { File::from_raw_fd(writer_fd) };
            if let Err(err) = copy(&mut input, &mut writer) {
                tracing::debug!("stdin pump for {:?} ended: {}", path, err);
            }
        });
    }

    if let Some(path) = stdout_path {
        let reader_fd = match nix::unistd::dup(master) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::error!("failed to dup pty master: {}", err);
                return;
            }
        };
        thread::spawn(move || {
            let mut output = match OpenOptions::new().write(true).open(&path) {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!("failed to open stdout fifo {:?}: {}", path, err);
                    return;
                }
            };
            let mut reader = unsafe { File::from_raw_fd(reader_fd) };
            if let Err(err) = copy(&mut reader, &mut output) {
                tracing::debug!("stdout pump for {:?} ended: {}", path, err);
            }
        });
    }
}

#[fehler::throws]
fn receive_fd(stream: &UnixStream) -> RawFd {
    use std::os::unix::io::AsRawFd;

    let mut buf = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut buf)];
    let mut cmsg_buf = nix::cmsg_space!(RawFd);

    let message = recvmsg(stream.as_raw_fd(), &iov, Some(&mut cmsg_buf), MsgFlags::empty())?;
    for cmsg in message.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.into_iter().next() {
                return fd;
            }
        }
    }

    fehler::throw!(anyhow!("console socket: no fd received"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_fifos_skips_unset_paths() {
        let handles = IoHandles::open_fifos(&StdioPaths::default()).unwrap();
        assert!(handles.stdin_file().is_none());
        assert!(handles.stdout_file().is_none());
        assert!(handles.stderr_file().is_none());
    }

    #[test]
    fn test_open_fifos_opens_existing_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let stdout_path = dir.path().join("stdout");
        unsafe {
            let c_path = std::ffi::CString::new(stdout_path.to_str().unwrap()).unwrap();
            assert_eq!(libc::mkfifo(c_path.as_ptr(), 0o600), 0);
        }

        let _reader_guard = thread::spawn({
            let path = stdout_path.clone();
            move || {
                let _ = OpenOptions::new().read(true).open(path);
            }
        });

        let paths = StdioPaths {
            stdout: Some(stdout_path),
            ..Default::default()
        };
        let mut handles = IoHandles::open_fifos(&paths).unwrap();
        handles.stdout.as_mut().unwrap().write_all(b"hi").unwrap();
    }
}
