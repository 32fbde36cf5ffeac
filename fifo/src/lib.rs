//! The create/start synchronization fifo: `runj create` mkfifo(2)s this
//! file and starts the entrypoint helper, which opens it for writing and
//! blocks; `runj start` opens it for reading, unblocking the helper so
//! the jailed process actually execs.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Error};

pub const FILENAME: &str = "exec.fifo";

/// Sentinel path passed to the entrypoint helper when no fifo
/// synchronization is needed (secondary `exec` processes).
pub const SKIP: &str = "-";

pub fn path(state_dir: impl AsRef<Path>) -> PathBuf {
    state_dir.as_ref().join(FILENAME)
}

/// Creates the exec fifo. Fails if one already exists for this container.
#[fehler::throws]
pub fn create(state_dir: impl AsRef<Path>) -> PathBuf {
    let path = path(&state_dir);

    if path.exists() {
        fehler::throw!(anyhow!("fifo: exec fifo {} already exists", path.display()));
    }

    let c_path = std::ffi::CString::new(path.as_os_str().to_str().unwrap())?;
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o622) } < 0 {
        fehler::throw!(anyhow!(
            "fifo: mkfifo failed: {}",
            std::io::Error::last_os_error()
        ));
    }

    path
}

/// Blocks waiting for a reader to open the fifo, up to `timeout`. Treats
/// an empty read (the writer closed without writing) as an attempt to
/// start an already-running container, per the original semantics.
#[fehler::throws]
pub fn await_open(state_dir: impl AsRef<Path>, timeout: Duration) {
    let path = path(&state_dir);
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let result = open_for_read(&path).and_then(|mut file| {
            let outcome = read_result(&mut file);
            drop(file);
            if outcome.is_ok() {
                let _ = fs::remove_file(&path);
            }
            outcome
        });
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(mpsc::RecvTimeoutError::Timeout) => fehler::throw!(anyhow!("fifo: timed out")),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            fehler::throw!(anyhow!("fifo: wait thread panicked"))
        }
    }
}

#[fehler::throws]
fn open_for_read(path: &Path) -> File {
    OpenOptions::new().read(true).open(path)?
}

#[fehler::throws]
fn read_result(file: &mut File) {
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    if data.is_empty() {
        fehler::throw!(anyhow!("cannot start an already running container"));
    }
}

/// Opens the fifo for writing and signals the waiting reader, the way
/// the entrypoint helper unblocks `runj create` once `runj start` runs.
#[fehler::throws]
pub fn signal(fifo_path: impl AsRef<Path>) {
    let fifo_path = fifo_path.as_ref();
    let c_path = std::ffi::CString::new(fifo_path.as_os_str().to_str().unwrap())?;

    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        fehler::throw!(anyhow!(
            "fifo: failed to open fifo for writing: {}",
            std::io::Error::last_os_error()
        ));
    }

    let written = unsafe { libc::write(fd, b"0".as_ptr() as *const _, 1) };
    unsafe { libc::close(fd) };

    if written != 1 {
        fehler::throw!(anyhow!(
            "fifo: failed to write to fifo: {}",
            std::io::Error::last_os_error()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_signal_then_await() {
        let tmpdir = tempfile::tempdir().unwrap();
        let fifo_path = create(tmpdir.path()).expect("failed to create fifo");

        let writer = thread::spawn(move || {
            signal(&fifo_path).expect("failed to signal fifo");
        });

        await_open(tmpdir.path(), Duration::from_secs(5)).expect("await_open failed");
        writer.join().unwrap();
    }

    #[test]
    fn test_create_twice_fails() {
        let tmpdir = tempfile::tempdir().unwrap();
        create(tmpdir.path()).expect("first create should succeed");

        assert!(create(tmpdir.path()).is_err());
    }

    #[test]
    fn test_await_open_times_out_without_a_writer() {
        let tmpdir = tempfile::tempdir().unwrap();
        create(tmpdir.path()).expect("failed to create fifo");

        let result = await_open(tmpdir.path(), Duration::from_millis(50));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_write_rejected_as_already_running() {
        let tmpdir = tempfile::tempdir().unwrap();
        let fifo_path = create(tmpdir.path()).expect("failed to create fifo");

        let writer = thread::spawn(move || {
            let f = OpenOptions::new()
                .write(true)
                .custom_flags(0)
                .open(&fifo_path)
                .expect("failed to open fifo for writing");
            drop(f);
        });

        let result = await_open(tmpdir.path(), Duration::from_secs(5));
        writer.join().unwrap();

        assert!(result.is_err());
    }
}
