//! Sub-reaper registration and exit demultiplexing: a `SIGCHLD` handler
//! writes a byte to a self-pipe, and a consumer thread drains it and
//! `waitpid`s, keeping all real work off the signal handler itself.

use std::os::unix::io::RawFd;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use std::time::SystemTime;

use anyhow::Error;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Bound on the exits channel: the signal handler only schedules a drain
/// (writes one byte to a self-pipe), so the channel itself is filled by
/// the consumer thread's `wait4` loop, not by the handler — this bound
/// exists to make backpressure visible rather than to protect the
/// signal-safety boundary.
const EXITS_CHANNEL_CAPACITY: usize = 256;

/// One kernel exit notification, demultiplexed to a managed process by
/// pid in `crate::service`.
#[derive(Debug, Clone, Copy)]
pub struct Exit {
    pub pid: i32,
    pub status: u32,
    pub at: SystemTime,
}

/// Registers this process as a sub-reaper (`PROC_REAP_ACQUIRE`) so that
/// orphaned jail descendants re-parent here instead of to init, then
/// installs a `SIGCHLD` handler writing to a self-pipe, and spawns the
/// consumer thread that turns pipe wakeups into a stream of `Exit`s.
///
/// Must run before any child is spawned, per the sub-reaper discipline —
/// an orphan that re-parents to init before this call is never reaped by
/// us, and its exit is lost.
#[fehler::throws]
pub fn install() -> Receiver<Exit> {
    acquire_reaper()?;

    let (read_fd, write_fd) = self_pipe()?;
    install_sigchld_handler(write_fd)?;

    let (tx, rx) = sync_channel(EXITS_CHANNEL_CAPACITY);
    thread::spawn(move || consume(read_fd, tx));

    rx
}

#[cfg(target_os = "freebsd")]
#[fehler::throws]
fn acquire_reaper() {
    if unsafe { libc::procctl(libc::P_PID, 0, libc::PROC_REAP_ACQUIRE as i32, std::ptr::null_mut()) } < 0 {
        fehler::throw!(anyhow::anyhow!(
            "reaper: PROC_REAP_ACQUIRE failed: {}",
            std::io::Error::last_os_error()
        ));
    }
}

#[cfg(not(target_os = "freebsd"))]
#[fehler::throws]
fn acquire_reaper() {
    tracing::debug!("reaper: PROC_REAP_ACQUIRE is a no-op on this platform");
}

static WRITE_FD: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

fn self_pipe() -> anyhow::Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        anyhow::bail!("reaper: pipe(2) failed: {}", std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

#[fehler::throws]
fn install_sigchld_handler(write_fd: RawFd) {
    use std::sync::atomic::Ordering;
    WRITE_FD.store(write_fd, Ordering::SeqCst);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigchld as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;

        if libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut()) < 0 {
            fehler::throw!(anyhow::anyhow!(
                "reaper: sigaction failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }
}

/// Async-signal-safe: writes one byte to the self-pipe. Never allocates,
/// locks, or logs — the consumer thread does all real work.
extern "C" fn handle_sigchld(_signum: libc::c_int) {
    use std::sync::atomic::Ordering;
    let fd = WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [0u8; 1];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const _, 1);
        }
    }
}

/// Drains the self-pipe, then `waitpid`s every reapable child
/// non-blockingly, publishing one `Exit` per reaped pid. Runs until the
/// read end of the pipe is closed (shim shutdown).
fn consume(read_fd: RawFd, tx: SyncSender<Exit>) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n <= 0 {
            break;
        }

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    publish(&tx, pid.as_raw(), code as u32);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    publish(&tx, pid.as_raw(), 128 + signal as u32);
                }
                Ok(_) => continue,
            }
        }
    }
}

fn publish(tx: &SyncSender<Exit>, pid: i32, status: u32) {
    let exit = Exit {
        pid,
        status,
        at: SystemTime::now(),
    };
    if tx.try_send(exit).is_err() {
        tracing::error!(pid, status, "exits channel full, dropping exit notification");
    }
}

/// Sends `signal` to every process in the jail; `jail_remove` is what
/// ultimately reclaims anything left behind.
#[fehler::throws]
pub fn kill_all(jail: &jail::RunningJail, signal: i32) {
    jail::fork::run_in_fork(|| {
        jail.attach()?;
        if unsafe { libc::killpg(0, signal) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                anyhow::bail!("killpg failed: {}", err);
            }
        }
        Ok(())
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_delivers_exit() {
        let (tx, rx) = sync_channel(4);
        publish(&tx, 42, 0);
        let exit = rx.recv().unwrap();
        assert_eq!(exit.pid, 42);
        assert_eq!(exit.status, 0);
    }

    #[test]
    fn test_publish_drops_when_full_instead_of_blocking() {
        let (tx, rx) = sync_channel(1);
        publish(&tx, 1, 0);
        publish(&tx, 2, 0); // channel full: logged and dropped, not blocked
        let exit = rx.recv().unwrap();
        assert_eq!(exit.pid, 1);
        assert!(rx.try_recv().is_err());
    }
}
