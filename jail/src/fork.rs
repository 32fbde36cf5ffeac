//! Forked-process helpers.
//!
//! `run_in_fork` is the general-purpose helper (used by e.g. jail kill,
//! which has to `jail_attach` a throwaway process before signaling):
//! ordinary heap allocation and `anyhow::Error` handling are fine here,
//! since the child only ever proceeds to `abort()`/`exit()`, never to an
//! `exec` that depends on a consistent allocator/lock state.
//!
//! `create_nested` is the strict variant for the nested create-in-
//! parent-jail path: between `fork()` and `_exit`, only async-signal-safe
//! syscalls are permitted (no heap allocation, no logging, no locking),
//! because the parent may hold a lock or be mid allocation at the moment
//! of fork.

use std::ffi::CString;
use std::io::Write;
use std::mem::size_of;

use anyhow::{anyhow, Error};
use memmap::MmapMut;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use crate::param::{Param, Value};

/// Executes `f` in a forked child; waits for it in the parent and turns a
/// child-side `anyhow::Error` whose message is a `String` into an error in
/// the parent.
pub fn run_in_fork(f: impl FnOnce() -> Result<(), Error>) -> Result<(), Error> {
    let mut mmap = MmapMut::map_anon(1024)
        .map_err(|err| anyhow!("failed to create mmap: {}", err))?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            if let Err(err) = f() {
                let message = err.to_string();
                let _ = (&mut mmap[..]).write_all(message.as_bytes());
                std::process::abort();
            }
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None)?;

            match status {
                WaitStatus::Exited(_, 0) => Ok(()),
                WaitStatus::Signaled(_, Signal::SIGABRT, _) => {
                    let message = String::from_utf8_lossy(&mmap).into_owned();
                    anyhow::bail!(message)
                }
                status => anyhow::bail!("unexpected child status {:?}", status),
            }
        }
    }
}

/// What the signal-safe child reports back to the parent over the pipe:
/// either the jid of the newly created nested jail, or the errno from
/// whichever step failed.
#[repr(C)]
#[derive(Clone, Copy)]
struct PipeResult {
    jid: i32,
    errno: i32,
}

/// Marshals `params` into a raw iovec array, the same wire shape
/// `backend::SyscallBackend` builds, kept alive by the returned buffers.
/// Done entirely in the parent, before the fork: the signal-safe child
/// region below only ever reads from the already-built iovecs.
fn marshal(params: &[Param]) -> anyhow::Result<(Vec<Vec<u8>>, Vec<libc::iovec>)> {
    let mut buffers: Vec<Vec<u8>> = Vec::new();

    for param in params {
        buffers.push(CString::new(param.name.as_str())?.into_bytes_with_nul());
        buffers.push(match &param.value {
            Value::Int(value) => value.to_ne_bytes().to_vec(),
            Value::String(value) => CString::new(value.as_str())?.into_bytes_with_nul(),
            Value::Null | Value::Bool(_) => Vec::new(),
            Value::Ipv4List(addrs) => addrs
                .iter()
                .flat_map(|addr| u32::from(*addr).to_be_bytes())
                .collect(),
            Value::Buffer(bytes) => bytes.clone(),
        });
    }
    buffers.push(b"errmsg\0".to_vec());
    buffers.push(vec![0u8; 1024]);

    let iovecs = buffers
        .iter_mut()
        .map(|buffer| libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut _,
            iov_len: buffer.len(),
        })
        .collect();

    Ok((buffers, iovecs))
}

/// Signal-safe: `jail_attach(2)` the calling (already-forked) process into
/// `parent_jid`, then `jail_set(2)` with `JAIL_CREATE` from inside it.
/// `jail_attach`/`jail_set` are FreeBSD-only syscalls; elsewhere this
/// reports `ENOSYS` without touching the process.
#[cfg(target_os = "freebsd")]
unsafe fn attach_and_create(parent_jid: i32, iovecs: &mut [libc::iovec]) -> PipeResult {
    if libc::jail_attach(parent_jid) < 0 {
        return PipeResult { jid: -1, errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1) };
    }
    let jid = libc::jail_set(iovecs.as_mut_ptr(), iovecs.len() as u32, super::backend::JAIL_CREATE);
    if jid < 0 {
        PipeResult { jid: -1, errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1) }
    } else {
        PipeResult { jid, errno: 0 }
    }
}

#[cfg(not(target_os = "freebsd"))]
unsafe fn attach_and_create(_parent_jid: i32, _iovecs: &mut [libc::iovec]) -> PipeResult {
    PipeResult { jid: -1, errno: libc::ENOSYS }
}

/// Creates a jail nested inside `parent_jid`: forks, attaches the child
/// to the parent jail, then calls `jail_set(2)` with `JAIL_CREATE` from
/// inside it — the only way a new jail's restrictions compound with an
/// already-running parent's rather than the host's. The child reports
/// the resulting jid, or the errno of whichever step failed, back to the
/// parent over a pipe and exits; between `fork()` and `_exit()` only
/// reentrancy-safe syscalls run (no heap allocation, no logging, no
/// locking), since `params` is pre-marshaled above, in the parent.
pub fn create_nested(parent_jid: i32, params: &[Param]) -> anyhow::Result<i32> {
    let (_buffers, mut iovecs) = marshal(params)?;

    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        anyhow::bail!("create_nested: pipe(2) failed: {}", std::io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    match unsafe { fork() }? {
        ForkResult::Child => {
            unsafe { libc::close(read_fd) };

            let result = unsafe { attach_and_create(parent_jid, &mut iovecs) };

            unsafe {
                libc::write(write_fd, &result as *const _ as *const libc::c_void, size_of::<PipeResult>());
                libc::_exit(0);
            }
        }
        ForkResult::Parent { child } => {
            unsafe { libc::close(write_fd) };

            let mut result = PipeResult { jid: -1, errno: 0 };
            unsafe {
                libc::read(
                    read_fd,
                    &mut result as *mut _ as *mut libc::c_void,
                    size_of::<PipeResult>(),
                );
                libc::close(read_fd);
            }

            let status = waitpid(child, None)?;
            match status {
                WaitStatus::Exited(_, 0) if result.jid >= 0 => Ok(result.jid),
                WaitStatus::Exited(_, 0) => anyhow::bail!(
                    "create_nested: jail_attach/jail_set failed: {}",
                    std::io::Error::from_raw_os_error(result.errno)
                ),
                other => anyhow::bail!("create_nested: child exited unexpectedly: {:?}", other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_in_fork_happy_path() {
        run_in_fork(|| Ok(())).expect("forked closure should succeed");
    }

    #[test]
    fn test_run_in_fork_propagates_error_message() {
        let err = run_in_fork(|| anyhow::bail!("boom")).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
