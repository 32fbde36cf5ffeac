//! `std::process::Command` extensions for spawning a process inside a
//! running jail.

use std::io::Error as IoError;
use std::os::unix::process::CommandExt as StdCommandExt;
use std::process::Command;

use libc::uid_t;

use crate::RunningJail;

/// Attaches the spawned process to a jail before `exec`.
pub trait Jailed {
    fn jail(&mut self, jail: &RunningJail) -> &mut Command;
}

impl Jailed for Command {
    fn jail(&mut self, jail: &RunningJail) -> &mut Command {
        let jid = jail.jid;

        unsafe {
            self.pre_exec(move || {
                #[cfg(target_os = "freebsd")]
                {
                    if libc::jail_attach(jid) < 0 {
                        return Err(IoError::last_os_error());
                    }
                }
                #[cfg(not(target_os = "freebsd"))]
                {
                    let _ = jid;
                    return Err(IoError::from_raw_os_error(libc::ENOSYS));
                }
                Ok(())
            })
        }
    }
}

/// `std::os::unix::process::CommandExt::uid` calls `setresuid(2)`, which
/// fails inside a jail that doesn't allow it; `setuid(2)` is the call
/// jailed processes are expected to use instead.
pub trait CommandExt {
    fn jailed_uid(&mut self, uid: u32) -> &mut Command;
    fn jailed_gid(&mut self, gid: u32) -> &mut Command;
}

impl CommandExt for Command {
    fn jailed_uid(&mut self, uid: u32) -> &mut Command {
        unsafe {
            self.pre_exec(move || {
                if libc::setuid(uid as uid_t) < 0 {
                    return Err(IoError::last_os_error());
                }
                Ok(())
            })
        }
    }

    fn jailed_gid(&mut self, gid: u32) -> &mut Command {
        StdCommandExt::gid(self, gid)
    }
}
