//! Replicates `devfs(8)`'s rule subsystem to hide device nodes from a
//! jail's mounted `/dev`, then unhide the OCI default device set.

use std::convert::AsRef;
use std::fs::File;
use std::io::Error as StdError;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{anyhow, Error};
use libc::{c_char, c_int, gid_t, ioctl, mode_t, uid_t};

const MAGIC: u32 = 0xdb0a087a;
const DRA_BACTS: c_int = 0x1;
const DRB_HIDE: c_int = 0x1;
const DRB_UNHIDE: c_int = 0x2;
const DRC_PATHPTRN: c_int = 0x2;
const DEVFSIO_RAPPLY: u64 = 0x80ec4402;

/// Per the OCI Linux config spec's default device allowlist: there is no
/// FreeBSD spec for this, so the same list is followed as closely as
/// devfs node names allow.
pub const DEFAULT_DEVICES: [&str; 10] = [
    "null", "zero", "full", "random", "urandom", "tty", "console", "pts", "pts/*", "fd",
];

#[repr(C)]
struct DevfsRule {
    magic: u32,
    id: u32,
    icond: c_int,
    dswflags: c_int,
    pathptrn: [c_char; 200],
    iacts: c_int,
    bacts: c_int,
    uid: uid_t,
    gid: gid_t,
    mode: mode_t,
    incset: u32,
}

pub enum Operation<'a> {
    HideAll,
    Unhide(&'a str),
}

#[fehler::throws]
pub fn apply(path: impl AsRef<Path>, operation: Operation) {
    let file = File::open(path.as_ref())?;
    let mut rule: DevfsRule = unsafe { mem::zeroed() };
    rule.magic = MAGIC;
    rule.iacts = DRA_BACTS;

    match operation {
        Operation::HideAll => {
            rule.bacts = DRB_HIDE;
        }
        Operation::Unhide(node) => {
            rule.bacts = DRB_UNHIDE;
            rule.icond = DRC_PATHPTRN;
            for (slot, byte) in rule.pathptrn.iter_mut().zip(node.as_bytes()) {
                *slot = *byte as c_char;
            }
        }
    }

    if unsafe { ioctl(file.as_raw_fd(), DEVFSIO_RAPPLY, &rule) } < 0 {
        fehler::throw!(anyhow!(
            "devfs rule: ioctl(DEVFSIO_RAPPLY) failed: {}",
            StdError::last_os_error()
        ))
    };
}

/// Hides every devfs node, then unhides the OCI default device set.
#[fehler::throws]
pub fn prepare(path: impl AsRef<Path>) {
    apply(&path, Operation::HideAll)?;

    for device in &DEFAULT_DEVICES {
        apply(&path, Operation::Unhide(device))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmount::{mount, unmount};

    struct MountedDevfs<'a> {
        path: &'a Path,
    }

    impl<'a> MountedDevfs<'a> {
        fn new(path: &'a Path) -> Self {
            mount(&"devfs", &"devfs", &path, std::iter::empty())
                .expect("failed to mount devfs");
            Self { path }
        }
    }

    impl<'a> Drop for MountedDevfs<'a> {
        fn drop(&mut self) {
            unmount(&self.path).expect("failed to unmount devfs");
        }
    }

    #[test]
    #[ignore = "requires a FreeBSD kernel and root"]
    fn test_device_unhide() {
        let tmpdir = tempfile::tempdir().unwrap();
        let _devfs = MountedDevfs::new(tmpdir.path());

        assert!(tmpdir.path().join("null").exists());

        apply(tmpdir.path(), Operation::HideAll).expect("failed to hide all nodes");
        assert!(!tmpdir.path().join("null").exists());

        apply(tmpdir.path(), Operation::Unhide("null")).expect("failed to unhide /dev/null");
        assert!(tmpdir.path().join("null").exists());
    }
}
