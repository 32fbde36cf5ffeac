//! Bindings around `nmount(2)`/`unmount(2)`.

use std::convert::AsRef;
use std::ffi::CString;
use std::io::{Error as StdError, IoSlice};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{anyhow, Error};

#[fehler::throws]
pub fn mount<'a>(
    kind: &dyn AsRef<Path>,
    source: &dyn AsRef<Path>,
    destination: &dyn AsRef<Path>,
    options: impl Iterator<Item = &'a dyn AsRef<str>>,
) {
    let kind = as_cstring_bytes(kind)?;
    let source = as_cstring_bytes(source)?;
    let destination = as_cstring_bytes(destination)?;
    let options: Vec<_> = options
        .flat_map(|option| {
            let mut split = option.as_ref().split('=');
            let key = [split.next().unwrap_or("").as_bytes(), b"\0"].concat();
            let value = split
                .next()
                .map(|item| [item.as_bytes(), b"\0"].concat())
                .unwrap_or_default();

            vec![key, value]
        })
        .collect();

    let iovecs: Vec<_> = options
        .iter()
        .map(|x| IoSlice::new(x))
        .chain(vec![
            IoSlice::new(b"fstype\0"),
            IoSlice::new(kind.as_slice()),
            IoSlice::new(b"fspath\0"),
            IoSlice::new(destination.as_slice()),
            IoSlice::new(b"from\0"),
            IoSlice::new(source.as_slice()),
            IoSlice::new(b"errmsg\0"),
            IoSlice::new(&[0; 255]),
        ])
        .collect();

    let slice = iovecs.as_slice();

    if unsafe { do_nmount(slice) } < 0 {
        fehler::throw!(anyhow!("mount: nmount failed: {}", StdError::last_os_error()))
    };
}

/// `nmount(2)` is FreeBSD-only; elsewhere this reports `ENOSYS` without
/// touching the process.
#[cfg(target_os = "freebsd")]
unsafe fn do_nmount(iovecs: &[IoSlice]) -> i32 {
    libc::nmount(iovecs.as_ptr() as *mut _, iovecs.len() as u32, 0)
}

#[cfg(not(target_os = "freebsd"))]
unsafe fn do_nmount(_iovecs: &[IoSlice]) -> i32 {
    *libc::__errno_location() = libc::ENOSYS;
    -1
}

#[fehler::throws]
pub fn unmount(destination: &dyn AsRef<Path>) {
    let destination = as_cstring_bytes(destination)?;

    if unsafe { do_unmount(&destination) } < 0 {
        fehler::throw!(anyhow!(
            "mount: unmount failed: {}",
            StdError::last_os_error(),
        ))
    }
}

/// `unmount(2)` is FreeBSD-only; elsewhere this reports `ENOSYS` without
/// touching the process.
#[cfg(target_os = "freebsd")]
unsafe fn do_unmount(destination: &[u8]) -> i32 {
    libc::unmount(destination.as_ptr() as *const _, libc::MNT_FORCE)
}

#[cfg(not(target_os = "freebsd"))]
unsafe fn do_unmount(_destination: &[u8]) -> i32 {
    *libc::__errno_location() = libc::ENOSYS;
    -1
}

#[fehler::throws]
fn as_cstring_bytes(path: &dyn AsRef<Path>) -> Vec<u8> {
    let path: &Path = path.as_ref();
    CString::new(path.as_os_str().as_bytes())?.into_bytes_with_nul()
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    #[ignore = "requires a FreeBSD kernel and root"]
    fn test_mounting_nullfs() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        mount(&"nullfs", &source.path(), &dest.path(), std::iter::empty())
            .expect("failed to mount nullfs");

        let mount_output = Command::new("mount").output().expect("failed to run mount");
        let output_string = String::from_utf8(mount_output.stdout).unwrap();

        assert!(output_string.contains(&format!(
            "{} on {} (nullfs",
            source.path().display(),
            dest.path().display()
        )));

        unmount(&dest.path()).expect("failed to unmount nullfs");
    }
}
