pub mod devfs;
pub mod limit;
pub mod nmount;

use std::convert::AsRef;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use anyhow::Error;
use oci::Mount;

/// Substituted for an empty OCI `source` field: the kernel mount
/// interface requires a non-empty source string even for filesystems
/// that otherwise ignore it (e.g. `tmpfs`, `devfs`).
const SOURCE_PLACEHOLDER: &str = "null";

/// Mounts (and on failure, unwinds already-applied mounts for) a single
/// entry from an OCI config's `mounts` array.
pub trait Mountable {
    #[fehler::throws]
    fn mount(&self, rootfs: impl AsRef<Path>) {
        let kind = self.kind();
        let source = resolve_source(self.source());
        let destination = prefixed_destination(&rootfs, self.destination());

        tracing::info!(kind = ?kind.as_ref(), ?source, ?destination, "mounting");

        if is_file_bind(kind, &source) {
            bind_file(&rootfs, &source, &destination, self.destination())?;
        } else {
            if let Some(parent) = destination.parent() {
                create_dir_all_0755(parent)?;
            }
            create_dir_all_0755(&destination)?;

            nmount::mount(
                kind,
                &source,
                &destination,
                self.options().iter().map(|x| x as &dyn AsRef<str>),
            )?;
        }

        self.post_mount_hooks(rootfs)?;
    }

    #[fehler::throws]
    fn unmount(&self, rootfs: impl AsRef<Path>) {
        let source = resolve_source(self.source());
        let destination = prefixed_destination(&rootfs, self.destination());

        if is_file_bind(self.kind(), &source) {
            unbind_file(&rootfs, &destination, self.destination())?;
        } else {
            nmount::unmount(&destination)?;
        }
    }

    #[fehler::throws]
    fn post_mount_hooks(&self, rootfs: impl AsRef<Path>);

    fn kind(&self) -> &dyn AsRef<Path>;
    fn source(&self) -> &dyn AsRef<Path>;
    fn destination(&self) -> &str;
    fn options(&self) -> Vec<String>;
}

impl Mountable for Mount {
    fn kind(&self) -> &dyn AsRef<Path> {
        self.r#type.as_ref().map(|x| x as &dyn AsRef<Path>).unwrap_or(&"nullfs")
    }

    fn source(&self) -> &dyn AsRef<Path> {
        self.source.as_ref().map(|x| x as &dyn AsRef<Path>).unwrap_or(&"")
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    fn options(&self) -> Vec<String> {
        self.options.clone().unwrap_or_default()
    }

    #[fehler::throws]
    fn post_mount_hooks(&self, rootfs: impl AsRef<Path>) {
        if self.r#type.as_deref() == Some("devfs") {
            devfs::prepare(prefixed_destination(rootfs, self.destination()))?;
        }
    }
}

/// Mount destinations in an OCI config are specified relative to the
/// container's rootfs; prefix with the rootfs and strip any `..`/`.`/`/`
/// path components a hostile config might try to escape with.
pub fn prefixed_destination(rootfs: impl AsRef<Path>, destination: impl AsRef<Path>) -> PathBuf {
    let mut result = rootfs.as_ref().to_owned();

    for component in destination.as_ref().components() {
        if let Component::Normal(component) = component {
            result.push(component);
        }
    }

    result
}

fn resolve_source(source: &dyn AsRef<Path>) -> PathBuf {
    let source = source.as_ref();
    if source.as_os_str().is_empty() {
        PathBuf::from(SOURCE_PLACEHOLDER)
    } else {
        source.to_owned()
    }
}

/// A mount counts as a single-file bind when it uses the default
/// (nullfs) kind and its source names a regular file rather than a
/// directory: `nmount(2)`'s nullfs can bind a file onto a file, but this
/// runtime approximates it instead with a save-and-copy so the original
/// can be restored byte-for-byte on unmount.
fn is_file_bind(kind: &dyn AsRef<Path>, source: &Path) -> bool {
    kind.as_ref() == Path::new("nullfs") && source.is_file()
}

fn create_dir_all_0755(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        fs::DirBuilder::new().recursive(true).mode(0o755).create(path)?;
    }
    Ok(())
}

/// The hidden directory, outside the rootfs, that holds the original
/// contents of destination files clobbered by a file-bind mount.
fn save_dir(rootfs: &Path) -> PathBuf {
    rootfs.parent().unwrap_or(rootfs).join(".runj-mount-saves")
}

fn save_path(rootfs: &Path, destination: &str) -> PathBuf {
    save_dir(rootfs).join(destination.trim_start_matches('/').replace('/', "__"))
}

#[fehler::throws]
fn bind_file(rootfs: impl AsRef<Path>, source: &Path, destination: &Path, raw_destination: &str) {
    let rootfs = rootfs.as_ref();

    if let Some(parent) = destination.parent() {
        create_dir_all_0755(parent)?;
    }

    if destination.is_file() {
        create_dir_all_0755(&save_dir(rootfs))?;
        fs::copy(destination, save_path(rootfs, raw_destination))?;
    }

    fs::copy(source, destination)?;
}

#[fehler::throws]
fn unbind_file(rootfs: impl AsRef<Path>, destination: &Path, raw_destination: &str) {
    let rootfs = rootfs.as_ref();
    let saved = save_path(rootfs, raw_destination);

    fs::remove_file(destination)?;

    if saved.exists() {
        fs::rename(&saved, destination)?;
    }
}

/// Mounts every entry in `mounts`, unwinding (unmounting in reverse
/// order) anything already mounted if one of them fails.
#[fehler::throws]
pub fn mount_all(rootfs: impl AsRef<Path>, mounts: &[Mount]) {
    for (index, mountpoint) in mounts.iter().enumerate() {
        if let Err(err) = mountpoint.mount(&rootfs) {
            for already_mounted in mounts[..index].iter().rev() {
                if let Err(unwind_err) = already_mounted.unmount(&rootfs) {
                    tracing::error!("failed to unwind mount: {}", unwind_err);
                }
            }
            fehler::throw!(err);
        }
    }
}

/// Unmounts every entry in `mounts`, in reverse order, continuing past
/// individual failures and reporting the first one encountered.
pub fn unmount_all(rootfs: impl AsRef<Path>, mounts: &[Mount]) -> Result<(), Error> {
    let mut first_error = None;

    for mountpoint in mounts.iter().rev() {
        if let Err(err) = mountpoint.unmount(&rootfs) {
            tracing::error!("failed to unmount: {}", err);
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
    fn test_prefixed_destination_strips_traversal() {
        let rootfs = Path::new("/var/jails/c1/rootfs");
        let result = prefixed_destination(rootfs, "../../etc/passwd");

        assert_eq!(result, rootfs.join("etc").join("passwd"));
    }

    #[test]
    fn test_prefixed_destination_plain_path() {
        let rootfs = Path::new("/var/jails/c1/rootfs");
        let result = prefixed_destination(rootfs, "/dev");

        assert_eq!(result, rootfs.join("dev"));
    }

    #[test]
    fn test_resolve_source_substitutes_placeholder_for_empty() {
        assert_eq!(resolve_source(&""), PathBuf::from("null"));
        assert_eq!(resolve_source(&"/tmp"), PathBuf::from("/tmp"));
    }

    #[test]
    fn test_is_file_bind_requires_nullfs_and_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(is_file_bind(&"nullfs", file.path()));
        assert!(!is_file_bind(&"tmpfs", file.path()));

        let dir = tempfile::tempdir().unwrap();
        assert!(!is_file_bind(&"nullfs", dir.path()));
    }

    #[test]
    fn test_bind_file_saves_existing_destination_and_restores_on_unmount() {
        let bundle = tempfile::tempdir().unwrap();
        let rootfs = bundle.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();

        let source = tempfile::NamedTempFile::new().unwrap();
        fs::write(source.path(), b"replacement").unwrap();

        let destination = rootfs.join("etc/resolv.conf");
        fs::write(&destination, b"original").unwrap();

        bind_file(&rootfs, source.path(), &destination, "/etc/resolv.conf").unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"replacement");

        unbind_file(&rootfs, &destination, "/etc/resolv.conf").unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"original");
    }

    #[test]
    fn test_bind_file_with_no_prior_destination_leaves_nothing_to_restore() {
        let bundle = tempfile::tempdir().unwrap();
        let rootfs = bundle.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();

        let source = tempfile::NamedTempFile::new().unwrap();
        fs::write(source.path(), b"replacement").unwrap();

        let destination = rootfs.join("etc/resolv.conf");

        bind_file(&rootfs, source.path(), &destination, "/etc/resolv.conf").unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"replacement");

        unbind_file(&rootfs, &destination, "/etc/resolv.conf").unwrap();
        assert!(!destination.exists());
    }
}
