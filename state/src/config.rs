//! Copies and locks the OCI config document into the state directory at
//! create time, so a bundle directory mutated after `create` can't change
//! a container's configuration out from under it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Error;
use oci::{merge_configs, RuntimeConfig};

use crate::error::RunjError;

const CONFIG_FILE: &str = "config.json";
const EXTENSION_FILE: &str = "runj.ext.json";
const JAIL_CONF_FILE: &str = "jail.conf";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(CONFIG_FILE)
    }

    fn extension_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(EXTENSION_FILE)
    }

    /// Copies `config.json` (and `runj.ext.json`, if present) out of the
    /// bundle directory into the state directory, merging the extension
    /// document into the base config via a deep-union merge.
    #[fehler::throws(Error)]
    pub fn lock(&self, id: &str, bundle: impl AsRef<Path>) -> RuntimeConfig {
        let bundle = bundle.as_ref();
        let base = fs::read(bundle.join(CONFIG_FILE)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RunjError::InvalidArgument(format!(
                    "bundle {:?} has no config.json",
                    bundle
                ))
            } else {
                RunjError::from(err)
            }
        })?;
        let base_value: serde_json::Value = serde_json::from_slice(&base)?;

        let merged_value = match fs::read(bundle.join(EXTENSION_FILE)) {
            Ok(bytes) => {
                let overlay: serde_json::Value = serde_json::from_slice(&bytes)?;
                merge_configs(base_value, overlay)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => base_value,
            Err(err) => fehler::throw!(RunjError::from(err)),
        };

        let config: RuntimeConfig = serde_json::from_value(merged_value.clone())?;

        fs::write(self.config_path(id), serde_json::to_vec(&merged_value)?)?;

        config
    }

    #[fehler::throws(Error)]
    pub fn load(&self, id: &str) -> RuntimeConfig {
        let bytes = fs::read(self.config_path(id)).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RunjError::NotFound(format!("container '{}' does not exist", id))
            } else {
                RunjError::from(err)
            }
        })?;

        serde_json::from_slice(&bytes).map_err(RunjError::from)?
    }

    /// Renders and persists `jail.conf` for `id`, for operators who
    /// inspect or drive the jail with the platform tooling directly.
    #[fehler::throws(Error)]
    pub fn write_jail_conf(&self, id: &str, rootfs: &Path, config: &RuntimeConfig) {
        let text = crate::jail_conf::render(id, rootfs, config);
        fs::write(self.root.join(id).join(JAIL_CONF_FILE), text)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn bundle_with(config: &str, extension: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), config).unwrap();
        if let Some(extension) = extension {
            fs::write(dir.path().join(EXTENSION_FILE), extension).unwrap();
        }
        dir
    }

    fn minimal_config() -> &'static str {
        r#"{
            "ociVersion": "1.0.2-freebsd",
            "root": {"path": "rootfs"},
            "process": {"cwd": "/", "user": {"uid": 0, "gid": 0}}
        }"#
    }

    #[test]
    fn test_lock_copies_config_without_extension() {
        let bundle = bundle_with(minimal_config(), None);
        let state_root = tempfile::tempdir().unwrap();
        fs::create_dir_all(state_root.path().join("container1")).unwrap();

        let store = ConfigStore::new(state_root.path());
        let config = store.lock("container1", bundle.path()).unwrap();

        assert_eq!(config.process.unwrap().user.uid, 0);
    }

    #[test]
    fn test_lock_merges_extension_document() {
        let bundle = bundle_with(
            minimal_config(),
            Some(r#"{"process": {"user": {"uid": 1000, "gid": 1000}}}"#),
        );
        let state_root = tempfile::tempdir().unwrap();
        fs::create_dir_all(state_root.path().join("container1")).unwrap();

        let store = ConfigStore::new(state_root.path());
        let config = store.lock("container1", bundle.path()).unwrap();

        assert_eq!(config.process.as_ref().unwrap().user.uid, 1000);
        assert_eq!(config.process.as_ref().unwrap().user.gid, 1000);
    }

    #[test]
    fn test_load_after_lock_matches() {
        let bundle = bundle_with(minimal_config(), None);
        let state_root = tempfile::tempdir().unwrap();
        fs::create_dir_all(state_root.path().join("container1")).unwrap();

        let store = ConfigStore::new(state_root.path());
        store.lock("container1", bundle.path()).unwrap();

        let loaded = store.load("container1").unwrap();
        assert_eq!(loaded.root.unwrap().path, PathBuf::from("rootfs"));
    }
}
