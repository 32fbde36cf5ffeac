//! Lets the shim apply the container-manager's `rootfs` mount list (the
//! filesystem layers that assemble `<bundle>/rootfs`) the same way
//! `mount::Mountable` already lets the runtime apply an OCI config's
//! bind-mount list.

use std::path::Path;

use anyhow::Error;
use mount::Mountable;

use crate::protocols::shim::Mount;

impl Mountable for Mount {
    fn kind(&self) -> &dyn AsRef<Path> {
        &self.field_type
    }

    fn source(&self) -> &dyn AsRef<Path> {
        &self.source
    }

    fn destination(&self) -> &str {
        &self.target
    }

    fn options(&self) -> Vec<String> {
        self.options.as_ref().to_vec()
    }

    #[fehler::throws]
    fn post_mount_hooks(&self, _rootfs: impl AsRef<Path>) {}
}
