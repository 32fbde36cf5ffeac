//! Applies and reverts `rctl(8)` resource limits by shelling out to the
//! real binary rather than linking against `librctl`.

use std::process::Command;

use anyhow::{anyhow, Error};
use oci::RuntimeConfig;

#[fehler::throws]
pub fn apply(id: &str, config: &RuntimeConfig) {
    let resources = match config.freebsd.as_ref().and_then(|freebsd| freebsd.resources.as_ref()) {
        Some(resources) => resources,
        None => return,
    };

    for rule in resources.rctl_rules(id) {
        run_rctl(&["-a", &rule])?;
    }
}

#[fehler::throws]
pub fn revert(id: &str, config: &RuntimeConfig) {
    let resources = match config.freebsd.as_ref().and_then(|freebsd| freebsd.resources.as_ref()) {
        Some(resources) => resources,
        None => return,
    };

    let mut first_error = None;
    for rule in resources.rctl_rules(id) {
        if let Err(err) = run_rctl(&["-r", &rule]) {
            tracing::warn!("failed to remove rctl rule {}: {}", rule, err);
            first_error.get_or_insert(err);
        }
    }

    if let Some(err) = first_error {
        fehler::throw!(err);
    }
}

#[fehler::throws]
fn run_rctl(args: &[&str]) {
    let status = Command::new("rctl").args(args).status()?;

    if !status.success() {
        fehler::throw!(anyhow!("rctl {} failed: {}", args.join(" "), status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci::FreeBSD;

    fn config_with_memory_limit() -> RuntimeConfig {
        let mut config: RuntimeConfig =
            serde_json::from_str(test_helpers::fixture!("runtime_config.json")).unwrap();
        let mut resources = oci::FreeBSDResources::default();
        resources.memory = Some(oci::FreeBSDMemory {
            limit: Some(536_870_912),
            ..Default::default()
        });
        config.freebsd = Some(FreeBSD {
            resources: Some(resources),
            ..Default::default()
        });
        config
    }

    #[test]
    fn test_apply_noop_without_freebsd_section() {
        let config: RuntimeConfig =
            serde_json::from_str(test_helpers::fixture!("runtime_config.json")).unwrap();
        assert!(config.freebsd.is_none());
        apply("container1", &config).expect("should be a no-op");
    }

    #[test]
    #[ignore = "requires the rctl(8) binary and root"]
    fn test_apply_then_revert_memory_limit() {
        let config = config_with_memory_limit();
        apply("container1", &config).expect("failed to apply rctl rule");
        revert("container1", &config).expect("failed to revert rctl rule");
    }
}
