//! OCI runtime configuration types for the FreeBSD jail runtime.
//!
//! Mirrors the [Configuration section of the OCI runtime
//! spec](https://github.com/opencontainers/runtime-spec/blob/v1.0.0/config.md),
//! with a `freebsd` platform extension in place of `linux`/`windows`.

mod merge;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use merge::merge_configs;

pub const OCI_VERSION: &str = "1.0.2-freebsd";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    pub root: Option<Root>,
    pub mounts: Option<Vec<Mount>>,
    pub process: Option<Process>,
    pub hostname: Option<String>,
    pub hooks: Option<Hooks>,
    pub annotations: Option<HashMap<String, String>>,
    pub freebsd: Option<FreeBSD>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Root {
    pub path: PathBuf,
    pub readonly: Option<bool>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Mount {
    pub destination: String,
    pub source: Option<String>,
    pub options: Option<Vec<String>>,
    pub r#type: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Process {
    pub terminal: Option<bool>,
    #[serde(rename = "consoleSize")]
    pub console_size: Option<ConsoleSize>,
    pub cwd: String,
    pub env: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub rlimits: Option<Vec<Rlimit>>,
    pub user: User,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ConsoleSize {
    pub height: u32,
    pub width: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Rlimit {
    pub r#type: String,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    pub umask: Option<u32>,
    #[serde(rename = "additionalGids")]
    pub additional_gids: Option<Vec<u32>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct Hooks {
    pub prestart: Option<Vec<Hook>>,
    #[serde(rename = "createRuntime")]
    pub create_runtime: Option<Vec<Hook>>,
    #[serde(rename = "createContainer")]
    pub create_container: Option<Vec<Hook>>,
    #[serde(rename = "startContainer")]
    pub start_container: Option<Vec<Hook>>,
    pub poststart: Option<Vec<Hook>>,
    pub poststop: Option<Vec<Hook>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Hook {
    pub path: String,
    pub args: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub timeout: Option<u32>,
}

/// FreeBSD-specific configuration, the platform extension in place of
/// `linux`/`windows` blocks from the upstream OCI spec.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSD {
    pub network: Option<FreeBSDNetwork>,
    pub resources: Option<FreeBSDResources>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSDNetwork {
    pub ipv4: Option<FreeBSDIPv4>,
    pub vnet: Option<FreeBSDVNet>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FreeBSDIPv4 {
    pub mode: Option<String>,
    pub addr: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FreeBSDVNet {
    pub mode: Option<String>,
    pub interfaces: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSDResources {
    pub memory: Option<FreeBSDMemory>,
    pub fsio: Option<FreeBSDFsio>,
    pub shm: Option<FreeBSDShm>,
    pub cpu: Option<FreeBSDCpu>,
    pub process: Option<FreeBSDProcess>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSDMemory {
    pub limit: Option<u64>,
    pub warning: Option<u64>,
    pub swap: Option<u64>,
    #[serde(rename = "swapWarning")]
    pub swap_warning: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSDFsio {
    #[serde(rename = "readBps")]
    pub read_bps: Option<u64>,
    #[serde(rename = "writeBps")]
    pub write_bps: Option<u64>,
    #[serde(rename = "readIops")]
    pub read_iops: Option<u64>,
    #[serde(rename = "writeIops")]
    pub write_iops: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSDShm {
    pub count: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSDCpu {
    pub limit: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct FreeBSDProcess {
    pub limit: Option<u64>,
}

impl FreeBSDResources {
    /// Renders every configured resource into a `rctl(8)` rule string of the
    /// form `jail:<id>:<resource>:<action>=<amount>`.
    pub fn rctl_rules(&self, id: &str) -> Vec<String> {
        let mut rules = Vec::new();

        if let Some(memory) = &self.memory {
            if let Some(limit) = memory.limit {
                rules.push(format_rule(id, "memoryuse", "deny", limit));
            }
            if let Some(warning) = memory.warning {
                rules.push(format_rule(id, "memoryuse", "devctl", warning));
            }
            if let Some(swap) = memory.swap {
                rules.push(format_rule(id, "swapuse", "deny", swap));
            }
            if let Some(swap_warning) = memory.swap_warning {
                rules.push(format_rule(id, "swapuse", "devctl", swap_warning));
            }
        }

        if let Some(fsio) = &self.fsio {
            if let Some(v) = fsio.read_bps {
                rules.push(format_rule(id, "readbps", "throttle", v));
            }
            if let Some(v) = fsio.write_bps {
                rules.push(format_rule(id, "writebps", "throttle", v));
            }
            if let Some(v) = fsio.read_iops {
                rules.push(format_rule(id, "readiops", "throttle", v));
            }
            if let Some(v) = fsio.write_iops {
                rules.push(format_rule(id, "writeiops", "throttle", v));
            }
        }

        if let Some(shm) = &self.shm {
            if let Some(v) = shm.count {
                rules.push(format_rule(id, "nshm", "deny", v));
            }
            if let Some(v) = shm.size {
                rules.push(format_rule(id, "shmsize", "deny", v));
            }
        }

        if let Some(cpu) = &self.cpu {
            if let Some(v) = cpu.limit {
                rules.push(format_rule(id, "pcpu", "deny", v));
            }
        }

        if let Some(process) = &self.process {
            if let Some(v) = process.limit {
                rules.push(format_rule(id, "maxproc", "deny", v));
            }
        }

        rules
    }
}

fn format_rule(id: &str, resource: &str, action: &str, amount: u64) -> String {
    format!("jail:{}:{}:{}={}", id, resource, action, amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialization() {
        let fixture = test_helpers::fixture!("runtime_config.json");

        let config: RuntimeConfig = serde_json::from_str(fixture)
            .expect("failed to deserialize runtime config");

        assert_eq!(
            config.process.unwrap().rlimits.unwrap()[0].r#type,
            "RLIMIT_NOFILE"
        );
        assert_eq!(
            config.mounts.unwrap()[0].options.as_ref().unwrap()[0],
            "nosuid"
        );
    }

    #[test]
    fn test_rctl_rules() {
        let resources = FreeBSDResources {
            memory: Some(FreeBSDMemory {
                limit: Some(512 * 1024 * 1024),
                ..Default::default()
            }),
            cpu: Some(FreeBSDCpu { limit: Some(50) }),
            ..Default::default()
        };

        let rules = resources.rctl_rules("container1");

        assert_eq!(
            rules,
            vec![
                "jail:container1:memoryuse:deny=536870912".to_string(),
                "jail:container1:pcpu:deny=50".to_string(),
            ]
        );
    }
}
