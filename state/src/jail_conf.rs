//! Renders the `jail.conf` text form persisted alongside a container's
//! other state documents: a subset of the OCI config that maps directly
//! onto jail(8) parameters, kept for operators who inspect or drive the
//! jail with the platform tooling rather than this runtime.

use std::fmt::Write as _;
use std::path::Path;

use oci::RuntimeConfig;

pub fn render(id: &str, rootfs: &Path, config: &RuntimeConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {{", id);
    let _ = writeln!(out, "  path = \"{}\";", rootfs.display());

    if let Some(hostname) = &config.hostname {
        let _ = writeln!(out, "  host.hostname = \"{}\";", hostname);
    }

    if let Some(network) = config.freebsd.as_ref().and_then(|freebsd| freebsd.network.as_ref()) {
        if let Some(ipv4) = &network.ipv4 {
            if let Some(mode) = &ipv4.mode {
                let _ = writeln!(out, "  ip4 = \"{}\";", mode);
            }
            if let Some(addrs) = &ipv4.addr {
                if !addrs.is_empty() {
                    let _ = writeln!(out, "  ip4.addr = {};", addrs.join(", "));
                }
            }
        }

        if let Some(vnet) = &network.vnet {
            if let Some(mode) = &vnet.mode {
                let _ = writeln!(out, "  vnet = \"{}\";", mode);
            }
            if let Some(interfaces) = &vnet.interfaces {
                if !interfaces.is_empty() {
                    let _ = writeln!(out, "  vnet.interface = \"{}\";", interfaces.join(", "));
                }
            }
        }
    }

    let _ = writeln!(out, "  persist;");
    let _ = writeln!(out, "}}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci::{FreeBSD, FreeBSDIPv4, FreeBSDNetwork, FreeBSDVNet};

    #[test]
    fn test_render_minimal() {
        let config = RuntimeConfig {
            oci_version: "1.0.2-freebsd".to_string(),
            root: None,
            mounts: None,
            process: None,
            hostname: None,
            hooks: None,
            annotations: None,
            freebsd: None,
        };

        let text = render("demo", Path::new("/var/lib/runj/jails/demo/rootfs"), &config);
        assert_eq!(
            text,
            "demo {\n  path = \"/var/lib/runj/jails/demo/rootfs\";\n  persist;\n}\n"
        );
    }

    #[test]
    fn test_render_with_network_and_hostname() {
        let config = RuntimeConfig {
            oci_version: "1.0.2-freebsd".to_string(),
            root: None,
            mounts: None,
            process: None,
            hostname: Some("demo.test".to_string()),
            hooks: None,
            annotations: None,
            freebsd: Some(FreeBSD {
                network: Some(FreeBSDNetwork {
                    ipv4: Some(FreeBSDIPv4 {
                        mode: Some("new".to_string()),
                        addr: Some(vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]),
                    }),
                    vnet: Some(FreeBSDVNet {
                        mode: Some("new".to_string()),
                        interfaces: Some(vec!["epair0b".to_string()]),
                    }),
                }),
                resources: None,
            }),
        };

        let text = render("demo", Path::new("/rootfs"), &config);
        assert!(text.contains("host.hostname = \"demo.test\";"));
        assert!(text.contains("ip4 = \"new\";"));
        assert!(text.contains("ip4.addr = 10.0.0.2, 10.0.0.3;"));
        assert!(text.contains("vnet = \"new\";"));
        assert!(text.contains("vnet.interface = \"epair0b\";"));
        assert!(text.contains("persist;"));
    }
}
