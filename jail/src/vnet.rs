//! Moving network interfaces in and out of a jail's vnet, via `ifconfig(8)`
//! — the kernel has no syscall for this, only the `SIOCSIFVNET` ioctl that
//! `ifconfig` itself wraps.

use std::process::Command;

const IFCONFIG: &str = "/sbin/ifconfig";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Move the interface into the jail's vnet.
    In,
    /// Move the interface back out to the host's vnet.
    Out,
}

/// Moves `interfaces` in or out of the vnet of jail `jid`.
pub fn move_interfaces(jid: i32, interfaces: &[String], direction: Direction) -> anyhow::Result<()> {
    if interfaces.is_empty() {
        return Ok(());
    }

    if jid == 0 {
        anyhow::bail!("jail: cannot move vnet interface to jail 0");
    }

    let vnet_arg = match direction {
        Direction::In => "vnet",
        Direction::Out => "-vnet",
    };

    for interface in interfaces {
        let output = Command::new(IFCONFIG)
            .arg(interface)
            .arg(vnet_arg)
            .arg(jid.to_string())
            .output()?;

        if !output.status.success() {
            anyhow::bail!(
                "ifconfig {} {} {}: {}",
                interface,
                vnet_arg,
                jid,
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_interfaces_is_noop() {
        move_interfaces(1, &[], Direction::In).expect("empty list must short-circuit");
    }

    #[test]
    fn test_jail_zero_rejected() {
        let err =
            move_interfaces(0, &["em0".to_string()], Direction::In).unwrap_err();
        assert!(err.to_string().contains("jail 0"));
    }
}
