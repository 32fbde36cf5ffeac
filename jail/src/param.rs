use std::net::Ipv4Addr;

/// A single jail(2) parameter value, marshaled the way `jail_set(2)`/
/// `jail_get(2)` expect: every parameter is a named `iovec` pair, and the
/// value's wire representation depends on its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A 32-bit integer parameter (e.g. `vnet`, `ip4`, `enforce_statfs`).
    Int(i32),
    /// A null-terminated string parameter (e.g. `name`, `path`,
    /// `host.hostname`).
    String(String),
    /// A value-less parameter, signaled to the kernel by an empty value
    /// buffer (e.g. `persist`).
    Null,
    /// A boolean toggle, rendered as `name` when true or `"no" + name`
    /// when false (e.g. `allow.raw_sockets` / `allow.noraw_sockets`).
    Bool(bool),
    /// A list of IPv4 addresses (`ip4.addr`).
    Ipv4List(Vec<Ipv4Addr>),
    /// A fixed-size byte buffer used for `jail_get(2)` output (e.g.
    /// reading back a jail's `name`). The caller supplies a buffer of the
    /// desired capacity; the backend overwrites it with the kernel's
    /// output of the same length.
    Buffer(Vec<u8>),
}

/// Tri-state jail network parameter, shared by `vnet` and `ip4`: the
/// kernel's own parameter encodes "disabled"/"new"/"inherit" as 0/1/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Disabled,
    New,
    Inherit,
}

impl Mode {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "disable" | "disabled" => Ok(Mode::Disabled),
            "new" => Ok(Mode::New),
            "inherit" => Ok(Mode::Inherit),
            other => anyhow::bail!("jail: unknown mode {:?}", other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Mode::Disabled => 0,
            Mode::New => 1,
            Mode::Inherit => 2,
        }
    }
}

impl From<Mode> for Value {
    fn from(mode: Mode) -> Self {
        Value::Int(mode.as_i32())
    }
}

/// A named parameter, the unit `jail_set`/`jail_get` iovec pairs are
/// built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("new").unwrap(), Mode::New);
        assert_eq!(Mode::parse("inherit").unwrap(), Mode::Inherit);
        assert_eq!(Mode::parse("disable").unwrap(), Mode::Disabled);
        assert!(Mode::parse("bogus").is_err());
    }

    #[test]
    fn test_mode_as_i32() {
        assert_eq!(Mode::Disabled.as_i32(), 0);
        assert_eq!(Mode::New.as_i32(), 1);
        assert_eq!(Mode::Inherit.as_i32(), 2);
    }
}
