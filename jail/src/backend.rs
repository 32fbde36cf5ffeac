use crate::param::{Param, Value};

/// Abstracts the four jail(2) syscalls so that parameter marshaling can be
/// exercised without root, a FreeBSD kernel, or even the `target_os =
/// "freebsd"` cfg gate. `SyscallBackend` is the only implementation that
/// talks to the kernel; tests use `MockBackend`.
pub trait JailBackend {
    /// `jail_set(2)`. Returns the jid of the (possibly newly created) jail.
    /// `params` is `&mut` because a `Value::Buffer` entry is overwritten
    /// with the kernel's output in place.
    fn jail_set(&self, params: &mut [Param], flags: i32) -> anyhow::Result<i32>;
    /// `jail_get(2)`. Returns the jid matching the lookup parameters
    /// (typically `name` or `jid`); fills any `Value::Buffer` entries with
    /// the kernel's output.
    fn jail_get(&self, params: &mut [Param], flags: i32) -> anyhow::Result<i32>;
    /// `jail_attach(2)`.
    fn jail_attach(&self, jid: i32) -> anyhow::Result<()>;
    /// `jail_remove(2)`.
    fn jail_remove(&self, jid: i32) -> anyhow::Result<()>;
}

pub const JAIL_CREATE: i32 = 0x01;
pub const JAIL_UPDATE: i32 = 0x02;
pub const JAIL_ATTACH: i32 = 0x04;

#[cfg(target_os = "freebsd")]
pub use syscall_backend::SyscallBackend;

#[cfg(target_os = "freebsd")]
mod syscall_backend {
    use std::ffi::CString;
    use std::io::Error as IoError;

    use super::{JailBackend, Param, Value};

    /// Talks to the running FreeBSD kernel via `jail_set(2)`/`jail_get(2)`/
    /// `jail_attach(2)`/`jail_remove(2)`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SyscallBackend;

    /// Length of the caller-owned error-message buffer every `jail_set`/
    /// `jail_get` call appends as its trailing pair.
    const ERRMSG_LEN: usize = 1024;

    /// Owns the byte buffers backing a `libc::jail_set`/`jail_get` iovec
    /// array so the iovecs stay valid for the syscall's duration.
    struct IovecBuilder {
        // Each entry keeps its key/value bytes alive alongside the iovec
        // pointing into them.
        buffers: Vec<Vec<u8>>,
        iovecs: Vec<libc::iovec>,
    }

    impl IovecBuilder {
        fn new() -> Self {
            Self {
                buffers: Vec::new(),
                iovecs: Vec::new(),
            }
        }

        fn push(&mut self, bytes: Vec<u8>) {
            self.buffers.push(bytes);
        }

        /// Must be called only once all buffers have been pushed: moving a
        /// `Vec` after taking a pointer into it would invalidate the iovec.
        fn finish(mut self) -> (Vec<Vec<u8>>, Vec<libc::iovec>) {
            for buffer in &mut self.buffers {
                self.iovecs.push(libc::iovec {
                    iov_base: buffer.as_mut_ptr() as *mut _,
                    iov_len: buffer.len(),
                });
            }
            (self.buffers, self.iovecs)
        }
    }

    fn push_param(builder: &mut IovecBuilder, param: &Param) -> anyhow::Result<()> {
        let key = CString::new(param.name.as_str())?.into_bytes_with_nul();
        builder.push(key);

        match &param.value {
            Value::Int(value) => {
                builder.push(value.to_ne_bytes().to_vec());
            }
            Value::String(value) => {
                builder.push(CString::new(value.as_str())?.into_bytes_with_nul());
            }
            Value::Null => {
                builder.push(Vec::new());
            }
            Value::Bool(true) => {
                builder.push(Vec::new());
            }
            Value::Bool(false) => {
                // Caller is expected to have prefixed the param name with
                // "no" already; kept here for the case it wasn't.
                builder.push(Vec::new());
            }
            Value::Ipv4List(addrs) => {
                let mut buf = Vec::with_capacity(addrs.len() * 4);
                for addr in addrs {
                    buf.extend_from_slice(&u32::from(*addr).to_be_bytes());
                }
                builder.push(buf);
            }
            Value::Buffer(bytes) => {
                builder.push(bytes.clone());
            }
        }

        Ok(())
    }

    /// Builds the iovec array for `params`, plus a trailing `errmsg`
    /// buffer every call carries. Returns the raw buffers (so output can
    /// be read back after the syscall), the iovecs themselves, the
    /// `(param index, buffer index)` pairs for any `Value::Buffer` params,
    /// and the buffer index holding the error message.
    fn build_iovecs(
        params: &[Param],
    ) -> anyhow::Result<(Vec<Vec<u8>>, Vec<libc::iovec>, Vec<(usize, usize)>, usize)> {
        let mut builder = IovecBuilder::new();
        let mut buffer_slots = Vec::new();

        for (index, param) in params.iter().enumerate() {
            push_param(&mut builder, param)?;
            if matches!(param.value, Value::Buffer(_)) {
                buffer_slots.push((index, builder.buffers.len() - 1));
            }
        }

        builder.push(b"errmsg\0".to_vec());
        builder.push(vec![0u8; ERRMSG_LEN]);
        let errmsg_slot = builder.buffers.len() - 1;

        let (buffers, iovecs) = builder.finish();
        Ok((buffers, iovecs, buffer_slots, errmsg_slot))
    }

    type JailSyscall =
        unsafe extern "C" fn(*mut libc::iovec, libc::c_uint, libc::c_int) -> libc::c_int;

    /// Runs `syscall` (`jail_set`/`jail_get`) over `params`, writing any
    /// `Value::Buffer` output back into `params` and preferring the
    /// kernel's error-message buffer over the raw errno on failure.
    fn jail_iovec_syscall(
        syscall: JailSyscall,
        label: &str,
        params: &mut [Param],
        flags: i32,
    ) -> anyhow::Result<i32> {
        let (buffers, mut iovecs, buffer_slots, errmsg_slot) = build_iovecs(params)?;

        let jid = unsafe { syscall(iovecs.as_mut_ptr(), iovecs.len() as u32, flags) };

        for (param_index, buffer_index) in buffer_slots {
            params[param_index].value = Value::Buffer(buffers[buffer_index].clone());
        }

        if jid < 0 {
            let errmsg = &buffers[errmsg_slot];
            if errmsg.first() != Some(&0) {
                let end = errmsg.iter().position(|&b| b == 0).unwrap_or(errmsg.len());
                anyhow::bail!("{} failed: {}", label, String::from_utf8_lossy(&errmsg[..end]));
            }
            anyhow::bail!("{} failed: {}", label, IoError::last_os_error());
        }

        Ok(jid)
    }

    impl JailBackend for SyscallBackend {
        fn jail_set(&self, params: &mut [Param], flags: i32) -> anyhow::Result<i32> {
            jail_iovec_syscall(libc::jail_set, "jail_set(2)", params, flags)
        }

        fn jail_get(&self, params: &mut [Param], flags: i32) -> anyhow::Result<i32> {
            jail_iovec_syscall(libc::jail_get, "jail_get(2)", params, flags)
        }

        fn jail_attach(&self, jid: i32) -> anyhow::Result<()> {
            if unsafe { libc::jail_attach(jid) } < 0 {
                anyhow::bail!("jail_attach(2) failed: {}", IoError::last_os_error());
            }
            Ok(())
        }

        fn jail_remove(&self, jid: i32) -> anyhow::Result<()> {
            if unsafe { libc::jail_remove(jid) } < 0 {
                anyhow::bail!("jail_remove(2) failed: {}", IoError::last_os_error());
            }
            Ok(())
        }
    }
}

/// In-memory jail backend used by tests to exercise parameter marshaling
/// and call sites without a FreeBSD kernel (testable property: parameter
/// round-trip via mock kernel).
#[derive(Debug, Default)]
pub struct MockBackend {
    pub jails: std::sync::Mutex<std::collections::HashMap<i32, Vec<Param>>>,
    pub next_jid: std::sync::atomic::AtomicI32,
    pub attached: std::sync::Mutex<Vec<i32>>,
    pub removed: std::sync::Mutex<Vec<i32>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            jails: std::sync::Mutex::new(std::collections::HashMap::new()),
            next_jid: std::sync::atomic::AtomicI32::new(1),
            attached: std::sync::Mutex::new(Vec::new()),
            removed: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn name_param<'a>(params: &'a [Param]) -> Option<&'a str> {
        params
            .iter()
            .find(|param| param.name == "name")
            .and_then(|param| match &param.value {
                Value::String(name) => Some(name.as_str()),
                _ => None,
            })
    }
}

impl MockBackend {
    fn resolve_jid(&self, params: &[Param]) -> anyhow::Result<i32> {
        let jid_param = params.iter().find(|param| param.name == "jid");
        if let Some(Param {
            value: Value::Int(jid),
            ..
        }) = jid_param
        {
            return if self.jails.lock().unwrap().contains_key(jid) {
                Ok(*jid)
            } else {
                anyhow::bail!("jail_get: no such jail {}", jid)
            };
        }

        let name = Self::name_param(params)
            .ok_or_else(|| anyhow::anyhow!("jail_get: name or jid is required"))?;
        self.jails
            .lock()
            .unwrap()
            .iter()
            .find(|(_, existing_params)| Self::name_param(existing_params) == Some(name))
            .map(|(jid, _)| *jid)
            .ok_or_else(|| anyhow::anyhow!("jail_get: no such jail {}", name))
    }
}

impl JailBackend for MockBackend {
    fn jail_set(&self, params: &mut [Param], flags: i32) -> anyhow::Result<i32> {
        use std::sync::atomic::Ordering;

        if flags & JAIL_UPDATE != 0 && flags & JAIL_CREATE == 0 {
            let name = Self::name_param(params)
                .ok_or_else(|| anyhow::anyhow!("jail_set: update requires a name"))?;
            let mut jails = self.jails.lock().unwrap();
            let existing = jails
                .iter()
                .find(|(_, existing_params)| {
                    Self::name_param(existing_params) == Some(name)
                })
                .map(|(jid, _)| *jid)
                .ok_or_else(|| anyhow::anyhow!("jail_set: no such jail {}", name))?;
            jails.insert(existing, params.to_vec());
            return Ok(existing);
        }

        let jid = self.next_jid.fetch_add(1, Ordering::SeqCst);
        self.jails.lock().unwrap().insert(jid, params.to_vec());
        Ok(jid)
    }

    fn jail_get(&self, params: &mut [Param], _flags: i32) -> anyhow::Result<i32> {
        let jid = self.resolve_jid(params)?;

        let jails = self.jails.lock().unwrap();
        if let Some(stored) = jails.get(&jid) {
            for param in params.iter_mut() {
                if matches!(param.value, Value::Buffer(_)) {
                    if let Some(found) = stored.iter().find(|existing| existing.name == param.name) {
                        param.value = found.value.clone();
                    }
                }
            }
        }

        Ok(jid)
    }

    fn jail_attach(&self, jid: i32) -> anyhow::Result<()> {
        if !self.jails.lock().unwrap().contains_key(&jid) {
            anyhow::bail!("jail_attach: no such jail {}", jid);
        }
        self.attached.lock().unwrap().push(jid);
        Ok(())
    }

    fn jail_remove(&self, jid: i32) -> anyhow::Result<()> {
        self.jails
            .lock()
            .unwrap()
            .remove(&jid)
            .ok_or_else(|| anyhow::anyhow!("jail_remove: no such jail {}", jid))?;
        self.removed.lock().unwrap().push(jid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_create_then_find_by_name() {
        let backend = MockBackend::new();
        let mut params = vec![Param::new("name", "demo"), Param::new("persist", Value::Null)];

        let jid = backend.jail_set(&mut params, JAIL_CREATE).unwrap();
        let found = backend
            .jail_get(&mut [Param::new("name", "demo")], 0)
            .unwrap();

        assert_eq!(jid, found);
    }

    #[test]
    fn test_mock_attach_unknown_jail_fails() {
        let backend = MockBackend::new();
        assert!(backend.jail_attach(42).is_err());
    }

    #[test]
    fn test_mock_remove_roundtrip() {
        let backend = MockBackend::new();
        let jid = backend
            .jail_set(&mut [Param::new("name", "demo")], JAIL_CREATE)
            .unwrap();

        backend.jail_remove(jid).unwrap();
        assert!(backend.jail_get(&mut [Param::new("name", "demo")], 0).is_err());
    }

    #[test]
    fn test_buffer_value_round_trips_through_mock_get() {
        let backend = MockBackend::new();
        let original = b"example.test\0\0\0".to_vec();
        let mut create_params = vec![
            Param::new("name", "demo"),
            Param::new("host.hostname", Value::Buffer(original.clone())),
        ];
        let jid = backend.jail_set(&mut create_params, JAIL_CREATE).unwrap();

        let mut get_params = vec![
            Param::new("jid", jid),
            Param::new("host.hostname", Value::Buffer(vec![0u8; original.len()])),
        ];
        backend.jail_get(&mut get_params, 0).unwrap();

        assert_eq!(get_params[1].value, Value::Buffer(original));
    }
}
