//! A single kernel process tracked by the shim: the container's primary
//! process, or one auxiliary process spawned by `exec`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

use crate::io::{IoHandles, StdioPaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub exit_status: u32,
    pub exited_at: SystemTime,
}

/// Signaled exactly once, by the reaper, when the process's kernel exit is
/// observed. `Wait` callers block on this rather than polling.
#[derive(Debug, Default)]
struct CompletionSignal {
    fired: Mutex<Option<ExitRecord>>,
    condvar: Condvar,
}

impl CompletionSignal {
    fn fire(&self, record: ExitRecord) {
        let mut fired = self.fired.lock().unwrap();
        if fired.is_some() {
            return;
        }
        *fired = Some(record);
        self.condvar.notify_all();
    }

    fn wait(&self) -> ExitRecord {
        let mut fired = self.fired.lock().unwrap();
        while fired.is_none() {
            fired = self.condvar.wait(fired).unwrap();
        }
        fired.unwrap()
    }

    fn peek(&self) -> Option<ExitRecord> {
        *self.fired.lock().unwrap()
    }
}

/// A process the shim is responsible for reaping and reporting on. Shared
/// via `Arc` between the map the shim owns and the reaper thread that
/// transitions it; never holds a reference back to the shim itself (the
/// reaper looks it up by pid instead).
#[derive(Debug)]
pub struct ManagedProcess {
    pid: Mutex<i32>,
    status: Mutex<Status>,
    io: Mutex<Option<IoHandles>>,
    exit: CompletionSignal,
    /// Exec-only: path of the serialized process spec, removed on delete.
    pub spec_path: Option<std::path::PathBuf>,
    /// Exec-only: the I/O endpoints requested at `Exec` time, consumed
    /// when `Start` actually spawns the auxiliary process (the endpoints
    /// themselves — FIFOs or a console socket — are only opened then).
    pending_stdio: Mutex<Option<StdioPaths>>,
}

impl ManagedProcess {
    pub fn new(status: Status) -> Arc<Self> {
        Arc::new(Self {
            pid: Mutex::new(0),
            status: Mutex::new(status),
            io: Mutex::new(None),
            exit: CompletionSignal::default(),
            spec_path: None,
            pending_stdio: Mutex::new(None),
        })
    }

    pub fn with_spec_path(status: Status, spec_path: std::path::PathBuf) -> Arc<Self> {
        Arc::new(Self {
            pid: Mutex::new(0),
            status: Mutex::new(status),
            io: Mutex::new(None),
            exit: CompletionSignal::default(),
            spec_path: Some(spec_path),
            pending_stdio: Mutex::new(None),
        })
    }

    pub fn set_pending_stdio(&self, stdio: StdioPaths) {
        *self.pending_stdio.lock().unwrap() = Some(stdio);
    }

    pub fn take_pending_stdio(&self) -> Option<StdioPaths> {
        self.pending_stdio.lock().unwrap().take()
    }

    pub fn pid(&self) -> i32 {
        *self.pid.lock().unwrap()
    }

    /// Sets the pid exactly once; a second call is a programmer error
    /// (mismatched invariant per the runtime's error taxonomy).
    pub fn set_pid(&self, pid: i32) -> anyhow::Result<()> {
        let mut guard = self.pid.lock().unwrap();
        if *guard != 0 {
            anyhow::bail!("managed process: pid already set");
        }
        *guard = pid;
        Ok(())
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: Status) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_io(&self, io: IoHandles) {
        *self.io.lock().unwrap() = Some(io);
    }

    /// Closes and drops the I/O handles exactly once.
    pub fn close_io(&self) {
        self.io.lock().unwrap().take();
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        self.exit.peek()
    }

    /// Transitions to `stopped`, records the exit tuple, and fires the
    /// completion signal. A no-op past the first call.
    pub fn mark_exited(&self, exit_status: u32, exited_at: SystemTime) {
        self.set_status(Status::Stopped);
        self.exit.fire(ExitRecord {
            exit_status,
            exited_at,
        });
    }

    /// Blocks the calling thread until `mark_exited` has run.
    pub fn wait(&self) -> ExitRecord {
        self.exit.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_set_pid_once_then_rejects_second_set() {
        let process = ManagedProcess::new(Status::Created);
        process.set_pid(42).unwrap();
        assert_eq!(process.pid(), 42);
        assert!(process.set_pid(43).is_err());
    }

    #[test]
    fn test_mark_exited_is_idempotent_and_wakes_waiters() {
        let process = ManagedProcess::new(Status::Running);
        let waiter = process.clone();

        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(20));
        process.mark_exited(0, SystemTime::now());
        process.mark_exited(1, SystemTime::now());

        let record = handle.join().unwrap();
        assert_eq!(record.exit_status, 0);
        assert_eq!(process.status(), Status::Stopped);
    }
}
