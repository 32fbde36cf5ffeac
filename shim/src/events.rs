//! The event-forwarding task: a bounded, backpressured channel from RPC
//! handlers/the reaper to a background thread that publishes each event
//! to the container manager with a 5-second per-event timeout. A failed
//! or timed-out publish is logged and dropped, never fatal to the shim.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

const EVENTS_CHANNEL_CAPACITY: usize = 128;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum Event {
    TaskCreate {
        id: String,
        pid: u32,
    },
    TaskStart {
        id: String,
        exec_id: String,
        pid: u32,
    },
    TaskExecAdded {
        id: String,
        exec_id: String,
    },
    TaskExit {
        id: String,
        exec_id: String,
        pid: u32,
        exit_status: u32,
        exited_at: SystemTime,
    },
    TaskDelete {
        id: String,
    },
}

/// Delivers one event to the container manager. The shim's bootstrap
/// wires a real ttrpc-client publisher; tests use a channel-backed one.
/// `Send + Sync + 'static` so an `Arc` of it can cross into the per-event
/// publish thread `publish_with_timeout` spawns.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, event: &Event) -> anyhow::Result<()>;
}

/// Logs every event instead of forwarding it — used when the shim has no
/// reachable manager endpoint (e.g. standalone `Cleanup` runs).
pub struct LoggingPublisher;

impl Publisher for LoggingPublisher {
    fn publish(&self, event: &Event) -> anyhow::Result<()> {
        tracing::info!(?event, "publishing event");
        Ok(())
    }
}

/// The producer-side handle RPC handlers and the reaper use to enqueue
/// events. Cloning is cheap (it's a channel sender).
#[derive(Clone)]
pub struct EventSink {
    tx: SyncSender<Event>,
}

impl EventSink {
    /// Enqueues `event`. Never blocks the caller past the channel's
    /// capacity acting as backpressure; a full channel means the
    /// forwarder is stuck on a slow publish, which is itself bounded by
    /// `PUBLISH_TIMEOUT`, so this call is bounded in practice too.
    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::error!("events channel closed, dropping event");
        }
    }
}

/// Spawns the forwarder thread and returns the producer-side handle. The
/// forwarder exits (and the spawned thread joins naturally) once every
/// `EventSink` clone is dropped and the channel is empty — the shutdown
/// path described in 4.H.3.
pub fn spawn(publisher: Arc<dyn Publisher>) -> EventSink {
    let (tx, rx) = sync_channel(EVENTS_CHANNEL_CAPACITY);
    thread::spawn(move || forward(rx, publisher));
    EventSink { tx }
}

fn forward(rx: Receiver<Event>, publisher: Arc<dyn Publisher>) {
    loop {
        match rx.recv() {
            Ok(event) => publish_with_timeout(publisher.clone(), event),
            Err(_) => break,
        }
    }
    tracing::info!("event forwarder drained and exiting");
}

/// Races the publish against `PUBLISH_TIMEOUT` on a helper thread, the
/// same pattern `fifo::await_open` uses for the FIFO-open race. `forward`
/// blocks on this call, so the forwarder never issues two publishes
/// concurrently — a stuck publish only delays, never reorders, events.
fn publish_with_timeout(publisher: Arc<dyn Publisher>, event: Event) {
    let (done_tx, done_rx) = sync_channel::<anyhow::Result<()>>(1);

    thread::spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| publisher.publish(&event)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("event publisher panicked")));
        let _ = done_tx.send(result);
    });

    match done_rx.recv_timeout(PUBLISH_TIMEOUT) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!("event publish failed: {}", err),
        Err(RecvTimeoutError::Timeout) => {
            tracing::error!("event publish exceeded {:?}, dropping", PUBLISH_TIMEOUT)
        }
        Err(RecvTimeoutError::Disconnected) => {
            tracing::error!("event publisher dropped without replying")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingPublisher(Arc<Mutex<Vec<Event>>>);

    impl Publisher for RecordingPublisher {
        fn publish(&self, event: &Event) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_spawn_forwards_events_in_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = spawn(Arc::new(RecordingPublisher(received.clone())));

        sink.send(Event::TaskCreate {
            id: "c1".to_string(),
            pid: 10,
        });
        sink.send(Event::TaskStart {
            id: "c1".to_string(),
            exec_id: String::new(),
            pid: 10,
        });

        drop(sink);
        thread::sleep(Duration::from_millis(50));

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::TaskCreate { .. }));
        assert!(matches!(events[1], Event::TaskStart { .. }));
    }

    struct SlowPublisher;
    impl Publisher for SlowPublisher {
        fn publish(&self, _event: &Event) -> anyhow::Result<()> {
            thread::sleep(Duration::from_secs(10));
            Ok(())
        }
    }

    #[test]
    fn test_publish_with_timeout_does_not_block_forever() {
        let started = std::time::Instant::now();
        publish_with_timeout(
            Arc::new(SlowPublisher),
            Event::TaskDelete {
                id: "c1".to_string(),
            },
        );
        assert!(started.elapsed() < Duration::from_secs(6));
    }
}
