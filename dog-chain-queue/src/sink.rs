use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::error;

use crate::{JobEvent, JobEventKind, JobRecord};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Handler signature. Returning `Err` (or panicking) is logged and otherwise ignored.
pub type EventHandler = Arc<dyn Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    kind: JobEventKind,
    handler: EventHandler,
}

/// Events waiting for delivery, in transition order
#[derive(Default)]
struct Outbox {
    queue: VecDeque<JobEvent>,

    /// Set while some thread is delivering the queue
    draining: bool,
}

/// Publish/subscribe surface for job lifecycle transitions.
///
/// Events are queued in the order the transitions happened and delivered by
/// one thread at a time, so every handler sees a job's `enqueued` before any
/// later event for that job. Handlers run synchronously, in registration
/// order, on whichever emitting thread is draining the queue. The handler
/// list is snapshotted before dispatch, so a handler may register or remove
/// listeners, or call back into the engine, without deadlocking. Async
/// consumers can use [`EventSink::subscribe`] instead.
pub struct EventSink {
    listeners: RwLock<Vec<ListenerEntry>>,
    broadcaster: broadcast::Sender<JobEvent>,
    outbox: Mutex<Outbox>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// `capacity` bounds how far a stream subscriber may lag before it skips events
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcaster, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            broadcaster,
            outbox: Mutex::new(Outbox::default()),
        }
    }

    pub fn on<F>(&self, kind: JobEventKind, handler: F) -> ListenerId
    where
        F: Fn(&JobEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = next_listener_id();
        self.listeners.write().push(ListenerEntry {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a listener, returns false if it was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self, kind: JobEventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Stream of every event emitted after this call
    pub fn subscribe(&self) -> BoxStream<JobEvent> {
        let stream = BroadcastStream::new(self.broadcaster.subscribe())
            .filter_map(|result| result.ok());
        Box::pin(stream)
    }

    /// Queue a snapshot of `job` for delivery. The engine calls this while it
    /// still holds its gate, which fixes the delivery order.
    pub(crate) fn queue(&self, kind: JobEventKind, job: &JobRecord, at: DateTime<Utc>) {
        self.outbox
            .lock()
            .queue
            .push_back(JobEvent::new(kind, job.clone(), at));
    }

    /// Deliver queued events until the queue is empty.
    ///
    /// Returns immediately when another thread (or an outer frame of this one)
    /// is already draining; that drainer delivers whatever was queued here.
    /// Returns the number of handlers that failed during this call.
    pub(crate) fn flush(&self) -> usize {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining {
                return 0;
            }
            outbox.draining = true;
        }

        let mut failures = 0;
        loop {
            let event = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        outbox.draining = false;
                        break;
                    }
                }
            };
            failures += self.dispatch(event);
        }
        failures
    }

    /// Run every handler registered for the event's kind, then broadcast it
    fn dispatch(&self, event: JobEvent) -> usize {
        let kind = event.kind;
        let handlers: Vec<EventHandler> = self
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.handler.clone())
            .collect();

        let mut failures = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(event = kind.name(), job_id = %event.job.id, "Event handler failed: {:#}", e);
                }
                Err(panic) => {
                    failures += 1;
                    error!(
                        event = kind.name(),
                        job_id = %event.job.id,
                        "Event handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        // No receivers is fine
        let _ = self.broadcaster.send(event);
        failures
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
