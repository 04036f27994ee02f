//! Event fan-out to external listener worker processes.
//!
//! A [`ListenerPool`] subscribes to a set of event types on the bus and
//! multiplexes the resulting stream across a pool of worker processes
//! attached by their stdin/stdout pipes.  The wire protocol is
//! line-oriented, one direction each:
//!
//! - worker → supervisor: handshake tokens, one per line (currently
//!   only `READY`);
//! - supervisor → worker: formatted event lines, e.g.
//!   `PROCESS_STATE_RUNNING 2024-03-01T12:00:00+00:00 group:web name:web`.
//!
//! Back-pressure is lossy by design.  The queue in front of the
//! dispatcher is bounded and drops the oldest unconsumed events when it
//! overflows; an event with no READY worker at dispatch time is dropped
//! for the whole pool.  The publisher is never blocked.

use chrono::{DateTime, SecondsFormat};
use kahi_events::{Event, EventBus, EventType};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const READY_TOKEN: &str = "READY";

/// Handshake state of one attached worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Attached, has not yet announced readiness.
    Acknowledged,
    /// Eligible to receive the next event.
    Ready,
    /// Holds an event, awaiting its next `READY`.
    Busy,
    /// Pipes closed; skipped and pruned on the next dispatch.
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

struct Listener {
    name: String,
    stdin: Mutex<BoxedWriter>,
    state: parking_lot::Mutex<ListenerState>,
}

impl Listener {
    fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock() = state;
    }
}

struct PoolShared {
    name: String,
    listeners: Mutex<Vec<Arc<Listener>>>,
}

impl PoolShared {
    /// Hand `event` to the first READY listener in registration order,
    /// or drop it when none is ready.  A failed write closes and
    /// removes the listener.
    async fn send_to_ready(&self, event: &Event) {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|listener| listener.state() != ListenerState::Closed);
        let Some(target) = listeners
            .iter()
            .find(|listener| listener.state() == ListenerState::Ready)
            .cloned()
        else {
            debug!(
                pool = %self.name,
                event_type = %event.event_type,
                "no ready listener, dropping event"
            );
            return;
        };

        let payload = format_event_payload(event);
        let write = {
            let mut stdin = target.stdin.lock().await;
            async {
                stdin.write_all(payload.as_bytes()).await?;
                stdin.flush().await
            }
            .await
        };
        match write {
            Ok(()) => target.set_state(ListenerState::Busy),
            Err(error) => {
                debug!(
                    pool = %self.name,
                    listener = %target.name,
                    error = %error,
                    "listener pipe write failed, removing listener"
                );
                target.set_state(ListenerState::Closed);
                listeners.retain(|listener| !Arc::ptr_eq(listener, &target));
            }
        }
    }
}

/// A pool of external workers fed from the event bus.
pub struct ListenerPool {
    bus: Arc<EventBus>,
    shared: Arc<PoolShared>,
    events_tx: broadcast::Sender<Event>,
    subscription_ids: Vec<u64>,
    stop_tx: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    readers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerPool {
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>, event_types: &[EventType]) -> Self {
        Self::with_queue_capacity(name, bus, event_types, DEFAULT_QUEUE_CAPACITY)
    }

    /// Like [`ListenerPool::new`] with an explicit queue bound
    /// (minimum 2).
    pub fn with_queue_capacity(
        name: impl Into<String>,
        bus: Arc<EventBus>,
        event_types: &[EventType],
        capacity: usize,
    ) -> Self {
        let name = name.into();
        let (events_tx, events_rx) = broadcast::channel(capacity.max(2));
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            name: name.clone(),
            listeners: Mutex::new(Vec::new()),
        });

        let subscription_ids = event_types
            .iter()
            .map(|&event_type| {
                let events_tx = events_tx.clone();
                bus.subscribe(event_type, move |event| {
                    // Send never blocks; a lagging dispatcher sheds the
                    // oldest queued events.
                    let _ = events_tx.send(event.clone());
                })
            })
            .collect();

        let dispatch = tokio::spawn(dispatch_loop(shared.clone(), events_rx, stop_rx));

        Self {
            bus,
            shared,
            events_tx,
            subscription_ids,
            stop_tx,
            dispatch,
            readers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Attach a worker by its pipes.  The worker starts in
    /// [`ListenerState::Acknowledged`] and becomes eligible for
    /// dispatch once it writes `READY\n` on `stdout`.
    pub async fn add_listener(
        &self,
        name: impl Into<String>,
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
    ) {
        let listener = Arc::new(Listener {
            name: name.into(),
            stdin: Mutex::new(Box::new(stdin)),
            state: parking_lot::Mutex::new(ListenerState::Acknowledged),
        });
        self.shared.listeners.lock().await.push(listener.clone());
        let reader = tokio::spawn(read_tokens(
            self.shared.name.clone(),
            listener,
            Box::new(stdout),
        ));
        self.readers.lock().push(reader);
    }

    pub async fn listener_state(&self, name: &str) -> Option<ListenerState> {
        self.shared
            .listeners
            .lock()
            .await
            .iter()
            .find(|listener| listener.name == name)
            .map(|listener| listener.state())
    }

    pub async fn listener_count(&self) -> usize {
        self.shared.listeners.lock().await.len()
    }

    /// Tear the pool down: detach from the bus, drain the dispatcher,
    /// and wait for every owned task to exit.  Bus subscriber counts
    /// return to their pre-construction values before this returns.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for id in &self.subscription_ids {
            self.bus.unsubscribe(*id);
        }
        drop(self.events_tx);
        let _ = self.dispatch.await;
        let readers = std::mem::take(&mut *self.readers.lock());
        for reader in readers {
            reader.abort();
            let _ = reader.await;
        }
    }
}

async fn dispatch_loop(
    shared: Arc<PoolShared>,
    mut events_rx: broadcast::Receiver<Event>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            received = events_rx.recv() => match received {
                Ok(event) => shared.send_to_ready(&event).await,
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(pool = %shared.name, dropped, "event queue overflowed, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Per-listener reader task: consume newline-terminated tokens until the
/// pipe closes.
async fn read_tokens(pool: String, listener: Arc<Listener>, stdout: BoxedReader) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line == READY_TOKEN => listener.set_state(ListenerState::Ready),
            Ok(Some(line)) => {
                debug!(pool = %pool, listener = %listener.name, token = %line, "ignoring unknown token");
            }
            Ok(None) | Err(_) => break,
        }
    }
    listener.set_state(ListenerState::Closed);
}

/// Render one event as a protocol line: the type tag, the RFC 3339
/// timestamp at second precision, then each `key:value` data entry in
/// key order, terminated by `\n`.
pub fn format_event_payload(event: &Event) -> String {
    let timestamp = event.timestamp.unwrap_or(DateTime::UNIX_EPOCH);
    let mut line = format!(
        "{} {}",
        event.event_type,
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
    );
    for (key, value) in &event.data {
        line.push(' ');
        line.push_str(key);
        line.push(':');
        line.push_str(value);
    }
    line.push('\n');
    line
}
