//! Periodic tick publisher.
//!
//! Emits `TICK_5`, `TICK_60`, and `TICK_3600` on independent timers.
//! The timestamp each subscriber sees is the firing instant (stamped at
//! publish).  [`Ticker::stop`] is synchronous: it signals the emitter
//! task and waits for it to exit, so no tick is published after it
//! returns.

use crate::bus::EventBus;
use crate::event::{Event, EventType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

pub struct Ticker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Spawn the emitter task.  Must be called from within a tokio
    /// runtime.
    pub fn spawn(bus: Arc<EventBus>) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tick_5 = period(Duration::from_secs(5));
            let mut tick_60 = period(Duration::from_secs(60));
            let mut tick_3600 = period(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tick_5.tick() => bus.publish(Event::new(EventType::Tick5)),
                    _ = tick_60.tick() => bus.publish(Event::new(EventType::Tick60)),
                    _ = tick_3600.tick() => bus.publish(Event::new(EventType::Tick3600)),
                }
            }
        });
        Self { stop_tx, handle }
    }

    /// Stop the emitter and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// An interval whose first tick fires one full period from now, not
/// immediately.
fn period(every: Duration) -> tokio::time::Interval {
    interval_at(Instant::now() + every, every)
}
