//! Timer ownership for the sync core.
//!
//! Every delayed or periodic action (reconnect backoff, health check, cache
//! sweep) goes through one [`Scheduler`], keyed by [`TimerId`]. That keeps
//! cancellation in one place: teardown calls [`Scheduler::cancel_all`] and no
//! stale timer can fire afterwards.
//!
//! Timers run on `tokio::time`, so tests drive them with a paused clock
//! (`#[tokio::test(start_paused = true)]` + `tokio::time::advance`).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Timer slots. At most one timer per id is scheduled at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Delayed reconnect after a failed ping.
    Reconnect,
    /// Periodic liveness ping while connected.
    HealthCheck,
    /// Periodic stale-entry sweep.
    Sweep,
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    slots: HashMap<TimerId, Slot>,
    next_generation: u64,
}

impl Timers {
    /// Release the slot if it still belongs to `generation`.
    fn release(&mut self, id: TimerId, generation: u64) -> bool {
        match self.slots.get(&id) {
            Some(slot) if slot.generation == generation => {
                self.slots.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// Owns every timer of the sync core.
#[derive(Clone, Default)]
pub struct Scheduler {
    timers: Arc<Mutex<Timers>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` once after `delay`, replacing any timer already in `id`.
    ///
    /// The slot is released right before `action` starts, so the action may
    /// schedule the same id again (reconnect chains do).
    pub fn schedule_once<F>(&self, id: TimerId, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timers = Arc::clone(&self.timers);
        // The deadline counts from now, not from the task's first poll.
        let deadline = tokio::time::Instant::now() + delay;
        // Hold the lock across spawn so the task cannot release a slot that
        // has not been inserted yet.
        let mut guard = self.timers.lock();
        let generation = guard.next_generation;
        guard.next_generation += 1;

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if !timers.lock().release(id, generation) {
                return;
            }
            action.await;
        });

        if let Some(old) = guard.slots.insert(id, Slot { generation, handle }) {
            old.handle.abort();
        }
        tracing::trace!(?id, delay_ms = delay.as_millis() as u64, "Scheduled one-shot timer");
    }

    /// Run `tick()` every `period` (first run after one full period) until
    /// cancelled, replacing any timer already in `id`.
    pub fn schedule_every<F, Fut>(&self, id: TimerId, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let start = tokio::time::Instant::now() + period;
        let mut guard = self.timers.lock();
        let generation = guard.next_generation;
        guard.next_generation += 1;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });

        if let Some(old) = guard.slots.insert(id, Slot { generation, handle }) {
            old.handle.abort();
        }
        tracing::trace!(?id, period_ms = period.as_millis() as u64, "Scheduled interval timer");
    }

    /// Cancel the timer in `id`. Returns whether one was pending.
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.timers.lock().slots.remove(&id) {
            Some(slot) => {
                slot.handle.abort();
                tracing::trace!(?id, "Cancelled timer");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.timers
            .lock()
            .slots
            .get(&id)
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Cancel every timer (teardown).
    pub fn cancel_all(&self) {
        let slots: Vec<Slot> = self.timers.lock().slots.drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.handle.abort();
        }
    }
}
