//! The Clock & Timer Service contract and a reference `std`-based backend.
//!
//! The state machine never trusts `stop` to actually prevent a callback from
//! firing: every timer slot it owns carries a generation tag, and a stale
//! firing is silently dropped (see [`GenerationTimer`]). This mirrors the
//! split in the teacher's own Linux timer plumbing
//! (`bo-tie-linux::timeout::{Timeout, StopTimeout, TimeoutManager}`) between
//! a low-level OS timer primitive and the higher-level bookkeeping that
//! decides whether a firing still matters.

use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque handle returned by [`TimerSink::start`], passed back unchanged
/// to [`TimerSink::stop`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

/// A minimal scheduling primitive: start a one-shot timer, cancel it,
/// receive a callback. Supplied by the host embedding this crate.
pub trait TimerSink: Send + Sync {
    /// Schedules exactly one future invocation of `callback` at
    /// approximately `timeout_ms` after this call returns.
    fn start(&self, timeout_ms: u32, callback: Box<dyn FnOnce() + Send>) -> TimerHandle;

    /// Cancels a pending timer. A no-op if the timer already fired.
    fn stop(&self, handle: TimerHandle);
}

/// Tracks the "current" generation for one timer slot (Page or
/// PeriodicInquiry). Starting the timer bumps the tag and hands it to the
/// callback closure by value; cancelling also bumps it. A firing is honored
/// only if its captured tag still equals [`GenerationTimer::current_tag`]
/// when the callback runs.
#[derive(Debug, Default)]
pub struct GenerationTimer {
    tag: AtomicU64,
    handle: std::sync::Mutex<Option<TimerHandle>>,
}

impl GenerationTimer {
    pub fn new() -> Self {
        GenerationTimer {
            tag: AtomicU64::new(0),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn current_tag(&self) -> u64 {
        self.tag.load(Ordering::SeqCst)
    }

    fn next_tag(&self) -> u64 {
        // Wraps past 0 to 1, never reusing 0: 0 means "never armed".
        loop {
            let next = match self.tag.load(Ordering::SeqCst).checked_add(1) {
                Some(n) if n != 0 => n,
                _ => 1,
            };
            self.tag.store(next, Ordering::SeqCst);
            return next;
        }
    }

    /// Arms the timer, returning the tag the caller should close over and
    /// compare against `current_tag()` when the callback runs.
    pub fn arm(&self, sink: &dyn TimerSink, timeout_ms: u32, on_fire: impl FnOnce(u64) + Send + 'static) -> u64 {
        let tag = self.next_tag();
        let handle = sink.start(
            timeout_ms,
            Box::new(move || on_fire(tag)),
        );
        *self.handle.lock().unwrap() = Some(handle);
        tag
    }

    /// Disarms the timer: bumps the tag (so any in-flight firing is stale)
    /// and asks the sink to cancel the underlying timer.
    pub fn disarm(&self, sink: &dyn TimerSink) {
        self.tag.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            sink.stop(handle);
        }
    }

    /// Whether a firing carrying `tag` is still current.
    pub fn is_current(&self, tag: u64) -> bool {
        tag != 0 && tag == self.current_tag()
    }
}

/// A reference [`TimerSink`] backed by `std::thread`, useful for hosts with
/// no timer service of their own and for this crate's own tests. Stopping a
/// timer only prevents the callback from running if it has not yet fired;
/// it never attempts to kill the sleeping thread early.
#[cfg(feature = "std-timer")]
pub struct StdTimerSink {
    next_id: AtomicU64,
    cancelled: std::sync::Arc<std::sync::Mutex<std::collections::HashSet<u64>>>,
}

#[cfg(feature = "std-timer")]
impl StdTimerSink {
    pub fn new() -> Self {
        StdTimerSink {
            next_id: AtomicU64::new(1),
            cancelled: Default::default(),
        }
    }
}

#[cfg(feature = "std-timer")]
impl Default for StdTimerSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std-timer")]
impl TimerSink for StdTimerSink {
    fn start(&self, timeout_ms: u32, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = self.cancelled.clone();

        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
            let fired = !cancelled.lock().unwrap().remove(&id);
            if fired {
                callback();
            }
        });

        TimerHandle(id)
    }

    fn stop(&self, handle: TimerHandle) {
        self.cancelled.lock().unwrap().insert(handle.0);
    }
}
