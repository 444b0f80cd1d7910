// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! A single-shot event latch (spec §4.2 "Latch watcher"), the rendezvous
//! half of the thread-spawn-plus-Condvar pattern `base_queue::queue`'s
//! `watch_loop` uses for the child-list half.
//!
//! A background thread owns the raw [`coord_client::Watch`] and drives it
//! into the latch; [`EventLatch::await_event`] is the blocking read side.
//! Bare session-state events are consumed by the driver and never reach the
//! latch, matching spec §5 "Watcher discipline".

use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use base_queue::CancelToken;
use coord_client::{EventKind, Watch, WatchedEvent};

/// The result of [`EventLatch::await_event`].
pub(crate) enum AwaitOutcome {
    Fired(WatchedEvent),
    TimedOut,
    Cancelled,
}

pub(crate) struct EventLatch {
    state: Mutex<Option<WatchedEvent>>,
    fired: Condvar,
}

impl EventLatch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            fired: Condvar::new(),
        })
    }

    fn fire(&self, event: WatchedEvent) {
        let mut guard = self.state.lock().unwrap();
        if guard.is_none() {
            *guard = Some(event);
            drop(guard);
            self.fired.notify_all();
        }
    }

    /// Spawn the thread that owns `watch` until it yields a real (non
    /// session-state) event or the watch itself expires.
    pub(crate) fn spawn_driver<W: Watch + 'static>(this: &Arc<Self>, watch: W) {
        let this = Arc::clone(this);
        thread::spawn(move || loop {
            match watch.wait(None) {
                None => return,
                Some(event) if event.kind == EventKind::SessionState => continue,
                Some(event) => {
                    this.fire(event);
                    return;
                },
            }
        });
    }

    /// Block until a real event fires, `deadline` passes, or `cancel` is
    /// signalled — checked once per `slice`, the same bounded-wakeup
    /// discipline `base_queue`'s cache lock uses (spec §5 "Cancellation /
    /// timeouts"). A timeout matches spec §4.2 step 5's "then re-read".
    pub(crate) fn await_event(
        &self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
        slice: Duration,
    ) -> AwaitOutcome {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(event) = guard.as_ref() {
                return AwaitOutcome::Fired(event.clone());
            }
            if cancel.is_cancelled() {
                return AwaitOutcome::Cancelled;
            }
            let remaining = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(r) if r > Duration::ZERO => r.min(slice),
                    _ => return AwaitOutcome::TimedOut,
                },
                None => slice,
            };
            let (next_guard, _timed_out) = self.fired.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
        }
    }
}
