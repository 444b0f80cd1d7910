// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! The "pending responses" counter behind `awaitPendingResponses` (spec
//! §4.2 "Drain-on-shutdown", §9 "Shutdown drain via busy sleep").
//!
//! The source spins in 250 ms sleeps until the count reaches zero. Spec §9
//! asks for a count-down condition signaled from the decrement path
//! instead, with the busy-sleep interval kept only as a safety net against
//! a missed notification.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

pub(crate) struct PendingResponses {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Held for the lifetime of one in-flight `offerAndWait` call. Decrements
/// the counter on every exit path, including early returns on error, by
/// virtue of running on drop.
pub(crate) struct PendingGuard {
    owner: Arc<PendingResponses>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut count = self.owner.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.owner.drained.notify_all();
        }
    }
}

impl PendingResponses {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        })
    }

    pub(crate) fn enter(this: &Arc<Self>) -> PendingGuard {
        *this.count.lock().unwrap() += 1;
        PendingGuard {
            owner: Arc::clone(this),
        }
    }

    /// Block until the counter reaches zero, re-checking every
    /// `poll_interval` in case a notification was missed.
    pub(crate) fn await_drained(&self, poll_interval: Duration) {
        let mut guard = self.count.lock().unwrap();
        while *guard > 0 {
            let (next_guard, _timed_out) = self.drained.wait_timeout(guard, poll_interval).unwrap();
            guard = next_guard;
        }
    }
}
