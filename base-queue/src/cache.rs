// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! The local advisory cache `K` (spec §3, §4.1) and the lock that guards it.
//!
//! The source this queue is modelled on detects "something changed" by
//! comparing object identity of the cache container across a wait. Spec
//! §9 "Cache-identity signaling" asks for an explicit version counter
//! instead; that's what [`CacheState::version`] is.

use std::{
    collections::BTreeSet,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// A snapshot of the known-children set at some point in time, paired with
/// the version it was read at. Two snapshots with the same version are
/// guaranteed to hold the same `known` set; the inverse is not promised
/// (spec only requires version to change on every *replacement*, not that
/// every bump changes the content).
#[derive(Clone, Debug, Default)]
pub struct CacheSnapshot {
    pub known: BTreeSet<String>,
    pub version: u64,
}

/// Everything the cache lock (spec §5 "Lock") guards: the known-children
/// set, its version, and the capacity credit counter.
pub(crate) struct CacheState {
    pub(crate) known: BTreeSet<String>,
    pub(crate) version: u64,
    /// Local permit count for the capacity-bound fast path (spec §4.1
    /// "Offer with capacity bound"). Only meaningful when a
    /// `max_queue_size` is configured.
    pub(crate) credit: i64,
    /// Whether a child-list watch is currently outstanding. Drives the
    /// watcher-count gauge (spec §6); at most one per instance (spec §3
    /// "Watch-scope invariant").
    pub(crate) watch_outstanding: bool,
}

impl CacheState {
    pub(crate) fn new() -> Self {
        Self {
            known: BTreeSet::new(),
            version: 0,
            credit: 0,
            watch_outstanding: false,
        }
    }

    /// Replace `known` wholesale and bump the version. Never merges: spec
    /// §4.1 "Invalidation" is explicit that replacement, not merge, is how
    /// waiters detect that something happened.
    pub(crate) fn replace(&mut self, known: BTreeSet<String>) {
        self.known = known;
        self.version += 1;
    }

    pub(crate) fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            known: self.known.clone(),
            version: self.version,
        }
    }
}

/// The cache lock plus its change condition, bundled so `BaseQueue` and
/// `rrq`'s capability contract can share a single owning type.
pub(crate) struct CacheLock {
    state: Mutex<CacheState>,
    changed: Condvar,
}

impl CacheLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::new()),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        f(&mut guard)
    }

    pub(crate) fn snapshot(&self) -> CacheSnapshot {
        self.state.lock().unwrap().snapshot()
    }

    /// Claim the "install a watch" slot. Returns `true` if the caller
    /// should request a new watch from the coordination service; `false`
    /// if a watch installed by an earlier call is still outstanding (spec
    /// §3 "Watch-scope invariant": at most one per instance). A caller that
    /// claims the slot but fails to actually install a watch must release
    /// it with [`Self::release_watch_slot`].
    pub(crate) fn try_claim_watch_slot(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        if guard.watch_outstanding {
            false
        } else {
            guard.watch_outstanding = true;
            true
        }
    }

    /// Release the "install a watch" slot so a later call may claim it.
    /// Called when the previously claimed watch fires (spec §5 "Watcher
    /// discipline": a watch is consumed exactly by its one firing) or when
    /// a claimed watch was never actually installed.
    pub(crate) fn release_watch_slot(&self) {
        self.state.lock().unwrap().watch_outstanding = false;
    }

    pub(crate) fn watch_outstanding(&self) -> bool {
        self.state.lock().unwrap().watch_outstanding
    }

    /// Replace the known set and wake every waiter blocked in
    /// [`Self::wait_for_change`].
    pub(crate) fn replace_and_notify(&self, known: BTreeSet<String>) {
        {
            let mut guard = self.state.lock().unwrap();
            guard.replace(known);
        }
        self.changed.notify_all();
    }

    /// Block until the version differs from `since`, or `deadline` passes,
    /// whichever comes first. Returns the current snapshot either way;
    /// callers re-check their non-blocking condition regardless (spec
    /// §4.1 "Blocking discipline" step 4: spurious wakeups are harmless).
    ///
    /// Waits in slices of at most `slice` so a dropped watch notification
    /// cannot wedge the caller forever (spec §4.1, §8 invariant 8).
    pub(crate) fn wait_for_change(
        &self,
        since: u64,
        deadline: Option<Instant>,
        slice: Duration,
    ) -> CacheSnapshot {
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.version != since {
                return guard.snapshot();
            }
            let remaining = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(r) if r > Duration::ZERO => r.min(slice),
                    _ => return guard.snapshot(),
                },
                None => slice,
            };
            let (next_guard, _timeout) = self.changed.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
        }
    }
}
