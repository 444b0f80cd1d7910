// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    thread,
    time::Instant,
};

use coord_client::{CoordinationClient, CreateMode, EventKind, REQUEST_PREFIX};
use tracing::{debug, warn};

use crate::{
    cache::{CacheLock, CacheSnapshot},
    cancel::CancelToken,
    config::QueueConfig,
    handle::QueueHandle,
    Error, Result,
};

/// How long a blocking call should wait before giving up.
#[derive(Clone, Copy, Debug)]
pub enum Wait {
    /// Try exactly once; never block. Used internally by [`BaseQueue::peek`]
    /// and as the "no consumer showed up in time" arm of `peekElements`.
    Immediate,
    /// Block up to the given duration. Must be non-zero — spec §4.1 requires
    /// `peek(waitMillis)` to be "called with waitMillis > 0".
    For(std::time::Duration),
    /// Block indefinitely.
    Forever,
}

impl Wait {
    fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Immediate => Some(Instant::now()),
            Wait::For(d) => {
                debug_assert!(d > std::time::Duration::ZERO, "waitMillis must be > 0");
                Some(Instant::now() + d)
            },
            Wait::Forever => None,
        }
    }
}

/// The ordered FIFO work queue described in spec §4.1.
///
/// Cheap to clone: internally an `Arc`, so producers and the consumer can
/// each hold their own handle onto the same cache and the same background
/// watcher.
pub struct BaseQueue<C: CoordinationClient> {
    inner: Arc<Inner<C>>,
}

impl<C: CoordinationClient> Clone for BaseQueue<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct Inner<C: CoordinationClient> {
    client: C,
    config: QueueConfig,
    cache: CacheLock,
    metrics: Arc<queue_metrics::QueueMetrics>,
}

impl<C> BaseQueue<C>
where
    C: CoordinationClient + 'static,
    C::Watch: 'static,
{
    /// Construct a queue over `client`, performing the initial child-list
    /// fetch and installing the first watch (spec §4.1 "Cache coherence
    /// protocol", Initialization).
    pub fn new(
        client: C,
        config: QueueConfig,
        metrics: Arc<queue_metrics::QueueMetrics>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            client,
            config,
            cache: CacheLock::new(),
            metrics,
        });
        Arc::clone(&inner).refresh_cache()?;
        Ok(Self { inner })
    }

    /// The coordination client this queue was built over. Not part of the
    /// [`QueueHandle`] capability contract: `rrq` uses it directly to
    /// manage its own response nodes, a dependency it shares with `BaseQueue`
    /// rather than state it borrows from it.
    pub fn client(&self) -> &C {
        &self.inner.client
    }

    /// Non-blocking. Payload of the current head, or `None` (spec §4.1
    /// `peek()`).
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn peek(&self) -> Result<Option<Vec<u8>>> {
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), "peek");
        let result = self.inner.peek_once();
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    /// Blocks up to `wait` for an element to appear (spec §4.1
    /// `peek(waitMillis)`). `cancel` lets another thread abort the wait
    /// early (spec §5 "Cancellation / timeouts"); pass `&CancelToken::new()`
    /// if nothing will ever cancel this call.
    #[tracing::instrument(level = "debug", skip(self, cancel), err)]
    pub fn peek_wait(&self, wait: Wait, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let op = queue_metrics::wait_op_label("peek", wait_duration(wait));
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), &op);
        let result = Inner::blocking(&self.inner, wait, cancel, |inner| inner.peek_once());
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    /// Non-blocking. Atomically removes and returns the head, or `None`
    /// (spec §4.1 `poll()`).
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn poll(&self) -> Result<Option<Vec<u8>>> {
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), "poll");
        let result = self.inner.poll_once();
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    /// Blocks until it can remove and return a head (spec §4.1 `take()`).
    /// `cancel` lets another thread abort the wait early.
    #[tracing::instrument(level = "debug", skip(self, cancel), err)]
    pub fn take(&self, cancel: &CancelToken) -> Result<Vec<u8>> {
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), "take_wait_forever");
        let result = Inner::blocking(&self.inner, Wait::Forever, cancel, |inner| inner.poll_once())
            .map(|v| v.expect("an unbounded wait never times out"));
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    /// Like [`Self::poll`] but an empty queue is a
    /// [`Error::NoSuchElement`] rather than `None` (spec §4.1 `remove()`).
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn remove(&self) -> Result<Vec<u8>> {
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), "remove");
        let result = self.inner.poll_once().and_then(|v| v.ok_or(Error::NoSuchElement));
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    /// Delete the named children in batches of at most 1000, atomically
    /// per batch, falling back to tolerant per-node deletes on partial
    /// failure (spec §4.1 "Bulk removal").
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn remove_many(&self, names: &[String]) -> Result<()> {
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), "remove_many");
        let result = self.inner.remove_many(names);
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    /// Create a new request node carrying `payload`. Rejected with
    /// [`Error::QueueFull`] if a capacity bound is configured and would be
    /// exceeded (spec §4.1 "Offer with capacity bound").
    #[tracing::instrument(level = "debug", skip(self, payload), err)]
    pub fn offer(&self, payload: &[u8]) -> Result<String> {
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), "offer");
        let result = self.inner.offer(payload);
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }

    /// Up to `max` entries whose short name satisfies `accept`, waiting up
    /// to `wait` if nothing matches yet (spec §4.1 `peekElements`). `cancel`
    /// lets another thread abort the wait early.
    #[tracing::instrument(level = "debug", skip(self, cancel, accept), err)]
    pub fn peek_elements(
        &self,
        max: usize,
        wait: Wait,
        cancel: &CancelToken,
        accept: impl Fn(&str) -> bool,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let op = queue_metrics::wait_op_label("peek_elements", wait_duration(wait));
        let timer = self.inner.metrics.timer(self.inner.config.directory.as_str(), &op);
        let result = Inner::blocking(&self.inner, wait, cancel, |inner| {
            let found = inner.collect_matching(max, &accept)?;
            Ok(if found.is_empty() { None } else { Some(found) })
        })
        .map(|v| v.unwrap_or_default());
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.failure(),
        }
        result
    }
}

fn wait_duration(wait: Wait) -> Option<std::time::Duration> {
    match wait {
        Wait::Forever => None,
        Wait::Immediate => Some(std::time::Duration::ZERO),
        Wait::For(d) => Some(d),
    }
}

impl<C> QueueHandle for BaseQueue<C>
where
    C: CoordinationClient + 'static,
    C::Watch: 'static,
{
    fn directory(&self) -> &str {
        &self.inner.config.directory
    }

    fn snapshot(&self) -> CacheSnapshot {
        self.inner.cache.snapshot()
    }

    fn wait_for_change(&self, since_version: u64, deadline: Option<Instant>) -> CacheSnapshot {
        self.inner
            .cache
            .wait_for_change(since_version, deadline, self.inner.config.bounded_wait_slice)
    }

    fn fetch_children(&self) -> Result<CacheSnapshot> {
        Arc::clone(&self.inner).refresh_cache()
    }
}

impl<C> Inner<C>
where
    C: CoordinationClient + 'static,
    C::Watch: 'static,
{
    /// Re-fetch `D`'s children and replace the cache wholesale (spec §4.1
    /// "Invalidation"). Installs a fresh watch and spawns a thread to own
    /// its single firing only if no watch installed by an earlier call is
    /// still outstanding — spec §3 "Watch-scope invariant" caps this at one
    /// per instance, so a call that loses the race for the watch slot still
    /// refreshes the cache's *content*, it just doesn't renew the watch.
    fn refresh_cache(self: Arc<Self>) -> Result<CacheSnapshot> {
        let want_watch = self.cache.try_claim_watch_slot();
        let fetched = self.client.get_children(&self.config.directory, want_watch);
        let (names, watch) = match fetched {
            Ok(v) => v,
            Err(e) => {
                if want_watch {
                    self.cache.release_watch_slot();
                }
                return Err(e.into());
            },
        };
        let known: std::collections::BTreeSet<String> = names
            .into_iter()
            .filter(|n| n.starts_with(REQUEST_PREFIX))
            .collect();
        let len = known.len();
        self.cache.replace_and_notify(known);
        self.metrics.set_queue_length(&self.config.directory, len);

        match watch {
            Some(w) => {
                self.metrics.set_watcher_count(&self.config.directory, 1);
                let this = Arc::clone(&self);
                thread::spawn(move || this.watch_loop(w));
            },
            None => {
                if want_watch {
                    // Claimed the slot but the service didn't hand back a
                    // watch; release it so a later call can try again.
                    self.cache.release_watch_slot();
                }
                self.metrics.set_watcher_count(
                    &self.config.directory,
                    self.cache.watch_outstanding() as i64,
                );
            },
        }
        Ok(self.cache.snapshot())
    }

    /// Own one outstanding child-list watch until it fires with a real
    /// change, ignoring bare session-state events without consuming the
    /// watch (spec §5 "Watcher discipline"), then release the watch slot
    /// and re-fetch (which claims the slot again and spawns the next owning
    /// thread).
    fn watch_loop(self: Arc<Self>, watch: C::Watch) {
        loop {
            match watch.wait(None) {
                None => {
                    self.cache.release_watch_slot();
                    self.metrics.set_watcher_count(&self.config.directory, 0);
                    return;
                },
                Some(event) if event.kind == EventKind::SessionState => continue,
                Some(_) => {
                    self.cache.release_watch_slot();
                    if let Err(e) = self.refresh_cache() {
                        warn!(directory = %self.config.directory, error = %e, "watch-triggered refresh failed");
                    }
                    return;
                },
            }
        }
    }

    /// Select the smallest extant name in `K`, consult the service for its
    /// payload, and treat "no such node" as success-with-empty, dropping
    /// the stale head and retrying (spec §4.1 "Advisory reads").
    fn peek_once(&self) -> Result<Option<Vec<u8>>> {
        loop {
            let snapshot = self.cache.snapshot();
            let head = match snapshot.known.iter().next() {
                Some(h) => h.clone(),
                None => return Ok(None),
            };
            let path = format!("{}/{}", self.config.directory, head);
            match self.client.get_data(&path, false) {
                Ok((data, _)) => return Ok(Some(data)),
                Err(coord_client::Error::NoNode(_)) => {
                    self.cache.with_state(|s| {
                        s.known.remove(&head);
                    });
                    continue;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Like [`Self::peek_once`] but deletes the head it reads. The delete,
    /// not the preceding read, is the race's arbiter: if the delete loses
    /// to a concurrent consumer, this call does not return that payload
    /// (spec §8 invariant 3, "cache-advisory safety").
    fn poll_once(&self) -> Result<Option<Vec<u8>>> {
        loop {
            let snapshot = self.cache.snapshot();
            let head = match snapshot.known.iter().next() {
                Some(h) => h.clone(),
                None => return Ok(None),
            };
            let path = format!("{}/{}", self.config.directory, head);
            let data = match self.client.get_data(&path, false) {
                Ok((data, _)) => data,
                Err(coord_client::Error::NoNode(_)) => {
                    self.cache.with_state(|s| {
                        s.known.remove(&head);
                    });
                    continue;
                },
                Err(e) => return Err(e.into()),
            };
            match self.client.delete(&path) {
                Ok(()) => {
                    self.cache.with_state(|s| {
                        s.known.remove(&head);
                    });
                    return Ok(Some(data));
                },
                Err(coord_client::Error::NoNode(_)) => {
                    // Lost the race to another consumer; no payload for us.
                    self.cache.with_state(|s| {
                        s.known.remove(&head);
                    });
                    continue;
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn collect_matching(
        &self,
        max: usize,
        accept: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let snapshot = self.cache.snapshot();
        let mut results = Vec::new();
        for name in snapshot.known.iter() {
            if results.len() >= max {
                break;
            }
            if !accept(name.as_str()) {
                continue;
            }
            let path = format!("{}/{}", self.config.directory, name);
            match self.client.get_data(&path, false) {
                Ok((data, _)) => results.push((name.clone(), data)),
                Err(coord_client::Error::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(results)
    }

    /// Shared blocking discipline for `peek(wait)`, `take()` and
    /// `peekElements`: try the non-blocking `attempt`, and if it comes up
    /// empty, sleep on the cache-change condition in bounded slices until
    /// either the cache changes or the deadline passes (spec §4.1
    /// "Blocking discipline").
    ///
    /// A slice that elapses with no version change re-fetches the children
    /// directly rather than only trusting the outstanding watch: the watch
    /// that would otherwise wake this wait may have been dropped in transit,
    /// and the bounded slice is exactly what spec §8 invariant 8
    /// ("watch-loss survival") relies on for "eventual progress" — a fresh
    /// `refresh_cache` every slice is the recovery path, not just an
    /// absence of deadlock.
    ///
    /// `cancel` is checked once per slice (spec §5 "Cancellation /
    /// timeouts"): a cancelled wait aborts with [`Error::Cancelled`] within
    /// one `bounded_wait_slice` rather than running to its deadline.
    fn blocking<T>(
        this: &Arc<Self>,
        wait: Wait,
        cancel: &CancelToken,
        mut attempt: impl FnMut(&Self) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let deadline = wait.deadline();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let before = this.cache.snapshot().version;
            if let Some(v) = attempt(this)? {
                return Ok(Some(v));
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Ok(None);
                }
            }
            let slice_deadline = match deadline {
                Some(d) => d.min(Instant::now() + this.config.bounded_wait_slice),
                None => Instant::now() + this.config.bounded_wait_slice,
            };
            let after = this
                .cache
                .wait_for_change(before, Some(slice_deadline), this.config.bounded_wait_slice);
            if after.version == before {
                if let Err(e) = Arc::clone(this).refresh_cache() {
                    warn!(directory = %this.config.directory, error = %e, "fallback slice refresh failed");
                }
            }
        }
    }

    /// `offer`'s capacity check (spec §4.1 "Offer with capacity bound").
    ///
    /// The whole check-decide-write sequence runs under one cache-lock
    /// acquisition, with the remote `child_count` call made while the lock
    /// is held. The credit counter is guarded state (spec §5 "Lock"); two
    /// `offer`s racing on the same handle (`BaseQueue` is `Clone` precisely
    /// so producers can share one) must not both observe `credit <= 0`,
    /// both read the same stale remote count, and both decide to proceed —
    /// that would blow the documented ~1% slack per producer, not bound it.
    fn check_capacity(&self, max: NonZeroUsize) -> Result<()> {
        self.cache.with_state(|s| {
            if s.credit > 0 {
                s.credit -= 1;
                return Ok(());
            }
            let n = self.client.child_count(&self.config.directory)?;
            if n >= max.get() {
                return Err(Error::QueueFull);
            }
            let credit = ((max.get() - n) / 100) as i64;
            debug!(directory = %self.config.directory, credit, "recomputed capacity credit");
            s.credit = credit - 1;
            Ok(())
        })
    }

    fn offer(&self, payload: &[u8]) -> Result<String> {
        if let Some(max) = self.config.max_queue_size {
            self.check_capacity(max)?;
        }
        let prefix = format!("{}/{}", self.config.directory, REQUEST_PREFIX);
        Ok(self
            .client
            .create(&prefix, payload, CreateMode::PersistentSequential)?)
    }

    fn remove_many(&self, names: &[String]) -> Result<()> {
        for chunk in names.chunks(1000) {
            let paths: Vec<String> = chunk
                .iter()
                .map(|n| format!("{}/{}", self.config.directory, n))
                .collect();
            match self.client.multi_delete(&paths) {
                Ok(()) => {},
                Err(coord_client::Error::NoNode(_)) => {
                    for path in &paths {
                        match self.client.delete(path) {
                            Ok(()) | Err(coord_client::Error::NoNode(_)) => {},
                            Err(e) => return Err(e.into()),
                        }
                    }
                },
                Err(e) => return Err(e.into()),
            }
            self.cache.with_state(|s| {
                for name in chunk {
                    s.known.remove(name);
                }
            });
        }
        Ok(())
    }
}
