// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! The capability contract `rrq` composes over, instead of reaching into
//! `BaseQueue`'s private cache and lock directly (spec §9 "Tight coupling
//! between base and extended queue").
//!
//! Deliberately narrow: directory path, a cache snapshot, the ability to
//! wait for the cache to change, and a way to force a fresh fetch. Access
//! to the coordination client itself is *not* part of this contract —
//! `rrq` creates its own response nodes against the client directly
//! (`BaseQueue::client`), which is a shared dependency, not private state.

use std::time::{Duration, Instant};

use crate::{cache::CacheSnapshot, Result};

pub trait QueueHandle: Send + Sync {
    /// The well-known path whose children are this queue's elements.
    fn directory(&self) -> &str;

    /// The known-children set and the version it was read at.
    fn snapshot(&self) -> CacheSnapshot;

    /// Block until the cache version differs from `since`, or `deadline`
    /// passes (`None` deadline means forever). Returns the current
    /// snapshot either way.
    fn wait_for_change(&self, since_version: u64, deadline: Option<Instant>) -> CacheSnapshot;

    /// Force a fresh child-list fetch, replacing the cache and
    /// (re-)installing the watch.
    fn fetch_children(&self) -> Result<CacheSnapshot>;
}

/// How long a blocking wait should keep slicing before giving up and
/// re-checking — exposed so `rrq` can reuse the same bounded-wakeup
/// discipline `BaseQueue` uses internally (spec §4.1 "Blocking
/// discipline").
pub const DEFAULT_BOUNDED_WAIT_SLICE: Duration = Duration::from_millis(500);
