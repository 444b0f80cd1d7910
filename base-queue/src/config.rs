// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

use std::{num::NonZeroUsize, time::Duration};

const DEFAULT_BOUNDED_WAIT: Duration = Duration::from_millis(500);

/// Configuration for a [`crate::BaseQueue`].
///
/// The recommended approach is `QueueConfig::new(directory)` followed by
/// `with_max_queue_size` if a bound is wanted; `bounded_wait_slice` rarely
/// needs overriding.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// The well-known path on the coordination service whose children are
    /// this queue's elements (`D` in spec §3).
    pub directory: String,

    /// `M` in spec §4.1 "Offer with capacity bound". `None` means
    /// unbounded.
    pub max_queue_size: Option<NonZeroUsize>,

    /// How long `peek(wait)`/`take()` block on the cache-change condition
    /// per slice before re-checking (spec §4.1 "Blocking discipline").
    /// Bounded so transport glitches that drop a watch notification cannot
    /// deadlock a waiter.
    pub bounded_wait_slice: Duration,
}

impl QueueConfig {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            max_queue_size: None,
            bounded_wait_slice: DEFAULT_BOUNDED_WAIT,
        }
    }

    pub fn with_max_queue_size(mut self, max: NonZeroUsize) -> Self {
        self.max_queue_size = Some(max);
        self
    }

    pub fn with_bounded_wait_slice(mut self, slice: Duration) -> Self {
        self.bounded_wait_slice = slice;
        self
    }
}
