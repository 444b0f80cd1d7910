// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

use std::time::Duration;

const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for a [`crate::RrqQueue`].
#[derive(Clone, Debug)]
pub struct RrqConfig {
    /// Safety-net polling interval for `awaitPendingResponses`, used only
    /// if the count-down condition's notification is somehow missed (spec
    /// §9 "Shutdown drain via busy sleep").
    pub drain_poll_interval: Duration,
}

impl Default for RrqConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
        }
    }
}

impl RrqConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }
}
