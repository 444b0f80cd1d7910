// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! Cooperative cancellation for blocking queue operations (spec §5
//! "Cancellation / timeouts": "every blocking operation accepts either an
//! interruptible cancellation signal or an explicit millisecond deadline";
//! §7 "Cancellation/interruption").
//!
//! The source this queue is modelled on cancels a blocking wait by
//! interrupting the thread it runs on. `std::thread` has no such primitive,
//! so this is a cheap shared flag instead, checked once per bounded-wait
//! slice — the same granularity [`crate::cache::CacheLock::wait_for_change`]
//! already uses to survive a dropped watch notification, so a cancellation
//! is observed within one slice rather than only at the next deadline.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A cancellation signal shared between the caller of a blocking operation
/// and whoever wants to abort it early. Cheap to clone; all clones observe
/// the same signal.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation to every blocking operation holding a clone of
    /// this token. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_through_a_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
