// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

use thiserror::Error;

/// Errors surfaced by [`crate::BaseQueue`] operations (spec §7).
///
/// Transient races, a node vanished out from under a cached name, or a
/// multi-delete failed because one sub-node was already gone, are not
/// represented here: they are resolved locally (collapsed into an empty
/// result, or retried per-node) and never reach the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// `offer` was rejected because a configured `max_queue_size` bound
    /// would be exceeded.
    #[error("queue is full")]
    QueueFull,

    /// `remove()` was called on an empty queue.
    #[error("no such element")]
    NoSuchElement,

    /// A blocking wait was interrupted before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// Any coordination-service failure other than "no such node",
    /// including session loss. The queue instance remains usable once the
    /// client reconnects and the watcher re-installs.
    #[error("coordination service error: {0}")]
    Infrastructure(#[from] coord_client::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
