// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

use thiserror::Error;

/// Errors a [`crate::CoordinationClient`] can report.
///
/// Every caller in this workspace treats [`Error::NoNode`] specially — it
/// collapses into "empty" or is retried locally, never propagated as-is
/// (spec §7). Everything else is an infrastructure failure and propagates.
#[derive(Debug, Error)]
pub enum Error {
    /// No node exists at the given path.
    #[error("no such node: {0}")]
    NoNode(String),

    /// A write was rejected because the caller's expected version did not
    /// match the node's current version.
    #[error("version mismatch at {0}")]
    BadVersion(String),

    /// Any other failure of the coordination service, including session
    /// loss. The queue remains usable once the client reconnects.
    #[error("coordination service error: {0}")]
    Other(String),
}
