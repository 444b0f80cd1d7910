// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

use thiserror::Error;

/// Errors surfaced by [`crate::RrqQueue`] operations (spec §7).
///
/// A timeout on `offerAndWait` is deliberately not represented here: spec
/// §7 "Timeout on offerAndWait" calls it out as not an error, just an event
/// whose bytes may be empty.
#[derive(Debug, Error)]
pub enum Error {
    /// An event id passed to `removeWithResponse` did not carry a
    /// recognisable sequence suffix.
    #[error("'{0}' is not a request node id")]
    NotARequestId(String),

    /// Any coordination-service failure other than "no such node".
    #[error("coordination service error: {0}")]
    Infrastructure(#[from] coord_client::Error),

    /// The underlying base queue rejected an operation (for instance a
    /// capacity-bound `offer`).
    #[error(transparent)]
    Queue(#[from] base_queue::Error),

    /// `offerAndWait`'s wait was aborted by a caller-supplied
    /// [`base_queue::CancelToken`] before a reply arrived or the deadline
    /// passed.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
