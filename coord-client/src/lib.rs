// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! The coordination-service contract the work queue is built on top of.
//!
//! This crate does not implement a real coordination service (a
//! ZooKeeper-like hierarchical store with ordered ephemeral nodes, watches,
//! atomic multi-ops and optimistic versioning) — that is an external
//! collaborator, assumed to exist. What lives here is the *shape* of that
//! collaborator: the [`CoordinationClient`] trait plus the handful of value
//! types every caller needs to agree on (§6 of the queue design).
//!
//! An in-memory fake implementing the trait lives in [`mem`], behind the
//! `test-fixtures` feature, so the rest of the workspace has something to
//! run against without a live service.

mod error;
mod types;

pub use error::Error;
pub use types::{CreateMode, EventKind, SessionState, WatchedEvent};

#[cfg(feature = "test-fixtures")]
pub mod mem;

/// Result type returned by every [`CoordinationClient`] operation.
pub type Result<T> = std::result::Result<T, Error>;

/// A one-shot watch registration. Firing it is the service's job; the only
/// thing a caller does with the receiving end is block on it (see
/// [`CoordinationClient::get_children`] and [`CoordinationClient::get_data`]).
pub trait Watch: Send {
    /// Block until the watch fires, or the deadline passes.
    ///
    /// `None` deadline means wait forever. Returns `None` on timeout.
    fn wait(&self, deadline: Option<std::time::Duration>) -> Option<WatchedEvent>;
}

/// The subset of a ZooKeeper-like coordination service's primitives the
/// queue needs. §6 "Coordination-service contract required".
pub trait CoordinationClient: Send + Sync {
    /// The watch handle type this implementation hands back.
    type Watch: Watch;

    /// Create a node at `path` with the given `mode` and `data`.
    ///
    /// For the two sequential modes, the service appends a zero-padded,
    /// strictly monotonic (per parent) sequence suffix to `path` and
    /// returns the full resulting name.
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// List the children of `path`. If `watch` is `true`, install a
    /// one-shot watch that fires on the next child-list change.
    fn get_children(&self, path: &str, watch: bool) -> Result<(Vec<String>, Option<Self::Watch>)>;

    /// Read the data at `path`. If `watch` is `true`, install a one-shot
    /// watch that fires on the next data change (or deletion) of `path`.
    fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Option<Self::Watch>)>;

    /// Overwrite the data at `path`, version-wildcard.
    fn set_data(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete `path`, version-wildcard. `Err(Error::NoNode(_))` if it does
    /// not exist.
    fn delete(&self, path: &str) -> Result<()>;

    /// Delete every path in `paths` as a single all-or-nothing batch.
    /// `Err(Error::NoNode(_))` if *any* sub-op targets a missing node —
    /// the whole batch is rejected, per §6.
    fn multi_delete(&self, paths: &[String]) -> Result<()>;

    /// Number of children of `path`, without transferring their names or
    /// data. Used by the capacity check in `offer` (§4.1).
    fn child_count(&self, path: &str) -> Result<usize>;
}

/// Identifiers shared between the base queue and the request/response
/// queue: the request-node and response-node name prefixes (§3, §6).
pub const REQUEST_PREFIX: &str = "qn-";
pub const RESPONSE_PREFIX: &str = "qnr-";

/// Extract the sequence suffix shared by a paired `qn-<S>` / `qnr-<S>` node,
/// i.e. the part of the short name after its prefix.
pub fn suffix_of(short_name: &str) -> Option<&str> {
    short_name
        .strip_prefix(REQUEST_PREFIX)
        .or_else(|| short_name.strip_prefix(RESPONSE_PREFIX))
}
