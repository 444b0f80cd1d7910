// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

/// Node creation modes a coordination service must support (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives until explicitly deleted.
    Persistent,
    /// Survives until explicitly deleted; name gets a sequence suffix.
    PersistentSequential,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
    /// Deleted automatically when the creating session ends; name gets a
    /// sequence suffix.
    EphemeralSequential,
}

/// The kind of change a watch fired for (§6, §9 "Watcher callback
/// polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The watched node's children changed.
    ChildrenChanged,
    /// The watched node's data changed.
    DataChanged,
    /// The watched node was deleted.
    NodeDeleted,
    /// A bare session-state transition; not a content change. Watchers
    /// must ignore this without re-fetching (§5 "Watcher discipline").
    SessionState,
}

/// The state of the client's session with the coordination service, carried
/// alongside every watch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

/// What a fired watch delivers: event kind, affected path, and session
/// state (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
    pub session: SessionState,
}

impl WatchedEvent {
    /// An event carrying no information, used where spec §4.2
    /// "offerAndWait" returns a timeout with "a watched event that may be
    /// empty".
    pub fn none() -> Self {
        Self {
            kind: EventKind::SessionState,
            path: String::new(),
            session: SessionState::Connected,
        }
    }

    pub fn is_none(&self) -> bool {
        self.path.is_empty() && self.kind == EventKind::SessionState
    }
}
