// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! An in-memory [`CoordinationClient`] fake, for tests only.
//!
//! Mirrors the handful of primitives `base-queue` and `rrq` actually use: a
//! flat path → bytes store, per-parent sequence counters, and one-shot
//! watches delivered over a channel. Nodes created with an ephemeral mode
//! are tied to whichever [`MemClient`] handle created them — call
//! [`MemClient::new_session`] to get an independent handle sharing the same
//! backing store, and [`MemClient::end_session`] to simulate that producer's
//! connection dropping.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    CoordinationClient, CreateMode, Error, EventKind, Result, SessionState, WatchedEvent,
};

type SessionId = u64;

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
}

#[derive(Default)]
struct StoreState {
    nodes: HashMap<String, Node>,
    seq_counters: HashMap<String, u64>,
    child_watchers: HashMap<String, Vec<mpsc::Sender<WatchedEvent>>>,
    data_watchers: HashMap<String, Vec<mpsc::Sender<WatchedEvent>>>,
}

struct Store {
    state: Mutex<StoreState>,
    next_session: AtomicU64,
}

/// A handle onto an in-memory coordination service, standing in for one
/// client session.
#[derive(Clone)]
pub struct MemClient {
    store: Arc<Store>,
    session: SessionId,
}

/// A pending one-shot watch registered against the in-memory store.
pub struct MemWatch {
    rx: mpsc::Receiver<WatchedEvent>,
}

impl crate::Watch for MemWatch {
    fn wait(&self, deadline: Option<Duration>) -> Option<WatchedEvent> {
        match deadline {
            None => self.rx.recv().ok(),
            Some(d) => self.rx.recv_timeout(d).ok(),
        }
    }
}

impl Default for MemClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemClient {
    /// A fresh, empty store with a single root session (id 0).
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store {
                state: Mutex::new(StoreState::default()),
                next_session: AtomicU64::new(1),
            }),
            session: 0,
        }
    }

    /// A new handle onto the same store, representing an independent
    /// client session. Ephemeral nodes created through the returned handle
    /// are owned by it, not by `self`.
    pub fn new_session(&self) -> Self {
        let session = self.store.next_session.fetch_add(1, Ordering::Relaxed);
        Self {
            store: self.store.clone(),
            session,
        }
    }

    /// Simulate this session's connection ending: every ephemeral node it
    /// owns is deleted, firing delete watches and child-list watches on
    /// their parents.
    pub fn end_session(&self) {
        let mut state = self.store.state.lock().unwrap();
        let dead: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(self.session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in dead {
            remove_node(&mut state, &path);
        }
    }

    /// Test-harness hook for spec §8 invariant 8 ("watch-loss survival"):
    /// drop a pending child-list watch on `parent` without firing it, as if
    /// the transport silently lost it.
    pub fn drop_child_watch(&self, parent: &str) {
        let mut state = self.store.state.lock().unwrap();
        if let Some(ws) = state.child_watchers.get_mut(parent) {
            ws.clear();
        }
    }

    /// Test-harness hook for spec §5 "Watcher discipline": deliver a bare
    /// session-state event to every watch currently registered on
    /// `parent`'s child list, without consuming those registrations. A real
    /// coordination service can report a connection blip on an outstanding
    /// watch without that watch having actually fired; callers must ignore
    /// the event and keep waiting on the same watch.
    pub fn inject_session_state(&self, parent: &str, session: SessionState) {
        let state = self.store.state.lock().unwrap();
        if let Some(watchers) = state.child_watchers.get(parent) {
            let event = WatchedEvent {
                kind: EventKind::SessionState,
                path: parent.to_string(),
                session,
            };
            for w in watchers {
                let _ = w.send(event.clone());
            }
        }
    }

    fn parent_of(path: &str) -> &str {
        path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
    }
}

fn fire_children(state: &mut StoreState, parent: &str) {
    if let Some(watchers) = state.child_watchers.remove(parent) {
        let event = WatchedEvent {
            kind: EventKind::ChildrenChanged,
            path: parent.to_string(),
            session: SessionState::Connected,
        };
        for w in watchers {
            let _ = w.send(event.clone());
        }
    }
}

fn remove_node(state: &mut StoreState, path: &str) {
    if state.nodes.remove(path).is_none() {
        return;
    }
    if let Some(watchers) = state.data_watchers.remove(path) {
        let event = WatchedEvent {
            kind: EventKind::NodeDeleted,
            path: path.to_string(),
            session: SessionState::Connected,
        };
        for w in watchers {
            let _ = w.send(event.clone());
        }
    }
    fire_children(state, MemClient::parent_of(path));
}

impl CoordinationClient for MemClient {
    type Watch = MemWatch;

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let mut state = self.store.state.lock().unwrap();
        let full_path = match mode {
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential => {
                let counter = state.seq_counters.entry(path.to_string()).or_insert(0);
                let seq = *counter;
                *counter += 1;
                format!("{}{:010}", path, seq)
            },
        };
        let ephemeral_owner = matches!(
            mode,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential
        )
        .then_some(self.session);
        state.nodes.insert(
            full_path.clone(),
            Node {
                data: data.to_vec(),
                ephemeral_owner,
            },
        );
        let parent = MemClient::parent_of(&full_path).to_string();
        fire_children(&mut state, &parent);
        Ok(full_path)
    }

    fn get_children(&self, path: &str, watch: bool) -> Result<(Vec<String>, Option<Self::Watch>)> {
        let mut state = self.store.state.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let names: Vec<String> = state
            .nodes
            .keys()
            .filter_map(|p| p.strip_prefix(prefix.as_str()))
            .filter(|short| !short.is_empty() && !short.contains('/'))
            .map(str::to_string)
            .collect();

        let watch_handle = if watch {
            let (tx, rx) = mpsc::channel();
            state
                .child_watchers
                .entry(path.to_string())
                .or_default()
                .push(tx);
            Some(MemWatch { rx })
        } else {
            None
        };
        Ok((names, watch_handle))
    }

    fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Option<Self::Watch>)> {
        let mut state = self.store.state.lock().unwrap();
        let data = state
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        let watch_handle = if watch {
            let (tx, rx) = mpsc::channel();
            state
                .data_watchers
                .entry(path.to_string())
                .or_default()
                .push(tx);
            Some(MemWatch { rx })
        } else {
            None
        };
        Ok((data, watch_handle))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.store.state.lock().unwrap();
        match state.nodes.get_mut(path) {
            Some(n) => n.data = data.to_vec(),
            None => return Err(Error::NoNode(path.to_string())),
        }
        if let Some(watchers) = state.data_watchers.remove(path) {
            let event = WatchedEvent {
                kind: EventKind::DataChanged,
                path: path.to_string(),
                session: SessionState::Connected,
            };
            for w in watchers {
                let _ = w.send(event.clone());
            }
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.store.state.lock().unwrap();
        if !state.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        remove_node(&mut state, path);
        Ok(())
    }

    fn multi_delete(&self, paths: &[String]) -> Result<()> {
        let mut state = self.store.state.lock().unwrap();
        if let Some(missing) = paths.iter().find(|p| !state.nodes.contains_key(p.as_str())) {
            return Err(Error::NoNode(missing.clone()));
        }
        for p in paths {
            remove_node(&mut state, p);
        }
        Ok(())
    }

    fn child_count(&self, path: &str) -> Result<usize> {
        let (names, _) = self.get_children(path, false)?;
        Ok(names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_suffixes_are_monotonic_and_zero_padded() {
        let client = MemClient::new();
        let a = client.create("/q/qn-", b"a", CreateMode::PersistentSequential).unwrap();
        let b = client.create("/q/qn-", b"b", CreateMode::PersistentSequential).unwrap();
        assert!(a < b, "lexical order must equal numeric order: {a} vs {b}");
    }

    #[test]
    fn ephemeral_node_vanishes_when_session_ends() {
        let root = MemClient::new();
        let producer = root.new_session();
        let path = producer
            .create("/q/qnr-", b"", CreateMode::EphemeralSequential)
            .unwrap();
        assert!(root.get_data(&path, false).is_ok());
        producer.end_session();
        assert!(matches!(root.get_data(&path, false), Err(Error::NoNode(_))));
    }
}
