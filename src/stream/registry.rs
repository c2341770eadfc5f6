//! Process-wide registry of live shared streams
//!
//! Read-only introspection for diagnostics. Entries hold weak references so
//! the registry never keeps a transport alive.

use super::Inner;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

lazy_static! {
    pub(crate) static ref REGISTRY: StreamRegistry = StreamRegistry::new();
}

/// Snapshot of one live stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Registry id
    pub id: u64,
    /// Current reference count
    pub refs: usize,
    /// Remote address of the transport, when known
    pub peer: Option<SocketAddr>,
}

pub(crate) struct StreamRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Weak<Inner>>>,
}

impl StreamRegistry {
    fn new() -> Self {
        StreamRegistry {
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, inner: &Arc<Inner>) {
        self.live.lock().insert(inner.id, Arc::downgrade(inner));
    }

    pub(crate) fn remove(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.live.lock().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<StreamInfo> {
        // Upgrade outside the lock: dropping the last strong reference runs
        // Inner::drop, which takes the lock again.
        let entries: Vec<Weak<Inner>> = self.live.lock().values().cloned().collect();
        let mut infos: Vec<StreamInfo> = entries
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| StreamInfo {
                id: inner.id,
                refs: *inner.refs.lock(),
                peer: inner.peer,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

/// Number of streams currently registered
pub fn live_count() -> usize {
    REGISTRY.len()
}

/// Snapshot of all registered streams ordered by id
pub fn live_streams() -> Vec<StreamInfo> {
    REGISTRY.snapshot()
}
