//! Event subscription table.
//!
//! Maps an event kind to an ordered list of listeners. Dispatch iterates
//! over a snapshot, so listeners may register or remove listeners (even
//! themselves) while being called. A panicking listener is logged and does
//! not stop delivery to the ones after it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::serial::transport::lock;

/// Event delivered to session listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// Decoded text received from the device.
    Data(String),
    Error(String),
    Disconnected,
}

impl SerialEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Error(_) => EventKind::Error,
            Self::Disconnected => EventKind::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Error,
    Disconnected,
}

/// Handle returned by [`EventTable::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&SerialEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventTable {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut map = lock(&self.listeners);
        match map.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(lid, _)| *lid != id);
                list.len() != before
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.listeners).get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: &SerialEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = lock(&self.listeners)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("Listener {:?} for {:?} panicked", id, event.kind());
            }
        }
    }
}
