//! In-memory set of event ids currently being dispatched.
//!
//! The store marks an event `InProgress` before dispatch, but `InProgress`
//! also covers events orphaned by a crash, which must be dispatched again.
//! This set tells the two apart: an id is held here only while this process
//! is actually working on it.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use crate::models::EventId;

/// Shared set of in-flight event ids.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<EventId>>>,
}

impl InFlight {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`, or returns `None` if it is already claimed.
    pub fn try_acquire(&self, id: &EventId) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if ids.insert(id.clone()) {
            Some(InFlightGuard { ids: self.ids.clone(), id: id.clone() })
        } else {
            None
        }
    }

    /// True while `id` is claimed.
    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).contains(id)
    }

    /// Number of claimed ids.
    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claim on one id, released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<EventId>>>,
    id: EventId,
}

impl InFlightGuard {
    /// The claimed id.
    pub fn id(&self) -> &EventId {
        &self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}
