//! Lazy-invalidation containers over storage-backed ids.
//!
//! An id expires the moment its record is discarded from storage. Containers
//! holding such ids must not serve stale keys, yet they cannot walk
//! themselves on every discard. Instead, validity is tested lazily on every
//! observation; keys seen expired are recorded and physically removed at the
//! next mutable access. Shared iteration structurally excludes mutation, so
//! deferred removals cannot invalidate an open iterator — the container
//! heals at the next unlocked moment.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::storage::StoreId;

/// An ordered id set with lazy expiry.
///
/// Every observing operation takes the validity test as an argument, so the
/// set itself stays free of storage references.
#[derive(Debug, Default)]
pub struct PerishableSet {
    ids: BTreeSet<StoreId>,
    expired: Mutex<Vec<StoreId>>,
}

impl PerishableSet {
    pub fn new() -> Self {
        PerishableSet::default()
    }

    pub fn insert(&mut self, id: StoreId) -> bool {
        self.flush();
        self.ids.insert(id)
    }

    pub fn remove(&mut self, id: StoreId) -> bool {
        self.flush();
        self.ids.remove(&id)
    }

    pub fn contains(&self, id: StoreId, valid: impl Fn(StoreId) -> bool) -> bool {
        if !self.ids.contains(&id) {
            return false;
        }
        if valid(id) {
            true
        } else {
            self.expired.lock().unwrap().push(id);
            false
        }
    }

    /// Currently valid ids in ascending order. Expired ids encountered along
    /// the way are recorded for removal, never yielded.
    pub fn iter<'a>(
        &'a self,
        valid: impl Fn(StoreId) -> bool + 'a,
    ) -> impl Iterator<Item = StoreId> + 'a {
        self.ids.iter().copied().filter(move |id| {
            if valid(*id) {
                true
            } else {
                self.expired.lock().unwrap().push(*id);
                false
            }
        })
    }

    /// Number of currently valid ids.
    pub fn len(&self, valid: impl Fn(StoreId) -> bool) -> usize {
        self.iter(valid).count()
    }

    pub fn is_empty(&self, valid: impl Fn(StoreId) -> bool) -> bool {
        self.iter(valid).next().is_none()
    }

    /// Physically remove every id previously observed expired.
    pub fn flush(&mut self) {
        for id in self.expired.get_mut().unwrap().drain(..) {
            self.ids.remove(&id);
        }
    }

    /// Raw entry count, stale entries included.
    pub fn raw_len(&self) -> usize {
        self.ids.len()
    }
}

/// A single-id slot with lazy expiry; the terminal of a unique index.
#[derive(Debug, Default)]
pub struct PerishableSlot {
    id: Mutex<Option<StoreId>>,
}

impl PerishableSlot {
    pub fn new(id: StoreId) -> Self {
        PerishableSlot {
            id: Mutex::new(Some(id)),
        }
    }

    pub fn set(&mut self, id: StoreId) {
        *self.id.get_mut().unwrap() = Some(id);
    }

    pub fn clear(&mut self) {
        *self.id.get_mut().unwrap() = None;
    }

    /// The held id if still valid. An expired id is dropped on observation;
    /// clearing a one-element slot cannot disturb any iterator.
    pub fn get(&self, valid: impl Fn(StoreId) -> bool) -> Option<StoreId> {
        let mut slot = self.id.lock().unwrap();
        match *slot {
            Some(id) if valid(id) => Some(id),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn is_empty(&self, valid: impl Fn(StoreId) -> bool) -> bool {
        self.get(valid).is_none()
    }

    /// Raw occupancy, stale entries included.
    pub fn raw_is_empty(&self) -> bool {
        self.id.lock().unwrap().is_none()
    }

    /// Remove `id` if it is currently held, regardless of validity.
    pub fn remove(&mut self, id: StoreId) -> bool {
        let slot = self.id.get_mut().unwrap();
        if *slot == Some(id) {
            *slot = None;
            true
        } else {
            false
        }
    }
}
