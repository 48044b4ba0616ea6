//! Interning of native handles as small integer ids.

use std::collections::HashMap;
use std::hash::Hash;

use crate::types::AttributeId;

/// Maps opaque native handles to monotonic [`AttributeId`]s. Ids are never reused,
/// even after [`IdArena::clear`], so an id kept from a previous link never
/// resolves to a handle of the next one.
#[derive(Debug)]
pub struct IdArena<H> {
    next: u32,
    by_handle: HashMap<H, AttributeId>,
    by_id: HashMap<AttributeId, H>,
}

impl<H: Clone + Eq + Hash> IdArena<H> {
    pub fn new() -> Self {
        Self {
            next: 1,
            by_handle: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Returns the id of `handle`, assigning a fresh one on first sight.
    pub fn intern(&mut self, handle: H) -> AttributeId {
        if let Some(&id) = self.by_handle.get(&handle) {
            return id;
        }
        let id = AttributeId::from_raw(self.next);
        self.next = self.next.wrapping_add(1).max(1);
        self.by_handle.insert(handle.clone(), id);
        self.by_id.insert(id, handle);
        id
    }

    pub fn id_of(&self, handle: &H) -> Option<AttributeId> {
        self.by_handle.get(handle).copied()
    }

    pub fn handle(&self, id: AttributeId) -> Option<&H> {
        self.by_id.get(&id)
    }

    /// Forgets every handle; the id counter keeps running.
    pub fn clear(&mut self) {
        self.by_handle.clear();
        self.by_id.clear();
    }
}

impl<H: Clone + Eq + Hash> Default for IdArena<H> {
    fn default() -> Self {
        Self::new()
    }
}
