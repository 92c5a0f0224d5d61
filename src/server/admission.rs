//! Admission bookkeeping for relay clients

use std::collections::HashSet;

/// Ids of admitted clients, bounded by the configured connection limit.
#[derive(Debug, Clone)]
pub struct AdmissionSet {
    capacity: usize,
    ids: HashSet<String>,
}

impl AdmissionSet {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, ids: HashSet::new() }
    }

    /// Admit `id` if there is room. Re-admitting a known id succeeds.
    pub fn try_admit(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return true;
        }
        if self.ids.len() >= self.capacity {
            return false;
        }
        self.ids.insert(id.to_string());
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ids.len() >= self.capacity
    }

    /// Admitted ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.ids.iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}
