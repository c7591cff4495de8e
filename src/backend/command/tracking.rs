// Resources referenced by one recording epoch

use std::collections::HashSet;
use std::sync::Arc;

/// Insertion-ordered set of shared handles, keyed by identity.
///
/// Holding the `Arc` keeps the resource alive, so the pointer used as key
/// cannot be reused by another object while it is in the set.
pub struct UsedResources<T> {
    handles: Vec<Arc<T>>,
    seen: HashSet<usize>,
}

impl<T> UsedResources<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn key(handle: &Arc<T>) -> usize {
        Arc::as_ptr(handle) as *const () as usize
    }

    /// Retain `handle`. Returns false if it was already retained.
    pub fn insert(&mut self, handle: &Arc<T>) -> bool {
        if self.seen.insert(Self::key(handle)) {
            self.handles.push(Arc::clone(handle));
            true
        } else {
            false
        }
    }

    pub fn contains(&self, handle: &Arc<T>) -> bool {
        self.seen.contains(&Self::key(handle))
    }

    pub fn as_slice(&self) -> &[Arc<T>] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Release every retained handle
    pub fn clear(&mut self) {
        self.seen.clear();
        self.handles.clear();
    }
}

impl<T> Default for UsedResources<T> {
    fn default() -> Self {
        Self::new()
    }
}
