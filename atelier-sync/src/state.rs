//! Shared State Store: the server's authoritative element set.
//!
//! Keyed by element id, iterated in first-insertion order. A replacement keeps
//! the element's original slot so snapshots stay stable across edits.

use indexmap::IndexMap;

use crate::element::Element;

#[derive(Debug, Default)]
pub struct SharedState {
    elements: IndexMap<String, Element>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted elements. Later duplicates replace earlier ones.
    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        let mut state = Self::new();
        for element in elements {
            state.apply_upsert(element);
        }
        state
    }

    /// Insert or fully replace by id. Returns `true` if the id was new.
    pub fn apply_upsert(&mut self, element: Element) -> bool {
        self.elements.insert(element.id.clone(), element).is_none()
    }

    /// Delete by id. Absent ids are a no-op.
    pub fn apply_remove(&mut self, id: &str) -> Option<Element> {
        self.elements.shift_remove(id)
    }

    /// Full ordered dump for resynchronisation.
    pub fn snapshot(&self) -> Vec<Element> {
        self.elements.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
