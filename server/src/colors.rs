//! Per-meeting color assignment for chat attribution.

use std::collections::HashMap;

/// Hands out one of ten color buckets per membership key, round-robin.
/// A key always keeps the label it was first given for the lifetime of
/// the meeting. Owned by the meeting driver, so no interior locking.
#[derive(Debug, Default)]
pub struct ColorAssigner {
    idx: u8,
    assigned: HashMap<i32, String>,
}

impl ColorAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label for a membership key, assigning the next bucket on first sight.
    pub fn get(&mut self, keyid: i32) -> String {
        if let Some(label) = self.assigned.get(&keyid) {
            return label.clone();
        }

        // The counter increments before assignment and wraps after 9.
        self.idx = (self.idx + 1) % 10;
        let label = self.idx.to_string();
        self.assigned.insert(keyid, label.clone());
        label
    }

    /// Like [`get`](Self::get), but system messages (no sender) get the
    /// `"sys"` sentinel instead of a bucket.
    pub fn get_with_null(&mut self, keyid: Option<i32>) -> String {
        match keyid {
            Some(keyid) => self.get(keyid),
            None => "sys".to_string(),
        }
    }
}
