//! Sets of fixed-width connection ids
//!
//! Connection ids are 36-character UUID strings, so a set of them can travel as
//! one undelimited string. [`Targets`] is the in-memory form: an insertion
//! ordered set that never holds the same id twice.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of every connection id
pub const CONNECTION_ID_LEN: usize = 36;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Targets(IndexSet<String>);

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(connection_id: impl Into<String>) -> Self {
        let mut targets = Self::new();
        targets.insert(connection_id);
        targets
    }

    /// Slice a concatenated string every 36 bytes
    ///
    /// A trailing fragment shorter than one id is ignored, as are repeats.
    pub fn from_concatenated(raw: &str) -> Self {
        let mut targets = Self::new();
        let mut i = 0;
        while i + CONNECTION_ID_LEN <= raw.len() {
            if let Some(id) = raw.get(i..i + CONNECTION_ID_LEN) {
                targets.insert(id);
            }
            i += CONNECTION_ID_LEN;
        }
        targets
    }

    pub fn to_concatenated(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * CONNECTION_ID_LEN);
        for id in &self.0 {
            out.push_str(id);
        }
        out
    }

    /// Returns false when the id was already present
    pub fn insert(&mut self, connection_id: impl Into<String>) -> bool {
        self.0.insert(connection_id.into())
    }

    pub fn remove(&mut self, connection_id: &str) -> bool {
        self.0.shift_remove(connection_id)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.0.contains(connection_id)
    }

    pub fn extend(&mut self, other: &Targets) {
        for id in &other.0 {
            self.0.insert(id.clone());
        }
    }

    pub fn union(mut self, other: &Targets) -> Self {
        self.extend(other);
        self
    }

    pub fn retain(&mut self, keep: impl FnMut(&String) -> bool) {
        self.0.retain(keep);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Targets {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut targets = Self::new();
        for id in iter {
            targets.insert(id);
        }
        targets
    }
}

impl IntoIterator for Targets {
    type Item = String;
    type IntoIter = indexmap::set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_concatenated())
    }
}
