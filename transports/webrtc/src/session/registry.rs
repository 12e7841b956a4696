//! Discovered stream registry

use crate::signaling::protocol::StreamId;

/// Ordered set of stream ids: discovery order, no duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRegistry {
    streams: Vec<StreamId>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents wholesale, keeping the first occurrence of each id
    pub fn replace(&mut self, streams: impl IntoIterator<Item = StreamId>) {
        self.streams.clear();
        for id in streams {
            self.insert(id);
        }
    }

    /// Append `id` if absent; returns whether it was added
    pub fn insert(&mut self, id: StreamId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.streams.push(id);
        true
    }

    /// Remove `id`; returns whether it was present
    pub fn remove(&mut self, id: &StreamId) -> bool {
        match self.streams.iter().position(|s| s == id) {
            Some(pos) => {
                self.streams.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &StreamId) -> bool {
        self.streams.contains(id)
    }

    /// Most recently discovered stream
    pub fn newest(&self) -> Option<&StreamId> {
        self.streams.last()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn to_vec(&self) -> Vec<StreamId> {
        self.streams.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamId> {
        self.streams.iter()
    }
}
