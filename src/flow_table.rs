//! Concurrent flow-id to endpoint map (spec C2).
//!
//! Guards only table membership; callers must not hold the lock while
//! performing async I/O (see the concurrency model in SPEC_FULL.md §5).

use crate::frame::{FlowId, FLOW_ID_LEN};
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;

// 64 symbols so a 6-char id carries exactly 64^6 = 2^36 bits of entropy.
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
const MAX_GENERATE_ATTEMPTS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum FlowTableError {
    #[error("duplicate flow-id")]
    Duplicate,
    #[error("exhausted {0} attempts generating a free flow-id")]
    IdSpaceExhausted(usize),
}

pub struct FlowTable<T> {
    inner: Mutex<FxHashMap<FlowId, T>>,
}

impl<T> Default for FlowTable<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<T: Clone> FlowTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: FlowId, endpoint: T) -> Result<(), FlowTableError> {
        let mut guard = self.inner.lock();
        if guard.contains_key(&id) {
            return Err(FlowTableError::Duplicate);
        }
        guard.insert(id, endpoint);
        Ok(())
    }

    pub fn get(&self, id: &FlowId) -> Option<T> {
        self.inner.lock().get(id).cloned()
    }

    /// Idempotent: returns whether an entry was actually present.
    pub fn remove(&self, id: &FlowId) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    /// Removes and returns the entry, when callers need the endpoint
    /// itself (e.g. to close it) rather than just the presence bit.
    pub fn take(&self, id: &FlowId) -> Option<T> {
        self.inner.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Atomically empties the table, returning every endpoint it held.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain().map(|(_, v)| v).collect()
    }

    /// Samples a fresh id not already present in the table.
    pub fn generate_id(&self) -> Result<FlowId, FlowTableError> {
        let mut rng = rand::thread_rng();
        let guard = self.inner.lock();
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let mut bytes = [0u8; FLOW_ID_LEN];
            for b in bytes.iter_mut() {
                *b = ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())];
            }
            let id = FlowId::from_bytes(bytes).expect("alphabet is always printable ASCII");
            if !guard.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(FlowTableError::IdSpaceExhausted(MAX_GENERATE_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> FlowId {
        let mut bytes = [0u8; FLOW_ID_LEN];
        bytes.copy_from_slice(s.as_bytes());
        FlowId::from_bytes(bytes).unwrap()
    }

    #[test]
    fn add_get_remove_round_trip() {
        let table: FlowTable<u32> = FlowTable::new();
        table.add(id("abcdef"), 7).unwrap();
        assert_eq!(table.get(&id("abcdef")), Some(7));
        assert!(table.remove(&id("abcdef")));
        assert!(table.get(&id("abcdef")).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let table: FlowTable<u32> = FlowTable::new();
        assert!(!table.remove(&id("abcdef")));
        table.add(id("abcdef"), 1).unwrap();
        assert!(table.remove(&id("abcdef")));
        assert!(!table.remove(&id("abcdef")));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let table: FlowTable<u32> = FlowTable::new();
        table.add(id("abcdef"), 1).unwrap();
        assert!(matches!(
            table.add(id("abcdef"), 2),
            Err(FlowTableError::Duplicate)
        ));
    }

    #[test]
    fn drain_empties_and_returns_all() {
        let table: FlowTable<u32> = FlowTable::new();
        table.add(id("aaaaaa"), 1).unwrap();
        table.add(id("bbbbbb"), 2).unwrap();
        let mut drained = table.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(table.is_empty());
    }

    #[test]
    fn generate_id_avoids_collisions() {
        let table: FlowTable<u32> = FlowTable::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let id = table.generate_id().unwrap();
            table.add(id, i).unwrap();
            assert!(seen.insert(id.as_bytes().to_owned()));
        }
    }
}
