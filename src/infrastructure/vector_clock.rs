use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vector clock for causal ordering: one monotonic counter per replica
/// address. A missing entry reads as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-initialised clock over the given address domain.
    pub fn zeroed<'a>(addresses: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            entries: addresses.into_iter().map(|a| (a.clone(), 0)).collect(),
        }
    }

    pub fn get(&self, address: &str) -> u64 {
        self.entries.get(address).copied().unwrap_or(0)
    }

    /// `self ≤ other`: every entry of `self` is covered by `other`. The empty
    /// clock carries no dependencies and is ≤ everything.
    pub fn leq(&self, other: &VectorClock) -> bool {
        self.entries
            .iter()
            .all(|(address, count)| *count <= other.get(address))
    }

    /// Entry-wise max over the union of both domains.
    pub fn merge(&mut self, other: &VectorClock) {
        for (address, count) in &other.entries {
            let entry = self.entries.entry(address.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    /// Advance this replica's own counter by one. Called exactly once per
    /// locally-originated client write that mutates the store.
    pub fn increment(&mut self, address: &str) {
        *self.entries.entry(address.to_string()).or_insert(0) += 1;
    }

    /// Domain maintenance on view-add.
    pub fn insert_zero(&mut self, address: &str) {
        self.entries.entry(address.to_string()).or_insert(0);
    }

    /// Domain maintenance on view-remove.
    pub fn remove(&mut self, address: &str) {
        self.entries.remove(address);
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
