use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Virtual anchors per shard. High enough that a handful of shards spread
/// evenly over the 2^16 circle.
pub const DEFAULT_VIRTUAL_ANCHORS: u32 = 1000;

/// Position of a label on the [0, 2^16) circle: SHA-256 of the label reduced
/// mod 2^16, which is the last two digest bytes big-endian.
pub fn ring_position(label: &str) -> u16 {
    let digest = Sha256::digest(label.as_bytes());
    u16::from_be_bytes([digest[30], digest[31]])
}

/// Wire form of the ring, exchanged on reshard and shard-member addition.
/// Anchor order is preserved so every receiver reproduces the sender's
/// placement exactly instead of re-running construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSnapshot {
    pub anchors: Vec<(u16, String)>,
    #[serde(rename = "virtual-count")]
    pub virtual_count: u32,
}

/// Consistent-hash placement from key to shard id. Each shard contributes a
/// real anchor at `H(id)` plus `virtual_count` anchors at `H("{id}-{i}")`.
///
/// Construction is deterministic: callers insert real shards in sorted id
/// order and virtual anchors follow in `0..virtual_count` order, so two
/// replicas building from the same shard set hold byte-identical rings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentHashRing {
    /// Sorted by position; `anchors[i].0` is the position of label
    /// `anchors[i].1`. Equal positions keep first-inserted order.
    anchors: Vec<(u16, String)>,
    virtual_count: u32,
}

impl ConsistentHashRing {
    pub fn new(virtual_count: u32) -> Self {
        Self {
            anchors: Vec::new(),
            virtual_count,
        }
    }

    /// Insert the real anchor and all virtual anchors for `shard_id`.
    pub fn add_shard(&mut self, shard_id: &str) {
        self.insert_anchor(ring_position(shard_id), shard_id);
        for i in 0..self.virtual_count {
            let label = format!("{}-{}", shard_id, i);
            self.insert_anchor(ring_position(&label), shard_id);
        }
    }

    fn insert_anchor(&mut self, position: u16, shard_id: &str) {
        // insert after any equal position so ties resolve to first-inserted
        let at = self.anchors.partition_point(|(p, _)| *p <= position);
        self.anchors.insert(at, (position, shard_id.to_string()));
    }

    /// Drop every anchor labelled with `shard_id`, virtual ones included.
    pub fn remove_shard(&mut self, shard_id: &str) {
        self.anchors.retain(|(_, id)| id != shard_id);
    }

    pub fn reset(&mut self) {
        self.anchors.clear();
    }

    /// The consistent-hashing walk: hash the key and take the first anchor
    /// strictly past it, wrapping to the start of the circle.
    pub fn lookup(&self, key: &str) -> Option<(String, u16)> {
        if self.anchors.is_empty() {
            return None;
        }
        let hash = ring_position(key);
        let at = self.anchors.partition_point(|(p, _)| *p <= hash);
        let (_, shard_id) = &self.anchors[at % self.anchors.len()];
        Some((shard_id.clone(), hash))
    }

    /// Distinct real shard ids, sorted.
    pub fn shard_ids(&self) -> Vec<String> {
        self.anchors
            .iter()
            .map(|(_, id)| id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn virtual_count(&self) -> u32 {
        self.virtual_count
    }

    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            anchors: self.anchors.clone(),
            virtual_count: self.virtual_count,
        }
    }

    pub fn from_snapshot(snapshot: RingSnapshot) -> Self {
        Self {
            anchors: snapshot.anchors,
            virtual_count: snapshot.virtual_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_for(shards: &[&str], virtual_count: u32) -> ConsistentHashRing {
        let mut ring = ConsistentHashRing::new(virtual_count);
        for shard in shards {
            ring.add_shard(shard);
        }
        ring
    }

    #[test]
    fn construction_is_deterministic() {
        let a = ring_for(&["s0", "s1", "s2"], 1000);
        let b = ring_for(&["s0", "s1", "s2"], 1000);
        assert_eq!(a, b);
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn every_shard_contributes_all_its_anchors() {
        let ring = ring_for(&["s0", "s1"], 100);
        assert_eq!(ring.anchor_count(), 2 * 101);
        assert_eq!(ring.shard_ids(), vec!["s0".to_string(), "s1".to_string()]);
    }

    #[test]
    fn lookup_is_pure_and_total() {
        let ring = ring_for(&["s0", "s1", "s2"], 1000);
        for key in ["foo", "bar", "", "a-very-long-key-near-the-limit"] {
            let first = ring.lookup(key).unwrap();
            let second = ring.lookup(key).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.1, ring_position(key));
        }
    }

    #[test]
    fn lookup_on_empty_ring_is_none() {
        let ring = ConsistentHashRing::new(1000);
        assert!(ring.lookup("foo").is_none());
    }

    #[test]
    fn lookup_wraps_past_the_last_anchor() {
        // single anchor: every key maps to it, including keys hashing past it
        let mut ring = ConsistentHashRing::new(0);
        ring.add_shard("s0");
        for key in ["a", "b", "c", "wrap"] {
            assert_eq!(ring.lookup(key).unwrap().0, "s0");
        }
    }

    #[test]
    fn distribution_is_roughly_even() {
        let ring = ring_for(&["s0", "s1", "s2"], 1000);
        let mut counts = std::collections::HashMap::new();
        for i in 0..3000 {
            let (shard, _) = ring.lookup(&format!("key-{}", i)).unwrap();
            *counts.entry(shard).or_insert(0usize) += 1;
        }
        for (shard, count) in counts {
            assert!(count > 500, "shard {} only got {} keys", shard, count);
        }
    }

    #[test]
    fn remove_shard_drops_every_anchor() {
        let mut ring = ring_for(&["s0", "s1"], 50);
        ring.remove_shard("s0");
        assert_eq!(ring.anchor_count(), 51);
        assert_eq!(ring.shard_ids(), vec!["s1".to_string()]);
        for i in 0..100 {
            assert_eq!(ring.lookup(&format!("k{}", i)).unwrap().0, "s1");
        }
    }

    #[test]
    fn snapshot_round_trip_preserves_placement() {
        let ring = ring_for(&["s0", "s1", "s2"], 1000);
        let restored = ConsistentHashRing::from_snapshot(ring.snapshot());
        assert_eq!(ring, restored);
        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(ring.lookup(&key), restored.lookup(&key));
        }
    }

    #[test]
    fn snapshot_serialises_in_anchor_order() {
        let ring = ring_for(&["s0", "s1"], 10);
        let json = serde_json::to_string(&ring.snapshot()).unwrap();
        let decoded: RingSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, ring.snapshot());
        let positions: Vec<u16> = decoded.anchors.iter().map(|(p, _)| *p).collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn reset_clears_all_anchors() {
        let mut ring = ring_for(&["s0", "s1"], 10);
        ring.reset();
        assert!(ring.is_empty());
        assert!(ring.lookup("foo").is_none());
    }
}
