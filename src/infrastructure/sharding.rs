// Shard layout, member addition, and the reshard procedure. The layout is
// deterministic: shard ids are `s0..s{N-1}`, the view is iterated in sorted
// order and round-robin assigned, and the ring is rebuilt shard-by-shard in
// ascending id order so every replica converges to the same placement.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::hash_ring::{ConsistentHashRing, DEFAULT_VIRTUAL_ANCHORS};
use crate::infrastructure::messages::{
    KeyLocationMerge, ReshardNotice, ShardTable, StoreMerge, TransferMessage,
};
use crate::infrastructure::replica::Replica;

pub fn shard_name(index: usize) -> String {
    format!("s{}", index)
}

/// Which shard's member list contains `address`.
pub fn shard_of(table: &ShardTable, address: &str) -> Option<String> {
    table
        .iter()
        .find(|(_, members)| members.iter().any(|m| m == address))
        .map(|(shard, _)| shard.clone())
}

fn layout_unchecked(
    view: &BTreeSet<String>,
    count: usize,
    virtual_count: u32,
) -> (ShardTable, ConsistentHashRing) {
    let mut shard_ids: Vec<String> = (0..count).map(shard_name).collect();
    shard_ids.sort();

    let mut table: ShardTable = shard_ids
        .iter()
        .map(|id| (id.clone(), Vec::new()))
        .collect();
    for (i, address) in view.iter().enumerate() {
        table
            .get_mut(&shard_name(i % count))
            .expect("shard entries were just created")
            .push(address.clone());
    }
    // anchors go in in sorted id order so equal-position ties resolve the
    // same way on every replica
    let mut ring = ConsistentHashRing::new(virtual_count);
    for id in &shard_ids {
        ring.add_shard(id);
    }
    (table, ring)
}

/// Layout for an explicitly requested shard count; refuses counts that would
/// leave a shard below two replicas.
pub fn build_shard_layout(
    view: &BTreeSet<String>,
    count: usize,
    virtual_count: u32,
) -> AppResult<(ShardTable, ConsistentHashRing)> {
    if count == 0 {
        return Err(AppError::BadRequest(
            "shard count must be at least 1".to_string(),
        ));
    }
    if count * 2 > view.len() {
        return Err(AppError::BadRequest(
            "Not enough nodes to provide fault tolerance with requested shard count".to_string(),
        ));
    }
    Ok(layout_unchecked(view, count, virtual_count))
}

/// One implicit shard spanning the whole view; used when no shard count was
/// configured. The two-replica floor binds explicit requests only.
pub fn single_shard_layout(view: &BTreeSet<String>) -> (ShardTable, ConsistentHashRing) {
    layout_unchecked(view, 1, DEFAULT_VIRTUAL_ANCHORS)
}

// Member addition -------------------------------------------------------

/// Initiator side of `/shard/add-member/{id}`: append locally, then push a
/// full-state transfer to every other replica. The recipient whose address
/// matches the new member adopts the carried state wholesale.
pub async fn add_member(replica: &Replica, shard: &str, address: &str) -> AppResult<()> {
    let (transfer, view_peers) = {
        let mut state = replica.state.write().await;
        if !state.view.contains(address) || !state.shard_table.contains_key(shard) {
            return Err(AppError::NotFound(
                "Either the shard id or the socket address is unknown".to_string(),
            ));
        }
        let members = state
            .shard_table
            .get_mut(shard)
            .expect("presence checked above");
        if !members.iter().any(|m| m == address) {
            members.push(address.to_string());
        }
        info!("adding {} to shard {}", address, shard);
        (
            TransferMessage {
                id: shard.to_string(),
                socket_address: address.to_string(),
                store: state.store.clone(),
                vc: state.clock.clone(),
                shard_table: state.shard_table.clone(),
                key_locations: state.key_locations.clone(),
                ring: state.ring.snapshot(),
            },
            state.view_peers(&replica.address),
        )
    };
    replica.peers.send_transfer(&view_peers, &transfer).await;
    Ok(())
}

/// Recipient side of the transfer. The named member adopts everything and
/// joins the shard; everyone else records the new membership.
pub async fn apply_incoming_member(replica: &Replica, transfer: TransferMessage) {
    let mut state = replica.state.write().await;
    if transfer.socket_address == replica.address {
        info!(
            "joining shard {} with {} transferred keys",
            transfer.id,
            transfer.store.len()
        );
        state.store = transfer.store;
        state.clock = transfer.vc;
        state.shard_table = transfer.shard_table;
        state.key_locations = transfer.key_locations;
        state.ring = ConsistentHashRing::from_snapshot(transfer.ring);
        state.self_shard = transfer.id;
        return;
    }
    match state.shard_table.get_mut(&transfer.id) {
        Some(members) if !members.iter().any(|m| m == &transfer.socket_address) => {
            members.push(transfer.socket_address);
        }
        Some(_) => {}
        None => warn!(
            "member transfer names unknown shard {}; ignoring",
            transfer.id
        ),
    }
}

// Reshard ---------------------------------------------------------------

/// Initiator side of `/shard/reshard`: rebuild ring and table, broadcast the
/// new topology, tell every replica (this one included) to rehash its store
/// into the new placement.
pub async fn reshard(replica: &Replica, count: usize) -> AppResult<()> {
    let (notice, view_peers) = {
        let mut state = replica.state.write().await;
        if count == 0 {
            return Err(AppError::BadRequest(
                "shard count must be at least 1".to_string(),
            ));
        }
        if count * 2 > state.view.len() {
            return Err(AppError::BadRequest(
                "Not enough nodes to provide fault tolerance with requested shard count"
                    .to_string(),
            ));
        }
        let (table, ring) = layout_unchecked(&state.view, count, state.ring.virtual_count());
        state.self_shard = shard_of(&table, &replica.address).ok_or_else(|| {
            AppError::Config(format!("{} missing from the rebuilt shard table", replica.address))
        })?;
        state.key_locations = table
            .keys()
            .map(|shard| (shard.clone(), BTreeSet::new()))
            .collect();
        state.shard_table = table;
        state.ring = ring;
        info!("resharding the view into {} shards", count);
        (
            ReshardNotice {
                shard_table: state.shard_table.clone(),
                ring: state.ring.snapshot(),
            },
            state.view_peers(&replica.address),
        )
    };

    replica.peers.blast_reshard(&view_peers, &notice).await;
    replica.peers.send_remap(&view_peers).await;
    remap_local(replica).await;
    Ok(())
}

/// Recipient side of the topology broadcast: adopt table and ring, clear the
/// key-location index, recompute own shard membership.
pub async fn apply_reshard_notice(replica: &Replica, notice: ReshardNotice) {
    let mut state = replica.state.write().await;
    match shard_of(&notice.shard_table, &replica.address) {
        Some(shard) => state.self_shard = shard,
        None => warn!("reshard notice does not place {} in any shard", replica.address),
    }
    state.key_locations = notice
        .shard_table
        .keys()
        .map(|shard| (shard.clone(), BTreeSet::new()))
        .collect();
    state.shard_table = notice.shard_table;
    state.ring = ConsistentHashRing::from_snapshot(notice.ring);
}

/// Rehash every locally held pair against the current ring, keep what still
/// belongs here, push each foreign bucket to every member of its new owning
/// shard, and broadcast the rebuilt key-location map.
pub async fn remap_local(replica: &Replica) {
    let (buckets, key_locations, view_peers) = {
        let mut state = replica.state.write().await;
        if state.store.is_empty() {
            return;
        }
        let drained = std::mem::take(&mut state.store);
        let mut buckets: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for (key, value) in drained {
            let Some((shard, _)) = state.ring.lookup(&key) else {
                warn!("dropping key {} from rehash: the ring is empty", key);
                continue;
            };
            state
                .key_locations
                .entry(shard.clone())
                .or_default()
                .insert(key.clone());
            buckets.entry(shard).or_default().insert(key, value);
        }
        // pairs that still hash here stay in the local store
        if let Some(own) = buckets.get(&state.self_shard) {
            state.store.extend(own.clone());
        }
        (
            buckets,
            state.key_locations.clone(),
            state.view_peers(&replica.address),
        )
    };

    for (shard, bucket) in &buckets {
        let targets = {
            let state = replica.state.read().await;
            state.shard_members_except_self(shard, &replica.address)
        };
        if targets.is_empty() {
            continue;
        }
        replica
            .peers
            .push_store(
                &targets,
                &StoreMerge {
                    entries: bucket.clone(),
                },
            )
            .await;
    }

    replica
        .peers
        .blast_key_location_map(
            &view_peers,
            &KeyLocationMerge {
                entries: key_locations,
            },
        )
        .await;
}

/// Merge a rehashed bucket pushed by a peer into the local store.
pub async fn merge_store(replica: &Replica, merge: StoreMerge) {
    let mut state = replica.state.write().await;
    state.store.extend(merge.entries);
}

/// Union-merge a rebuilt key-location map, skipping empty sets.
pub async fn merge_key_locations(replica: &Replica, merge: KeyLocationMerge) {
    let mut state = replica.state.write().await;
    for (shard, keys) in merge.entries {
        if keys.is_empty() {
            continue;
        }
        state.key_locations.entry(shard).or_default().extend(keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(addresses: &[&str]) -> BTreeSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn round_robin_assignment_over_the_sorted_view() {
        let view = view(&["d:1", "a:1", "c:1", "b:1"]);
        let (table, _) = build_shard_layout(&view, 2, 10).unwrap();
        // sorted view: a, b, c, d → s0 gets a and c, s1 gets b and d
        assert_eq!(table["s0"], vec!["a:1".to_string(), "c:1".to_string()]);
        assert_eq!(table["s1"], vec!["b:1".to_string(), "d:1".to_string()]);
    }

    #[test]
    fn layout_refuses_counts_below_the_fault_tolerance_floor() {
        let three = view(&["a:1", "b:1", "c:1"]);
        assert!(build_shard_layout(&three, 2, 10).is_err());
        assert!(build_shard_layout(&three, 0, 10).is_err());
        assert!(build_shard_layout(&three, 1, 10).is_ok());
    }

    #[test]
    fn layout_partitions_the_view() {
        let six = view(&["a:1", "b:1", "c:1", "d:1", "e:1", "f:1"]);
        let (table, _) = build_shard_layout(&six, 3, 10).unwrap();
        let mut seen = BTreeSet::new();
        for members in table.values() {
            assert_eq!(members.len(), 2);
            for member in members {
                assert!(seen.insert(member.clone()));
            }
        }
        assert_eq!(seen, six);
    }

    #[test]
    fn identical_views_produce_identical_layouts() {
        let a = view(&["a:1", "b:1", "c:1", "d:1"]);
        let (table_a, ring_a) = build_shard_layout(&a, 2, 100).unwrap();
        let (table_b, ring_b) = build_shard_layout(&a, 2, 100).unwrap();
        assert_eq!(table_a, table_b);
        assert_eq!(ring_a, ring_b);
    }

    #[test]
    fn same_count_reshard_leaves_placement_unchanged() {
        let v = view(&["a:1", "b:1", "c:1", "d:1"]);
        let (_, before) = build_shard_layout(&v, 2, 1000).unwrap();
        let (_, after) = build_shard_layout(&v, 2, 1000).unwrap();
        for i in 0..100 {
            let key = format!("key-{}", i);
            assert_eq!(before.lookup(&key), after.lookup(&key));
        }
    }

    #[test]
    fn shard_of_finds_the_owning_shard() {
        let v = view(&["a:1", "b:1", "c:1", "d:1"]);
        let (table, _) = build_shard_layout(&v, 2, 10).unwrap();
        assert_eq!(shard_of(&table, "a:1").unwrap(), "s0");
        assert_eq!(shard_of(&table, "b:1").unwrap(), "s1");
        assert!(shard_of(&table, "x:1").is_none());
    }

    #[test]
    fn rehash_buckets_agree_with_ring_lookup() {
        let v = view(&["a:1", "b:1", "c:1", "d:1"]);
        let (_, ring) = build_shard_layout(&v, 2, 1000).unwrap();
        let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for i in 0..50 {
            let key = format!("key-{}", i);
            let (shard, _) = ring.lookup(&key).unwrap();
            buckets.entry(shard).or_default().push(key);
        }
        for (shard, keys) in buckets {
            for key in keys {
                assert_eq!(ring.lookup(&key).unwrap().0, shard);
            }
        }
    }
}
