// Wire formats for the client surface and the replica-to-replica RPCs.
// Every payload is an explicit schema; `causal-metadata` is optional on the
// way in (absent and `null` both mean "no dependencies") and always present
// on the way out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::infrastructure::hash_ring::RingSnapshot;
use crate::infrastructure::vector_clock::VectorClock;

/// shard-id -> ordered member addresses.
pub type ShardTable = BTreeMap<String, Vec<String>>;

/// shard-id -> keys known to live there. Best-effort routing hint.
pub type KeyLocationMap = BTreeMap<String, BTreeSet<String>>;

// Client surface --------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    pub value: Option<Value>,
    #[serde(rename = "causal-metadata", default)]
    pub causal_metadata: Option<VectorClock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadRequest {
    #[serde(rename = "causal-metadata", default)]
    pub causal_metadata: Option<VectorClock>,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub result: &'static str,
    #[serde(rename = "causal-metadata")]
    pub causal_metadata: VectorClock,
    #[serde(rename = "shard-id", skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub result: &'static str,
    pub value: Value,
    #[serde(rename = "causal-metadata")]
    pub causal_metadata: VectorClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewChangeRequest {
    #[serde(rename = "socket-address")]
    pub socket_address: String,
}

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub view: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultMessage {
    pub result: String,
}

impl ResultMessage {
    pub fn new(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReshardRequest {
    #[serde(rename = "shard-count", default)]
    pub shard_count: Option<usize>,
}

// Replica-to-replica RPCs -----------------------------------------------

/// PUT `/reptorep/{key}/{from}`: intra-shard write replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedPut {
    pub value: Value,
    #[serde(rename = "causal-metadata")]
    pub causal_metadata: VectorClock,
}

/// DELETE `/reptorep/{key}/{from}`: intra-shard delete replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedDelete {
    #[serde(rename = "causal-metadata")]
    pub causal_metadata: VectorClock,
    #[serde(rename = "from-shard")]
    pub from_shard: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedDeleteAck {
    pub result: String,
    #[serde(rename = "causal-metadata")]
    pub causal_metadata: VectorClock,
}

/// PUT `/reptorep/updatevc`: fire-and-forget clock broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockUpdate {
    pub vc: VectorClock,
}

/// PUT `/reptorep/updatemap/{key}`: a key was created in `shard`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyLocationUpdate {
    pub shard: String,
}

/// GET `/existinginfo`: state pull for a joining in-shard replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub store: BTreeMap<String, Value>,
    pub vc: VectorClock,
}

/// PUT `/shard/addmemberincoming`: full-state transfer on member addition.
/// The recipient whose address matches `socket_address` adopts everything
/// and joins shard `id`; everyone else only appends the member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMessage {
    pub id: String,
    #[serde(rename = "socket-address")]
    pub socket_address: String,
    pub store: BTreeMap<String, Value>,
    pub vc: VectorClock,
    #[serde(rename = "shard-table")]
    pub shard_table: ShardTable,
    #[serde(rename = "key-locations")]
    pub key_locations: KeyLocationMap,
    pub ring: RingSnapshot,
}

/// PUT `/shard/blast_reshard`: new topology pushed by the reshard initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshardNotice {
    #[serde(rename = "shard-table")]
    pub shard_table: ShardTable,
    pub ring: RingSnapshot,
}

/// PUT `/reptorep/updated_store`: a rehashed bucket for the receiver's shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMerge {
    #[serde(rename = "new-store")]
    pub entries: BTreeMap<String, Value>,
}

/// PUT `/reptorep/updated_map`: rebuilt key-location map after a rehash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyLocationMerge {
    #[serde(rename = "new-map")]
    pub entries: KeyLocationMap,
}

#[derive(Debug, Serialize)]
pub struct ShardIdsResponse {
    #[serde(rename = "shard-ids")]
    pub shard_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeShardIdResponse {
    #[serde(rename = "node-shard-id")]
    pub node_shard_id: String,
}

#[derive(Debug, Serialize)]
pub struct ShardMembersResponse {
    #[serde(rename = "shard-members")]
    pub shard_members: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ShardKeyCountResponse {
    #[serde(rename = "shard-key-count")]
    pub shard_key_count: usize,
}
