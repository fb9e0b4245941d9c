// Core infrastructure modules
pub mod coordinator; // Per-request routing, causal gating, replication
pub mod hash_ring; // Consistent-hash placement of keys onto shards
pub mod messages; // Wire formats for client and replica-to-replica RPCs
pub mod peer_client; // Outbound fan-out with bounded timeouts
pub mod replica; // Per-replica state record and view management
pub mod sharding; // Shard layout, member addition, reshard
pub mod vector_clock; // Causal metadata

// Re-export core components
pub use hash_ring::{ConsistentHashRing, RingSnapshot, DEFAULT_VIRTUAL_ANCHORS};
pub use peer_client::PeerClient;
pub use replica::{Replica, ReplicaState};
pub use vector_clock::VectorClock;
