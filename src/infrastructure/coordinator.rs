// Per-request coordination for the client surface: causal gating, routing to
// the owning shard, intra-shard replication, and clock bookkeeping. The state
// lock is held across the check-and-mutate section only; every outbound RPC
// happens after release.

use axum::http::StatusCode;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::infrastructure::messages::{
    ReadRequest, ReadResponse, ReplicatedDelete, ReplicatedDeleteAck, ReplicatedPut, WriteRequest,
    WriteResponse,
};
use crate::infrastructure::replica::Replica;
use crate::infrastructure::vector_clock::VectorClock;

const MAX_KEY_BYTES: usize = 50;

fn validate_key(key: &str) -> AppResult<()> {
    if key.len() > MAX_KEY_BYTES {
        return Err(AppError::BadRequest("Key is too long".to_string()));
    }
    Ok(())
}

fn pick_random(members: &[String]) -> Option<&String> {
    if members.is_empty() {
        return None;
    }
    let at = rand::rng().random_range(0..members.len());
    members.get(at)
}

fn to_body<T: serde::Serialize>(body: &T) -> Value {
    serde_json::to_value(body).unwrap_or(Value::Null)
}

// Client PUT ------------------------------------------------------------

enum PutPlan {
    Forward { target: String },
    Applied {
        created: bool,
        clock: VectorClock,
        shard: String,
        shard_peers: Vec<String>,
    },
}

pub async fn put(
    replica: &Replica,
    key: String,
    request: WriteRequest,
) -> AppResult<(StatusCode, Value)> {
    validate_key(&key)?;
    let value = request.value.ok_or_else(|| {
        AppError::BadRequest("PUT request does not specify a value".to_string())
    })?;
    let client_clock = request.causal_metadata.unwrap_or_default();

    let plan = {
        let mut state = replica.state.write().await;
        let (shard, _) = state
            .ring
            .lookup(&key)
            .ok_or_else(|| AppError::Upstream("the hash ring has no shards".to_string()))?;

        if shard != state.self_shard {
            let members = state.shard_members_except_self(&shard, &replica.address);
            let target = pick_random(&members)
                .cloned()
                .ok_or_else(|| AppError::Upstream(format!("shard {} has no members", shard)))?;
            PutPlan::Forward { target }
        } else {
            if !client_clock.leq(&state.clock) {
                return Err(AppError::CausalNotReady);
            }
            state.clock.increment(&replica.address);
            if !client_clock.leq(&state.clock) {
                return Err(AppError::CausalNotReady);
            }
            let created = !state.store.contains_key(&key);
            state.store.insert(key.clone(), value.clone());
            if created {
                let shard = state.self_shard.clone();
                state
                    .key_locations
                    .entry(shard)
                    .or_default()
                    .insert(key.clone());
            }
            PutPlan::Applied {
                created,
                clock: state.clock.clone(),
                shard: state.self_shard.clone(),
                shard_peers: state.shard_peers(&replica.address),
            }
        }
    };

    match plan {
        PutPlan::Forward { target } => {
            debug!("forwarding PUT {} to {}", key, target);
            replica
                .peers
                .forward_put(&target, &key, &value, &client_clock)
                .await
        }
        PutPlan::Applied {
            created,
            clock,
            shard,
            shard_peers,
        } => {
            let dead = replica
                .peers
                .replicate_put(
                    &shard_peers,
                    &key,
                    &ReplicatedPut {
                        value,
                        causal_metadata: clock.clone(),
                    },
                )
                .await;
            replica.evict_unreachable(dead).await;

            let view_peers = {
                let state = replica.state.read().await;
                state.view_peers(&replica.address)
            };
            replica.peers.blast_clock(&view_peers, &clock).await;
            if created {
                replica
                    .peers
                    .blast_key_location(&view_peers, &key, &shard)
                    .await;
            }

            let (status, result) = if created {
                info!("created {} in shard {}", key, shard);
                (StatusCode::CREATED, "created")
            } else {
                (StatusCode::OK, "replaced")
            };
            Ok((
                status,
                to_body(&WriteResponse {
                    result,
                    causal_metadata: clock,
                    shard_id: Some(shard),
                }),
            ))
        }
    }
}

// Client GET ------------------------------------------------------------

enum GetPlan {
    Local { value: Value, clock: VectorClock },
    Forward { target: String },
}

pub async fn get(
    replica: &Replica,
    key: String,
    request: ReadRequest,
) -> AppResult<(StatusCode, Value)> {
    let client_clock = request.causal_metadata.unwrap_or_default();

    let plan = {
        let state = replica.state.read().await;
        if !client_clock.leq(&state.clock) {
            return Err(AppError::CausalNotReady);
        }
        if let Some(value) = state.store.get(&key) {
            GetPlan::Local {
                value: value.clone(),
                clock: state.clock.clone(),
            }
        } else {
            let claiming = state
                .key_locations
                .iter()
                .find(|(_, keys)| keys.contains(&key))
                .map(|(shard, _)| shard.clone())
                .ok_or_else(|| AppError::NotFound("Key does not exist".to_string()))?;
            let members = state.shard_members_except_self(&claiming, &replica.address);
            let target = pick_random(&members)
                .cloned()
                .ok_or_else(|| AppError::NotFound("Key does not exist".to_string()))?;
            GetPlan::Forward { target }
        }
    };

    match plan {
        GetPlan::Local { value, clock } => Ok((
            StatusCode::OK,
            to_body(&ReadResponse {
                result: "found",
                value,
                causal_metadata: clock,
            }),
        )),
        GetPlan::Forward { target } => {
            debug!("forwarding GET {} to {}", key, target);
            replica.peers.forward_get(&target, &key, &client_clock).await
        }
    }
}

// Client DELETE ---------------------------------------------------------

enum DeletePlan {
    Applied {
        payload_clock: VectorClock,
        shard: String,
        shard_peers: Vec<String>,
    },
    Forward {
        claiming: String,
        targets: Vec<String>,
    },
}

pub async fn delete(
    replica: &Replica,
    key: String,
    request: ReadRequest,
) -> AppResult<(StatusCode, Value)> {
    let client_clock = request.causal_metadata.unwrap_or_default();

    let plan = {
        let mut state = replica.state.write().await;
        if !client_clock.leq(&state.clock) {
            return Err(AppError::CausalNotReady);
        }
        if state.store.contains_key(&key) {
            // the replication payload carries the clock as of the delete;
            // peers advance the originator entry themselves
            let payload_clock = state.clock.clone();
            state.store.remove(&key);
            let shard = state.self_shard.clone();
            if let Some(keys) = state.key_locations.get_mut(&shard) {
                keys.remove(&key);
            }
            state.clock.increment(&replica.address);
            DeletePlan::Applied {
                payload_clock,
                shard,
                shard_peers: state.shard_peers(&replica.address),
            }
        } else {
            let claiming = state
                .key_locations
                .iter()
                .find(|(_, keys)| keys.contains(&key))
                .map(|(shard, _)| shard.clone())
                .ok_or_else(|| AppError::NotFound("Key not found".to_string()))?;
            let targets = state.shard_members_except_self(&claiming, &replica.address);
            if targets.is_empty() {
                return Err(AppError::NotFound("Key not found".to_string()));
            }
            DeletePlan::Forward { claiming, targets }
        }
    };

    match plan {
        DeletePlan::Applied {
            payload_clock,
            shard,
            shard_peers,
        } => {
            let (acks, dead) = replica
                .peers
                .replicate_delete(
                    &shard_peers,
                    &key,
                    &ReplicatedDelete {
                        causal_metadata: payload_clock,
                        from_shard: shard,
                    },
                )
                .await;
            let clock = {
                let mut state = replica.state.write().await;
                for ack in &acks {
                    state.clock.merge(ack);
                }
                state.clock.clone()
            };
            replica.evict_unreachable(dead).await;

            let view_peers = {
                let state = replica.state.read().await;
                state.view_peers(&replica.address)
            };
            replica.peers.blast_clock(&view_peers, &clock).await;
            info!("deleted {}", key);
            Ok((
                StatusCode::OK,
                to_body(&WriteResponse {
                    result: "deleted",
                    causal_metadata: clock,
                    shard_id: None,
                }),
            ))
        }
        DeletePlan::Forward { claiming, targets } => {
            debug!("forwarding DELETE {} to shard {}", key, claiming);
            let (status, body) = replica
                .peers
                .forward_delete(&targets, &key, &client_clock)
                .await?;
            let clock = {
                let mut state = replica.state.write().await;
                if let Some(keys) = state.key_locations.get_mut(&claiming) {
                    keys.remove(&key);
                }
                if let Ok(ack) = serde_json::from_value::<ReplicatedDeleteAck>(body.clone()) {
                    state.clock.merge(&ack.causal_metadata);
                }
                state.clock.clone()
            };
            let view_peers = {
                let state = replica.state.read().await;
                state.view_peers(&replica.address)
            };
            replica.peers.blast_clock(&view_peers, &clock).await;
            Ok((
                status,
                to_body(&WriteResponse {
                    result: "deleted",
                    causal_metadata: clock,
                    shard_id: None,
                }),
            ))
        }
    }
}

// Peer-side application of replicated writes ----------------------------

/// Handler body for a forwarded intra-shard PUT: merge the carried clock,
/// apply the value, and push the updated clock to the view. The originator
/// already passed the causal gate, so no re-check happens here.
pub async fn apply_replicated_put(
    replica: &Replica,
    key: String,
    payload: ReplicatedPut,
) -> AppResult<(StatusCode, Value)> {
    validate_key(&key)?;

    let (created, clock, view_peers) = {
        let mut state = replica.state.write().await;
        state.clock.merge(&payload.causal_metadata);
        let created = !state.store.contains_key(&key);
        state.store.insert(key.clone(), payload.value);
        if created {
            let shard = state.self_shard.clone();
            state
                .key_locations
                .entry(shard)
                .or_default()
                .insert(key.clone());
        }
        (
            created,
            state.clock.clone(),
            state.view_peers(&replica.address),
        )
    };

    replica.peers.blast_clock(&view_peers, &clock).await;

    let (status, result) = if created {
        (StatusCode::CREATED, "created")
    } else {
        (StatusCode::OK, "replaced")
    };
    Ok((
        status,
        to_body(&WriteResponse {
            result,
            causal_metadata: clock,
            shard_id: None,
        }),
    ))
}

/// Handler body for a forwarded intra-shard DELETE. The originator's entry
/// advances before the merge so a higher incoming value is never overwritten,
/// and the carried clock must be covered before the key is dropped.
pub async fn apply_replicated_delete(
    replica: &Replica,
    key: String,
    from: String,
    payload: ReplicatedDelete,
) -> AppResult<(StatusCode, Value)> {
    validate_key(&key)?;

    let (clock, view_peers) = {
        let mut state = replica.state.write().await;
        state.clock.increment(&from);
        state.clock.merge(&payload.causal_metadata);
        if !payload.causal_metadata.leq(&state.clock) {
            return Err(AppError::CausalNotReady);
        }
        state.store.remove(&key);
        if let Some(keys) = state.key_locations.get_mut(&payload.from_shard) {
            keys.remove(&key);
        }
        (
            state.clock.clone(),
            state.view_peers(&replica.address),
        )
    };

    replica.peers.blast_clock(&view_peers, &clock).await;

    Ok((
        StatusCode::OK,
        to_body(&ReplicatedDeleteAck {
            result: "deleted".to_string(),
            causal_metadata: clock,
        }),
    ))
}
