// HTTP surface: the client endpoints under /kvs, /view, and /shard, and the
// replica-to-replica endpoints their fan-out targets. Handlers stay thin and
// delegate to the coordinator, replica, and sharding modules.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::error::{AppError, AppResult};
use crate::infrastructure::coordinator;
use crate::infrastructure::messages::{
    ClockUpdate, KeyLocationMerge, KeyLocationUpdate, NodeShardIdResponse, ReadRequest,
    ReplicatedDelete, ReplicatedPut, ReshardNotice, ReshardRequest, ResultMessage,
    ShardIdsResponse, ShardKeyCountResponse, ShardMembersResponse, StoreMerge, TransferMessage,
    ViewChangeRequest, ViewResponse, WriteRequest,
};
use crate::infrastructure::replica::Replica;
use crate::infrastructure::sharding;

pub fn router(replica: Arc<Replica>) -> Router {
    Router::new()
        // client surface
        .route(
            "/kvs/{key}",
            put(kvs_put).get(kvs_get).delete(kvs_delete),
        )
        .route("/view", put(view_put).get(view_get).delete(view_delete))
        .route("/shard/ids", get(shard_ids))
        .route("/shard/node-shard-id", get(node_shard_id))
        .route("/shard/members/{id}", get(shard_members))
        .route("/shard/key-count/{id}", get(shard_key_count))
        .route("/shard/add-member/{id}", put(shard_add_member))
        .route("/shard/reshard", put(shard_reshard))
        // replica-to-replica surface
        .route("/viewed", put(viewed_put).delete(viewed_delete))
        .route("/existinginfo", get(existing_info))
        .route(
            "/reptorep/{key}/{from}",
            put(replicated_put).delete(replicated_delete),
        )
        .route("/reptorep/updatevc", put(update_clock))
        .route("/reptorep/updatemap/{key}", put(update_key_location))
        .route("/reptorep/remap", put(remap))
        .route("/reptorep/updated_store", put(updated_store))
        .route("/reptorep/updated_map", put(updated_map))
        .route("/shard/addmemberincoming", put(add_member_incoming))
        .route("/shard/blast_reshard", put(blast_reshard))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(replica)
}

// Key-value operations --------------------------------------------------

async fn kvs_put(
    State(replica): State<Arc<Replica>>,
    Path(key): Path<String>,
    Json(request): Json<WriteRequest>,
) -> AppResult<Response> {
    let (status, body) = coordinator::put(&replica, key, request).await?;
    Ok((status, Json(body)).into_response())
}

async fn kvs_get(
    State(replica): State<Arc<Replica>>,
    Path(key): Path<String>,
    request: Option<Json<ReadRequest>>,
) -> AppResult<Response> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let (status, body) = coordinator::get(&replica, key, request).await?;
    Ok((status, Json(body)).into_response())
}

async fn kvs_delete(
    State(replica): State<Arc<Replica>>,
    Path(key): Path<String>,
    request: Option<Json<ReadRequest>>,
) -> AppResult<Response> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let (status, body) = coordinator::delete(&replica, key, request).await?;
    Ok((status, Json(body)).into_response())
}

// View operations -------------------------------------------------------

async fn view_put(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<ViewChangeRequest>,
) -> impl IntoResponse {
    if replica.view_add(&request.socket_address).await {
        (StatusCode::CREATED, Json(ResultMessage::new("added")))
    } else {
        (StatusCode::OK, Json(ResultMessage::new("already present")))
    }
}

async fn view_get(State(replica): State<Arc<Replica>>) -> impl IntoResponse {
    Json(ViewResponse {
        view: replica.view_members().await,
    })
}

async fn view_delete(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<ViewChangeRequest>,
) -> AppResult<Json<ResultMessage>> {
    replica.view_remove(&request.socket_address).await?;
    Ok(Json(ResultMessage::new("deleted")))
}

async fn viewed_put(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<ViewChangeRequest>,
) -> impl IntoResponse {
    if replica.apply_view_add(&request.socket_address).await {
        (StatusCode::CREATED, Json(ResultMessage::new("added")))
    } else {
        (StatusCode::OK, Json(ResultMessage::new("already present")))
    }
}

async fn viewed_delete(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<ViewChangeRequest>,
) -> AppResult<Json<ResultMessage>> {
    replica.apply_view_remove(&request.socket_address).await?;
    Ok(Json(ResultMessage::new("deleted")))
}

// Shard operations ------------------------------------------------------

async fn shard_ids(State(replica): State<Arc<Replica>>) -> impl IntoResponse {
    let state = replica.state.read().await;
    Json(ShardIdsResponse {
        shard_ids: state.shard_table.keys().cloned().collect(),
    })
}

async fn node_shard_id(State(replica): State<Arc<Replica>>) -> impl IntoResponse {
    let state = replica.state.read().await;
    Json(NodeShardIdResponse {
        node_shard_id: state.self_shard.clone(),
    })
}

async fn shard_members(
    State(replica): State<Arc<Replica>>,
    Path(id): Path<String>,
) -> AppResult<Json<ShardMembersResponse>> {
    let state = replica.state.read().await;
    let members = state
        .shard_table
        .get(&id)
        .ok_or_else(|| AppError::NotFound("Shard does not exist".to_string()))?;
    Ok(Json(ShardMembersResponse {
        shard_members: members.clone(),
    }))
}

async fn shard_key_count(
    State(replica): State<Arc<Replica>>,
    Path(id): Path<String>,
) -> AppResult<Json<ShardKeyCountResponse>> {
    let state = replica.state.read().await;
    if !state.shard_table.contains_key(&id) {
        return Err(AppError::NotFound("Shard does not exist".to_string()));
    }
    let count = state
        .key_locations
        .get(&id)
        .map(|keys| keys.len())
        .unwrap_or(0);
    Ok(Json(ShardKeyCountResponse {
        shard_key_count: count,
    }))
}

async fn shard_add_member(
    State(replica): State<Arc<Replica>>,
    Path(id): Path<String>,
    Json(request): Json<ViewChangeRequest>,
) -> AppResult<Json<ResultMessage>> {
    sharding::add_member(&replica, &id, &request.socket_address).await?;
    Ok(Json(ResultMessage::new("node added to shard")))
}

async fn shard_reshard(
    State(replica): State<Arc<Replica>>,
    Json(request): Json<ReshardRequest>,
) -> AppResult<Json<ResultMessage>> {
    let count = request.shard_count.ok_or_else(|| {
        AppError::BadRequest("reshard request does not specify a shard count".to_string())
    })?;
    sharding::reshard(&replica, count).await?;
    Ok(Json(ResultMessage::new("resharded")))
}

// Replica-to-replica handlers -------------------------------------------

async fn existing_info(State(replica): State<Arc<Replica>>) -> impl IntoResponse {
    Json(replica.state_snapshot().await)
}

async fn replicated_put(
    State(replica): State<Arc<Replica>>,
    Path((key, _from)): Path<(String, String)>,
    Json(payload): Json<ReplicatedPut>,
) -> AppResult<Response> {
    let (status, body) = coordinator::apply_replicated_put(&replica, key, payload).await?;
    Ok((status, Json(body)).into_response())
}

async fn replicated_delete(
    State(replica): State<Arc<Replica>>,
    Path((key, from)): Path<(String, String)>,
    Json(payload): Json<ReplicatedDelete>,
) -> AppResult<Response> {
    let (status, body) =
        coordinator::apply_replicated_delete(&replica, key, from, payload).await?;
    Ok((status, Json(body)).into_response())
}

async fn update_clock(
    State(replica): State<Arc<Replica>>,
    Json(update): Json<ClockUpdate>,
) -> impl IntoResponse {
    replica.merge_clock(&update.vc).await;
    Json(ResultMessage::new("clock merged"))
}

async fn update_key_location(
    State(replica): State<Arc<Replica>>,
    Path(key): Path<String>,
    Json(update): Json<KeyLocationUpdate>,
) -> impl IntoResponse {
    replica.record_key_location(&update.shard, &key).await;
    Json(ResultMessage::new("key location recorded"))
}

async fn remap(State(replica): State<Arc<Replica>>) -> impl IntoResponse {
    sharding::remap_local(&replica).await;
    Json(ResultMessage::new("remap complete"))
}

async fn updated_store(
    State(replica): State<Arc<Replica>>,
    Json(merge): Json<StoreMerge>,
) -> impl IntoResponse {
    sharding::merge_store(&replica, merge).await;
    Json(ResultMessage::new("store merged"))
}

async fn updated_map(
    State(replica): State<Arc<Replica>>,
    Json(merge): Json<KeyLocationMerge>,
) -> impl IntoResponse {
    sharding::merge_key_locations(&replica, merge).await;
    Json(ResultMessage::new("key locations merged"))
}

async fn add_member_incoming(
    State(replica): State<Arc<Replica>>,
    Json(transfer): Json<TransferMessage>,
) -> impl IntoResponse {
    sharding::apply_incoming_member(&replica, transfer).await;
    Json(ResultMessage::new("member recorded"))
}

async fn blast_reshard(
    State(replica): State<Arc<Replica>>,
    Json(notice): Json<ReshardNotice>,
) -> impl IntoResponse {
    sharding::apply_reshard_notice(&replica, notice).await;
    Json(ResultMessage::new("resharded"))
}
