// Outbound replica-to-replica HTTP. Every call carries a bounded timeout and
// failures are absorbed here: transport errors are logged and reported back
// as data (dead-peer lists, missing acks), never as HTTP failures of the
// request that triggered the fan-out.

use axum::http::StatusCode;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::infrastructure::messages::{
    ClockUpdate, KeyLocationMerge, KeyLocationUpdate, ReplicatedDelete, ReplicatedDeleteAck,
    ReplicatedPut, ReshardNotice, StateSnapshot, StoreMerge, TransferMessage, ViewChangeRequest,
};
use crate::infrastructure::vector_clock::VectorClock;

const VIEW_OP_TIMEOUT: Duration = Duration::from_millis(500);
const STATE_PULL_TIMEOUT: Duration = Duration::from_millis(500);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);
const FORWARD_DELETE_TIMEOUT: Duration = Duration::from_millis(500);
const REPLICATE_PUT_TIMEOUT: Duration = Duration::from_millis(900);
const REPLICATE_DELETE_TIMEOUT: Duration = Duration::from_millis(1000);
const TRANSFER_TIMEOUT: Duration = Duration::from_millis(700);
const BLAST_TIMEOUT: Duration = Duration::from_millis(2500);
const RESHARD_NOTICE_TIMEOUT: Duration = Duration::from_millis(1500);
const REMAP_TIMEOUT: Duration = Duration::from_secs(4);
const STORE_MERGE_TIMEOUT: Duration = Duration::from_millis(1500);
const MAP_MERGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection attempts per shard peer on the replication path before the
/// peer is reported unreachable.
const REPLICATION_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    self_address: String,
}

impl PeerClient {
    pub fn new(self_address: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            self_address: self_address.into(),
        }
    }

    fn url(peer: &str, path: &str) -> String {
        format!("http://{}{}", peer, path)
    }

    /// PUT a body to the same path on every peer, ignoring failures.
    async fn broadcast_put<T: Serialize>(
        &self,
        peers: &[String],
        path: &str,
        body: &T,
        timeout: Duration,
        what: &str,
    ) {
        let sends = peers.iter().map(|peer| {
            let url = Self::url(peer, path);
            async move {
                match self.http.put(&url).timeout(timeout).json(body).send().await {
                    Ok(res) if res.status().is_success() => {
                        debug!("{} broadcast to {} acknowledged", what, peer)
                    }
                    Ok(res) => warn!("{} broadcast to {} returned {}", what, peer, res.status()),
                    Err(err) => warn!("{} broadcast to {} failed: {}", what, peer, err),
                }
            }
        });
        join_all(sends).await;
    }

    // View management ---------------------------------------------------

    /// Announce an address to every peer's view (used both for the startup
    /// self-announcement and for view-add fan-out).
    pub async fn blast_view_add(&self, peers: &[String], address: &str) {
        let body = ViewChangeRequest {
            socket_address: address.to_string(),
        };
        self.broadcast_put(peers, "/viewed", &body, VIEW_OP_TIMEOUT, "view-add")
            .await;
    }

    pub async fn blast_view_delete(&self, peers: &[String], address: &str) {
        let body = ViewChangeRequest {
            socket_address: address.to_string(),
        };
        let sends = peers.iter().map(|peer| {
            let url = Self::url(peer, "/viewed");
            let body = &body;
            async move {
                match self
                    .http
                    .delete(&url)
                    .timeout(VIEW_OP_TIMEOUT)
                    .json(body)
                    .send()
                    .await
                {
                    Ok(_) => debug!("view-delete broadcast to {} delivered", peer),
                    Err(err) => warn!("view-delete broadcast to {} failed: {}", peer, err),
                }
            }
        });
        join_all(sends).await;
    }

    /// Ask the given peers, in order, for their store and clock; adopt the
    /// first response that arrives.
    pub async fn pull_state(&self, peers: &[String]) -> Option<StateSnapshot> {
        for peer in peers {
            let url = Self::url(peer, "/existinginfo");
            match self
                .http
                .get(&url)
                .timeout(STATE_PULL_TIMEOUT)
                .send()
                .await
            {
                Ok(res) if res.status().is_success() => match res.json().await {
                    Ok(snapshot) => return Some(snapshot),
                    Err(err) => warn!("state pull from {} returned bad body: {}", peer, err),
                },
                Ok(res) => warn!("state pull from {} returned {}", peer, res.status()),
                Err(err) => debug!("state pull from {} failed: {}", peer, err),
            }
        }
        None
    }

    // Causal metadata fan-out -------------------------------------------

    pub async fn blast_clock(&self, peers: &[String], clock: &VectorClock) {
        let body = ClockUpdate { vc: clock.clone() };
        self.broadcast_put(peers, "/reptorep/updatevc", &body, BLAST_TIMEOUT, "clock")
            .await;
    }

    pub async fn blast_key_location(&self, peers: &[String], key: &str, shard: &str) {
        let body = KeyLocationUpdate {
            shard: shard.to_string(),
        };
        let path = format!("/reptorep/updatemap/{}", key);
        self.broadcast_put(peers, &path, &body, BLAST_TIMEOUT, "key-location")
            .await;
    }

    // Cross-shard forwarding --------------------------------------------

    /// Relay a client PUT to a replica of the owning shard and hand back its
    /// status and body verbatim.
    pub async fn forward_put(
        &self,
        peer: &str,
        key: &str,
        value: &Value,
        clock: &VectorClock,
    ) -> AppResult<(StatusCode, Value)> {
        let url = Self::url(peer, &format!("/kvs/{}", key));
        let body = serde_json::json!({ "value": value, "causal-metadata": clock });
        self.relay(self.http.put(&url).timeout(FORWARD_TIMEOUT).json(&body), peer)
            .await
    }

    pub async fn forward_get(
        &self,
        peer: &str,
        key: &str,
        clock: &VectorClock,
    ) -> AppResult<(StatusCode, Value)> {
        let url = Self::url(peer, &format!("/kvs/{}", key));
        let body = serde_json::json!({ "causal-metadata": clock });
        self.relay(self.http.get(&url).timeout(FORWARD_TIMEOUT).json(&body), peer)
            .await
    }

    /// Try each replica of the claiming shard in order until one answers the
    /// DELETE with success.
    pub async fn forward_delete(
        &self,
        peers: &[String],
        key: &str,
        clock: &VectorClock,
    ) -> AppResult<(StatusCode, Value)> {
        let body = serde_json::json!({ "causal-metadata": clock });
        for peer in peers {
            let url = Self::url(peer, &format!("/kvs/{}", key));
            match self
                .http
                .delete(&url)
                .timeout(FORWARD_DELETE_TIMEOUT)
                .json(&body)
                .send()
                .await
            {
                Ok(res) if res.status().is_success() => {
                    let status = res.status();
                    let value = res.json().await.unwrap_or(Value::Null);
                    return Ok((status, value));
                }
                Ok(res) => warn!("forwarded DELETE to {} returned {}", peer, res.status()),
                Err(err) => warn!("forwarded DELETE to {} failed: {}", peer, err),
            }
        }
        Err(AppError::Upstream(format!(
            "no replica of the claiming shard answered DELETE {}",
            key
        )))
    }

    async fn relay(
        &self,
        request: reqwest::RequestBuilder,
        peer: &str,
    ) -> AppResult<(StatusCode, Value)> {
        let res = request
            .send()
            .await
            .map_err(|err| AppError::Upstream(format!("{}: {}", peer, err)))?;
        let status = res.status();
        let value = res.json().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    // Intra-shard replication -------------------------------------------

    /// Push a write to every other replica of the shard. Each peer gets
    /// `REPLICATION_ATTEMPTS` tries with a short backoff; peers whose every
    /// attempt fails at the connection level are returned for eviction.
    pub async fn replicate_put(
        &self,
        peers: &[String],
        key: &str,
        payload: &ReplicatedPut,
    ) -> Vec<String> {
        let sends = peers.iter().map(|peer| {
            let url = Self::url(
                peer,
                &format!("/reptorep/{}/{}", key, self.self_address),
            );
            async move {
                self.replication_attempts(peer, || {
                    self.http
                        .put(&url)
                        .timeout(REPLICATE_PUT_TIMEOUT)
                        .json(payload)
                })
                .await
                .err()
            }
        });
        join_all(sends).await.into_iter().flatten().collect()
    }

    /// Push a delete to every other replica of the shard and collect the
    /// clocks their acks carry so the originator can converge.
    pub async fn replicate_delete(
        &self,
        peers: &[String],
        key: &str,
        payload: &ReplicatedDelete,
    ) -> (Vec<VectorClock>, Vec<String>) {
        let sends = peers.iter().map(|peer| {
            let url = Self::url(
                peer,
                &format!("/reptorep/{}/{}", key, self.self_address),
            );
            async move {
                match self
                    .replication_attempts(peer, || {
                        self.http
                            .delete(&url)
                            .timeout(REPLICATE_DELETE_TIMEOUT)
                            .json(payload)
                    })
                    .await
                {
                    Ok(Some(res)) => {
                        let ack: Option<ReplicatedDeleteAck> = res.json().await.ok();
                        (ack.map(|a| a.causal_metadata), None)
                    }
                    Ok(None) => (None, None),
                    Err(dead) => (None, Some(dead)),
                }
            }
        });
        let mut acks = Vec::new();
        let mut dead = Vec::new();
        for (ack, failure) in join_all(sends).await {
            acks.extend(ack);
            dead.extend(failure);
        }
        (acks, dead)
    }

    /// Shared retry loop: `Ok(Some(res))` on success, `Ok(None)` when the
    /// peer answered with an error status (alive, not evicted), `Err(addr)`
    /// when every attempt failed to connect.
    async fn replication_attempts(
        &self,
        peer: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Option<reqwest::Response>, String> {
        let mut connection_failures = 0;
        for attempt in 0..REPLICATION_ATTEMPTS {
            match build().send().await {
                Ok(res) if res.status().is_success() => return Ok(Some(res)),
                Ok(res) => {
                    warn!("replication to {} returned {}", peer, res.status());
                    return Ok(None);
                }
                Err(err) if err.is_connect() => {
                    connection_failures += 1;
                    debug!("replication attempt {} to {} refused: {}", attempt, peer, err);
                }
                Err(err) => warn!("replication attempt {} to {} failed: {}", attempt, peer, err),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        if connection_failures == REPLICATION_ATTEMPTS {
            Err(peer.to_string())
        } else {
            Ok(None)
        }
    }

    // Shard membership and reshard --------------------------------------

    pub async fn send_transfer(&self, peers: &[String], transfer: &TransferMessage) {
        self.broadcast_put(
            peers,
            "/shard/addmemberincoming",
            transfer,
            TRANSFER_TIMEOUT,
            "member-transfer",
        )
        .await;
    }

    pub async fn blast_reshard(&self, peers: &[String], notice: &ReshardNotice) {
        self.broadcast_put(
            peers,
            "/shard/blast_reshard",
            notice,
            RESHARD_NOTICE_TIMEOUT,
            "reshard",
        )
        .await;
    }

    /// Tell every other replica to rehash its local store against the new
    /// ring. Peers run the full rehash-and-push before acknowledging.
    pub async fn send_remap(&self, peers: &[String]) {
        let sends = peers.iter().map(|peer| {
            let url = Self::url(peer, "/reptorep/remap");
            async move {
                match self.http.put(&url).timeout(REMAP_TIMEOUT).send().await {
                    Ok(res) if res.status().is_success() => {
                        debug!("remap at {} complete", peer)
                    }
                    Ok(res) => warn!("remap at {} returned {}", peer, res.status()),
                    Err(err) => warn!("remap at {} failed: {}", peer, err),
                }
            }
        });
        join_all(sends).await;
    }

    pub async fn push_store(&self, peers: &[String], bucket: &StoreMerge) {
        self.broadcast_put(
            peers,
            "/reptorep/updated_store",
            bucket,
            STORE_MERGE_TIMEOUT,
            "store-merge",
        )
        .await;
    }

    pub async fn blast_key_location_map(&self, peers: &[String], map: &KeyLocationMerge) {
        self.broadcast_put(
            peers,
            "/reptorep/updated_map",
            map,
            MAP_MERGE_TIMEOUT,
            "key-location-map",
        )
        .await;
    }
}
