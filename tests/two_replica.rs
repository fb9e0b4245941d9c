// End-to-end scenarios over real HTTP: each test boots a small cluster on
// ephemeral localhost ports and drives it through the client surface.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

use replikv::config::Config;
use replikv::infrastructure::replica::Replica;
use replikv::server;

struct Cluster {
    addresses: Vec<String>,
    client: reqwest::Client,
}

impl Cluster {
    /// Reserve n ports, then start every replica with the full view. Each
    /// replica's identity is its reserved 127.0.0.1 address.
    async fn start(n: usize, shard_count: Option<usize>) -> Self {
        let mut listeners = Vec::new();
        let mut addresses = Vec::new();
        for _ in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
            listeners.push(listener);
            addresses.push(address);
        }
        for (listener, address) in listeners.into_iter().zip(&addresses) {
            let config = Config {
                socket_address: address.clone(),
                view: addresses.clone(),
                shard_count,
            };
            let replica = Arc::new(Replica::new(&config).unwrap());
            let app = server::router(replica.clone());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            replica.bootstrap().await;
        }
        Self {
            addresses,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, replica: usize, path: &str) -> String {
        format!("http://{}{}", self.addresses[replica], path)
    }

    async fn put_kv(&self, replica: usize, key: &str, value: Value, metadata: Value) -> (u16, Value) {
        let res = self
            .client
            .put(self.url(replica, &format!("/kvs/{}", key)))
            .json(&json!({ "value": value, "causal-metadata": metadata }))
            .send()
            .await
            .unwrap();
        (res.status().as_u16(), res.json().await.unwrap())
    }

    async fn get_kv(&self, replica: usize, key: &str, metadata: Value) -> (u16, Value) {
        let res = self
            .client
            .get(self.url(replica, &format!("/kvs/{}", key)))
            .json(&json!({ "causal-metadata": metadata }))
            .send()
            .await
            .unwrap();
        (res.status().as_u16(), res.json().await.unwrap())
    }

    async fn delete_kv(&self, replica: usize, key: &str, metadata: Value) -> (u16, Value) {
        let res = self
            .client
            .delete(self.url(replica, &format!("/kvs/{}", key)))
            .json(&json!({ "causal-metadata": metadata }))
            .send()
            .await
            .unwrap();
        (res.status().as_u16(), res.json().await.unwrap())
    }

    async fn get_json(&self, replica: usize, path: &str) -> Value {
        self.client
            .get(self.url(replica, path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_at_one_replica_reads_at_the_other() {
    let cluster = Cluster::start(2, Some(1)).await;

    let (status, body) = cluster
        .put_kv(0, "foo", json!("bar"), json!({}))
        .await;
    assert_eq!(status, 201);
    assert_eq!(body["result"], "created");
    assert_eq!(body["shard-id"], "s0");
    let metadata = body["causal-metadata"].clone();
    assert_eq!(metadata[&cluster.addresses[0]], 1);

    let (status, body) = cluster.get_kv(1, "foo", metadata).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], "found");
    assert_eq!(body["value"], "bar");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unseen_causal_dependencies_block_with_503() {
    let cluster = Cluster::start(2, Some(1)).await;

    let stale = json!({ (cluster.addresses[0].as_str()): 5 });
    let (status, body) = cluster.get_kv(1, "foo", stale).await;
    assert_eq!(status, 503);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Causal dependencies not satisfied"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlong_keys_and_missing_values_are_rejected() {
    let cluster = Cluster::start(2, Some(1)).await;

    let long_key = "k".repeat(51);
    let (status, _) = cluster.put_kv(0, &long_key, json!("v"), json!({})).await;
    assert_eq!(status, 400);

    let res = cluster
        .client
        .put(cluster.url(0, "/kvs/foo"))
        .json(&json!({ "causal-metadata": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_at_one_replica_is_observed_at_the_other() {
    let cluster = Cluster::start(2, Some(1)).await;

    let (_, body) = cluster.put_kv(0, "k", json!("v"), json!({})).await;
    let metadata = body["causal-metadata"].clone();

    let (status, body) = cluster.delete_kv(1, "k", metadata).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], "deleted");
    let metadata = body["causal-metadata"].clone();

    let (status, _) = cluster.get_kv(0, "k", metadata).await;
    assert_eq!(status, 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reshard_below_the_fault_tolerance_floor_is_refused() {
    let cluster = Cluster::start(3, Some(1)).await;

    let res = cluster
        .client
        .put(cluster.url(0, "/shard/reshard"))
        .json(&json!({ "shard-count": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    let body: Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("fault tolerance"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reshard_redistributes_every_key() {
    let cluster = Cluster::start(4, Some(1)).await;

    for i in 0..20 {
        let (status, _) = cluster
            .put_kv(0, &format!("key-{}", i), json!(i), json!({}))
            .await;
        assert_eq!(status, 201);
    }

    let res = cluster
        .client
        .put(cluster.url(0, "/shard/reshard"))
        .json(&json!({ "shard-count": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["result"], "resharded");

    // the new topology is visible everywhere and every replica sits in the
    // shard whose member list names it
    for replica in 0..4 {
        let ids = cluster.get_json(replica, "/shard/ids").await;
        assert_eq!(ids["shard-ids"], json!(["s0", "s1"]));

        let own = cluster.get_json(replica, "/shard/node-shard-id").await;
        let shard = own["node-shard-id"].as_str().unwrap().to_string();
        let members = cluster
            .get_json(replica, &format!("/shard/members/{}", shard))
            .await;
        assert!(members["shard-members"]
            .as_array()
            .unwrap()
            .contains(&json!(cluster.addresses[replica].clone())));
    }

    // every key is still readable from any replica
    for i in 0..20 {
        let key = format!("key-{}", i);
        for replica in [0, 3] {
            let (status, body) = cluster.get_kv(replica, &key, json!({})).await;
            assert_eq!(status, 200, "{} unreadable at replica {}", key, replica);
            assert_eq!(body["value"], json!(i));
        }
    }

    // the key-location indexes partition the keyspace
    let s0 = cluster.get_json(0, "/shard/key-count/s0").await;
    let s1 = cluster.get_json(0, "/shard/key-count/s1").await;
    assert_eq!(
        s0["shard-key-count"].as_u64().unwrap() + s1["shard-key-count"].as_u64().unwrap(),
        20
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_churn_keeps_the_survivor_serving() {
    let cluster = Cluster::start(2, Some(1)).await;

    let (status, _) = cluster.put_kv(0, "k", json!("v"), json!({})).await;
    assert_eq!(status, 201);

    let res = cluster
        .client
        .delete(cluster.url(0, "/view"))
        .json(&json!({ "socket-address": cluster.addresses[1].clone() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);

    let (status, body) = cluster.put_kv(0, "k", json!("v2"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], "replaced");

    let (status, body) = cluster.get_kv(0, "k", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], "v2");

    let view = cluster.get_json(0, "/view").await;
    assert_eq!(view["view"], json!([cluster.addresses[0].clone()]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn view_add_is_idempotent_over_http() {
    let cluster = Cluster::start(2, None).await;

    let res = cluster
        .client
        .put(cluster.url(0, "/view"))
        .json(&json!({ "socket-address": cluster.addresses[1].clone() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["result"], "already present");

    let res = cluster
        .client
        .delete(cluster.url(0, "/view"))
        .json(&json!({ "socket-address": "127.0.0.1:9" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsharded_single_replica_serves_the_full_surface() {
    let cluster = Cluster::start(1, None).await;

    let (status, body) = cluster.put_kv(0, "solo", json!(42), json!({})).await;
    assert_eq!(status, 201);
    assert_eq!(body["shard-id"], "s0");

    let (status, body) = cluster.get_kv(0, "solo", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["value"], 42);

    let ids = cluster.get_json(0, "/shard/ids").await;
    assert_eq!(ids["shard-ids"], json!(["s0"]));
}
