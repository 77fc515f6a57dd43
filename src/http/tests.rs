use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::{RwLock, watch};
use tower::util::ServiceExt;

use crate::{
    http::{AppState, build_router},
    raft::{app::LocalRaft, types::NodeMeta},
    state::ClusterStore,
};

fn app(tmp: &TempDir) -> (axum::Router, Arc<RwLock<ClusterStore>>) {
    let store = Arc::new(RwLock::new(ClusterStore::load_or_init(tmp.path()).unwrap()));

    let mut metrics = openraft::RaftMetrics::new_initial(1);
    metrics.current_term = 1;
    metrics.state = openraft::ServerState::Leader;
    metrics.current_leader = Some(1);
    let nodes = BTreeMap::from([(
        1,
        NodeMeta::single_listener("node-1", "http://127.0.0.1:8090"),
    )]);
    let membership =
        openraft::Membership::new(vec![std::collections::BTreeSet::from([1])], nodes);
    metrics.membership_config = Arc::new(openraft::StoredMembership::new(None, membership));
    let (_tx, rx) = watch::channel(metrics);

    let state = AppState {
        node_id: 1,
        node_name: "node-1".to_string(),
        store: store.clone(),
        raft: Arc::new(LocalRaft::new("node-1", store.clone(), rx)),
    };
    (build_router(state, None), store)
}

fn req(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn req_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn command(name: &str, payload: Value) -> Value {
    json!({ "name": name, "payload": payload })
}

#[tokio::test]
async fn health_and_cluster_info() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _store) = app(&tmp);

    let res = app.clone().oneshot(req("GET", "/api/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await, json!({ "status": "ok" }));

    let res = app.oneshot(req("GET", "/api/cluster/info")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["role"], "leader");
    assert_eq!(body["leader_id"], 1);
    assert_eq!(body["node_name"], "node-1");
}

#[tokio::test]
async fn lists_registered_commands() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _store) = app(&tmp);

    let res = app.oneshot(req("GET", "/api/commands")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 12);
    assert!(items.contains(&json!("create_db")));
    assert!(items.contains(&json!("raft:join")));
}

#[tokio::test]
async fn create_db_then_duplicate_conflicts() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, store) = app(&tmp);
    let body = command("create_db", json!({ "name": "metrics", "replicationFactor": 2 }));

    let res = app
        .clone()
        .oneshot(req_json("POST", "/api/commands", body.clone()))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await, json!({ "type": "applied" }));

    let res = app
        .clone()
        .oneshot(req_json("POST", "/api/commands", body))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(res).await["error"]["code"], "conflict");

    let res = app.oneshot(req("GET", "/api/cluster/config")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let config = body_json(res).await;
    assert_eq!(config["databases"]["metrics"]["replication_factor"], 2);
    assert_eq!(
        store.read().await.config().database("metrics").unwrap().replication_factor,
        2
    );
}

#[tokio::test]
async fn unknown_command_is_rejected_before_proposal() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, store) = app(&tmp);

    let res = app
        .oneshot(req_json(
            "POST",
            "/api/commands",
            command("rename_db", json!({ "name": "x" })),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert_eq!(body["error"]["code"], "invalid_request");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("rename_db")
    );
    assert!(store.read().await.config().databases.is_empty());
}

#[tokio::test]
async fn missing_database_maps_to_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _store) = app(&tmp);

    let res = app
        .oneshot(req_json(
            "POST",
            "/api/commands",
            command("drop_db", json!({ "name": "nope" })),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(res).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn malformed_body_is_invalid_request() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _store) = app(&tmp);

    let res = app
        .oneshot(req_json("POST", "/api/commands", json!({ "payload": {} })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(res).await["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn join_returns_assigned_peer() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _store) = app(&tmp);
    let join = json!({
        "name": "node-2",
        "connection_string": "http://node-2:8090",
        "protobuf_connection_string": "node-2:8099"
    });

    let res = app
        .clone()
        .oneshot(req_json("POST", "/api/cluster/join", join.clone()))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["type"], "joined");
    assert_eq!(body["peer"]["name"], "node-2");
    let node_id = body["peer"]["node_id"].clone();

    let res = app
        .clone()
        .oneshot(req_json("POST", "/api/cluster/join", join))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["peer"]["node_id"], node_id);

    let res = app
        .oneshot(req_json(
            "POST",
            "/api/cluster/join",
            json!({ "name": "node-2", "connection_string": "http://other:8090" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _store) = app(&tmp);

    let res = app.oneshot(req("GET", "/api/nope")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(res).await["error"]["code"], "not_found");
}
