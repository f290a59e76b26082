//! HTTP API over a real TCP listener, backed by the mock engine.
//!
//! Run:
//!   cargo test -p devbox-runtime --features test-utils --test http_api

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use devbox_runtime::engine::mock::MockEngine;
use devbox_runtime::identity::SessionAuthority;
use devbox_runtime::principals::PrincipalStore;
use devbox_runtime::reconcile::reconcile_registry;
use devbox_runtime::{
    ApiSettings, AppState, ContainerRegistry, ContainerStatus, LifecycleConfig, LifecycleManager,
    router,
};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const SECRET: &str = "http-api-integration-secret";

struct TestServer {
    addr: std::net::SocketAddr,
    url: String,
    client: Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(engine: Arc<MockEngine>, state_dir: &Path) -> Self {
        let registry = Arc::new(ContainerRegistry::open(state_dir.join("containers.json")).unwrap());
        reconcile_registry(engine.as_ref(), &registry).await.unwrap();

        let lifecycle = Arc::new(LifecycleManager::new(
            engine,
            registry,
            LifecycleConfig::default(),
        ));
        let principals = Arc::new(PrincipalStore::open(state_dir.join("principals.json")).unwrap());
        let authority =
            Arc::new(SessionAuthority::new(Some(SECRET), Duration::from_secs(600)).unwrap());
        let state = AppState::new(lifecycle, principals, authority, ApiSettings::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        Self {
            addr,
            url: format!("http://{addr}"),
            client: Client::new(),
            handle,
        }
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut req = self.client.post(format!("{}{path}", self.url)).json(&body);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str, token: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.url))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn put(&self, path: &str, token: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .put(format!("{}{path}", self.url))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn signup(&self, name: &str) -> String {
        let (status, body) = self
            .post(
                "/auth/signup",
                None,
                json!({
                    "username": name,
                    "email": format!("{name}@example.com"),
                    "password": "s3cret",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["access_token"].as_str().unwrap().to_string()
    }

    async fn login(&self, name: &str) -> String {
        let (status, body) = self
            .post(
                "/auth/login",
                None,
                json!({ "email": format!("{name}@example.com"), "password": "s3cret" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["access_token"].as_str().unwrap().to_string()
    }

    fn stop(self) {
        self.handle.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_container_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    engine.set_exec_result("hello\n", 0);
    let server = TestServer::start(engine.clone(), dir.path()).await;

    let token = server.signup("alice").await;
    let (status, record) = server
        .post("/containers", Some(&token), json!({ "image": "alpine:3" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(record["status"], "running");
    let id = record["engine_id"].as_str().unwrap().to_string();

    let (status, out) = server
        .post(
            &format!("/containers/{id}/exec"),
            Some(&token),
            json!({ "command": ["echo", "hello"] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["output"], "hello\n");
    assert_eq!(out["exitCode"], 0);

    let (status, stopped) = server.put(&format!("/containers/{id}/stop"), &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "exited");
    assert_eq!(engine.state(&id), Some(ContainerStatus::Exited));

    let (status, _) = server
        .post(
            &format!("/containers/{id}/exec"),
            Some(&token),
            json!({ "command": "echo again" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let resp = server
        .client
        .delete(format!("{}/containers/{id}", server.url))
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(engine.container_count(), 0);

    let (_, list) = server.get("/containers", &token).await;
    assert!(list["containers"].as_array().unwrap().is_empty());

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_survives_restart_and_is_reconciled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());

    let first = TestServer::start(engine.clone(), dir.path()).await;
    let token = first.signup("bob").await;
    let (_, kept) = first.post("/containers", Some(&token), json!({})).await;
    let (_, lost) = first.post("/containers", Some(&token), json!({})).await;
    first.stop();

    let kept = kept["engine_id"].as_str().unwrap().to_string();
    let lost = lost["engine_id"].as_str().unwrap().to_string();
    engine.vanish(&lost);

    let second = TestServer::start(engine.clone(), dir.path()).await;
    // Same secret, so the old token is still valid; a fresh login works too.
    let (status, list) = second.get("/containers", &token).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = list["containers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["engine_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![kept.as_str()]);

    let token = second.login("bob").await;
    let (status, _) = second.put(&format!("/containers/{lost}/start"), &token).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    second.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn owners_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let server = TestServer::start(engine.clone(), dir.path()).await;

    let alice = server.signup("carol").await;
    let mallory = server.signup("mallory").await;
    let (_, record) = server.post("/containers", Some(&alice), json!({})).await;
    let id = record["engine_id"].as_str().unwrap().to_string();

    let (status, body) = server.put(&format!("/containers/{id}/stop"), &mallory).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
    assert_eq!(engine.state(&id), Some(ContainerStatus::Running));

    let (_, list) = server.get("/containers", &mallory).await;
    assert!(list["containers"].as_array().unwrap().is_empty());

    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_session_relays_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let server = TestServer::start(engine.clone(), dir.path()).await;

    let token = server.signup("dave").await;
    let (_, record) = server.post("/containers", Some(&token), json!({})).await;
    let id = record["engine_id"].as_str().unwrap().to_string();

    let url = format!("ws://{}/containers/{id}/session?token={token}", server.addr);
    let (mut ws, response) = connect_async(url).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);

    let mut ends = engine.take_session_ends().unwrap();
    assert_eq!(ends.engine_id, id);

    ws.send(WsMessage::Binary(Bytes::from_static(b"x"))).await.unwrap();
    let mut typed = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(5), ends.input_rx.read_exact(&mut typed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&typed, b"x");

    ends.output_tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(&frame[..], b"a");

    // Closing the client tears the relay down and releases the attachment.
    ws.close(None).await.unwrap();
    drop(ws);
    tokio::time::timeout(Duration::from_secs(5), ends.output_tx.closed())
        .await
        .unwrap();

    server.stop();
}
