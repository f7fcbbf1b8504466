//! End-to-end tests for the cloak request workflow
//!
//! Drives the WebSocket command surface the way connected clients do: contacts
//! submit requests, administrators list and resolve them, and target sessions
//! see their displayed host change.

use std::net::SocketAddr;

use axum::{routing::get, Router};
use cloakserv::cloak::service::{MD_CLOAK, MD_CLOAK_ASSIGNER, MD_CLOAK_TIMESTAMP};
use cloakserv::store::Store;
use cloakserv::AppState;
use futures::{SinkExt, StreamExt};
use sqlx::sqlite::SqlitePoolOptions;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn setup_server() -> (SocketAddr, Store) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let store = Store::new(pool.clone());

    // One project with bob as contact; alice is the usual target, oper the
    // administrator, mallory an unrelated account.
    let project = store.create_project("Example Project", "proj").await.unwrap();
    let bob = store.create_account("bob").await.unwrap();
    store.create_account("alice").await.unwrap();
    store.create_account("oper").await.unwrap();
    store.create_account("mallory").await.unwrap();
    store.add_contact(project.id, bob.id).await.unwrap();

    let state = AppState::new(pool);

    let app = Router::new()
        .route("/ws", get(cloakserv::websocket::handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    (addr, store)
}

async fn connect_ws(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{}/ws", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws_stream
}

async fn send_msg(ws: &mut WsStream, msg: serde_json::Value) {
    ws.send(Message::Text(msg.to_string().into())).await.unwrap();
}

async fn recv_msg(ws: &mut WsStream) -> serde_json::Value {
    if let Some(Ok(Message::Text(response))) = ws.next().await {
        serde_json::from_str(&response).unwrap()
    } else {
        panic!("Expected text message");
    }
}

/// Attach a connection to an account and consume the reply
async fn attach(ws: &mut WsStream, account: &str, role: &str) -> serde_json::Value {
    send_msg(
        ws,
        serde_json::json!({
            "type": "attach",
            "account": account,
            "role": role,
        }),
    )
    .await;

    let response = recv_msg(ws).await;
    assert_eq!(response["type"], "attached", "attach failed: {}", response);
    response
}

#[tokio::test]
async fn test_full_request_activate_flow() {
    let (addr, store) = setup_server().await;

    let mut ws_alice1 = connect_ws(addr).await;
    let mut ws_alice2 = connect_ws(addr).await;
    let mut ws_bob = connect_ws(addr).await;
    let mut ws_oper = connect_ws(addr).await;

    attach(&mut ws_alice1, "alice", "user").await;
    attach(&mut ws_alice2, "alice", "user").await;
    attach(&mut ws_bob, "bob", "user").await;
    attach(&mut ws_oper, "oper", "admin").await;

    // Bob requests a cloak for alice on behalf of the proj namespace
    send_msg(
        &mut ws_bob,
        serde_json::json!({
            "type": "request",
            "account": "alice",
            "cloak": "proj/contributor.example",
        }),
    )
    .await;

    let response = recv_msg(&mut ws_bob).await;
    assert_eq!(response["type"], "request_queued");
    assert_eq!(response["target"], "alice");
    assert_eq!(response["cloak"], "proj/contributor.example");
    assert_eq!(response["project"], "Example Project");

    // The queue shows exactly one row
    send_msg(&mut ws_oper, serde_json::json!({"type": "waiting"})).await;

    let row = recv_msg(&mut ws_oper).await;
    assert_eq!(row["type"], "pending_request");
    assert_eq!(row["position"], 1);
    assert_eq!(row["target"], "alice");
    assert_eq!(row["cloak"], "proj/contributor.example");
    assert_eq!(row["project"], "Example Project");
    assert_eq!(row["requestor"], "bob");

    let end = recv_msg(&mut ws_oper).await;
    assert_eq!(end["type"], "end_of_list");
    assert_eq!(end["count"], 1);

    // Activation commits the cloak
    send_msg(
        &mut ws_oper,
        serde_json::json!({"type": "activate", "target": "alice"}),
    )
    .await;

    let response = recv_msg(&mut ws_oper).await;
    assert_eq!(response["type"], "activated");
    assert_eq!(response["target"], "alice");
    assert_eq!(response["cloak"], "proj/contributor.example");

    // Both of alice's live sessions are pushed the new host
    let pushed = recv_msg(&mut ws_alice1).await;
    assert_eq!(pushed["type"], "host_changed");
    assert_eq!(pushed["host"], "proj/contributor.example");

    let pushed = recv_msg(&mut ws_alice2).await;
    assert_eq!(pushed["type"], "host_changed");
    assert_eq!(pushed["host"], "proj/contributor.example");

    // Metadata carries the durable trace
    let alice = store.account_by_name("alice").await.unwrap().unwrap();
    assert_eq!(
        store.metadata_get(alice.id, MD_CLOAK).await.unwrap(),
        Some("proj/contributor.example".to_string())
    );
    assert_eq!(
        store.metadata_get(alice.id, MD_CLOAK_ASSIGNER).await.unwrap(),
        Some("oper".to_string())
    );
    let timestamp = store
        .metadata_get(alice.id, MD_CLOAK_TIMESTAMP)
        .await
        .unwrap()
        .unwrap();
    assert!(timestamp.parse::<i64>().unwrap() > 0);

    // The queue is empty again
    send_msg(&mut ws_oper, serde_json::json!({"type": "waiting"})).await;
    let end = recv_msg(&mut ws_oper).await;
    assert_eq!(end["type"], "end_of_list");
    assert_eq!(end["count"], 0);
}

#[tokio::test]
async fn test_request_requires_contact_relationship() {
    let (addr, _store) = setup_server().await;

    let mut ws_mallory = connect_ws(addr).await;
    let mut ws_oper = connect_ws(addr).await;
    attach(&mut ws_mallory, "mallory", "user").await;
    attach(&mut ws_oper, "oper", "admin").await;

    send_msg(
        &mut ws_mallory,
        serde_json::json!({
            "type": "request",
            "account": "alice",
            "cloak": "proj/contributor.example",
        }),
    )
    .await;

    let response = recv_msg(&mut ws_mallory).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "forbidden");

    // Nothing entered the queue
    send_msg(&mut ws_oper, serde_json::json!({"type": "waiting"})).await;
    let end = recv_msg(&mut ws_oper).await;
    assert_eq!(end["type"], "end_of_list");
    assert_eq!(end["count"], 0);
}

#[tokio::test]
async fn test_request_requires_attached_account() {
    let (addr, _store) = setup_server().await;

    let mut ws = connect_ws(addr).await;
    send_msg(
        &mut ws,
        serde_json::json!({
            "type": "request",
            "account": "alice",
            "cloak": "proj/contributor.example",
        }),
    )
    .await;

    let response = recv_msg(&mut ws).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "forbidden");
}

#[tokio::test]
async fn test_privileged_commands_require_admin() {
    let (addr, _store) = setup_server().await;

    let mut ws_bob = connect_ws(addr).await;
    attach(&mut ws_bob, "bob", "user").await;

    for msg in [
        serde_json::json!({"type": "waiting"}),
        serde_json::json!({"type": "activate", "target": "alice"}),
        serde_json::json!({"type": "reject", "target": "alice"}),
    ] {
        send_msg(&mut ws_bob, msg).await;
        let response = recv_msg(&mut ws_bob).await;
        assert_eq!(response["type"], "error");
        assert_eq!(response["kind"], "forbidden");
    }
}

#[tokio::test]
async fn test_request_missing_params_includes_syntax_hint() {
    let (addr, _store) = setup_server().await;

    let mut ws_bob = connect_ws(addr).await;
    attach(&mut ws_bob, "bob", "user").await;

    send_msg(
        &mut ws_bob,
        serde_json::json!({"type": "request", "account": "alice"}),
    )
    .await;

    let response = recv_msg(&mut ws_bob).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "missing_params");
    assert_eq!(response["detail"], "Syntax: request <account> <cloak>");
}

#[tokio::test]
async fn test_reject_drops_request_without_committing() {
    let (addr, store) = setup_server().await;

    let mut ws_bob = connect_ws(addr).await;
    let mut ws_oper = connect_ws(addr).await;
    attach(&mut ws_bob, "bob", "user").await;
    attach(&mut ws_oper, "oper", "admin").await;

    send_msg(
        &mut ws_bob,
        serde_json::json!({
            "type": "request",
            "account": "alice",
            "cloak": "proj/contributor.example",
        }),
    )
    .await;
    let response = recv_msg(&mut ws_bob).await;
    assert_eq!(response["type"], "request_queued");

    // Reject by display position
    send_msg(
        &mut ws_oper,
        serde_json::json!({"type": "reject", "target": "1"}),
    )
    .await;

    let response = recv_msg(&mut ws_oper).await;
    assert_eq!(response["type"], "rejected");
    assert_eq!(response["target"], "alice");

    // No durable trace was written
    let alice = store.account_by_name("alice").await.unwrap().unwrap();
    assert!(store.metadata_get(alice.id, MD_CLOAK).await.unwrap().is_none());

    // The request is gone for activation too
    send_msg(
        &mut ws_oper,
        serde_json::json!({"type": "activate", "target": "alice"}),
    )
    .await;
    let response = recv_msg(&mut ws_oper).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "not_found");
}

#[tokio::test]
async fn test_attach_applies_previously_assigned_cloak() {
    let (addr, store) = setup_server().await;

    let alice = store.account_by_name("alice").await.unwrap().unwrap();
    store
        .metadata_set(alice.id, MD_CLOAK, "proj/contributor.example")
        .await
        .unwrap();

    let mut ws = connect_ws(addr).await;
    let response = attach(&mut ws, "alice", "user").await;
    assert_eq!(response["visible_host"], "proj/contributor.example");
}

#[tokio::test]
async fn test_attach_unknown_account() {
    let (addr, _store) = setup_server().await;

    let mut ws = connect_ws(addr).await;
    send_msg(
        &mut ws,
        serde_json::json!({"type": "attach", "account": "ghost", "role": "user"}),
    )
    .await;

    let response = recv_msg(&mut ws).await;
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "not_found");
}
