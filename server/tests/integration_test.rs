//! Integration tests for the palaver chat server
//!
//! These spawn the server in-process on a random port and drive it over
//! real HTTP and WebSocket connections.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use palaver_server::app::{App, AppConfig};
use palaver_server::state::SharedState;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE_TIMEOUT: Duration = Duration::from_millis(300);

/// Test server instance
struct TestServer {
    base_url: String,
    client: Client,
    state: SharedState,
}

impl TestServer {
    /// Start a new test server on a random port
    async fn new() -> Self {
        let app = App::new(AppConfig {
            database: ":memory:".to_string(),
            secret: "integration-test-secret".to_string(),
            token_ttl_hours: 24,
        })
        .await
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        let state = app.state.clone();
        let router = app.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            client: Client::new(),
            state,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.base_url.replace("http://", ""))
    }

    /// Register a user with a throwaway display name and password.
    async fn register(&self, username: &str) {
        let response = self
            .client
            .post(self.url("/api/users"))
            .json(&json!({
                "name": format!("{username} display"),
                "username": username,
                "password": "hunter2hunter2",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    /// Sign in and return the session token.
    async fn signin(&self, username: &str) -> String {
        let response = self
            .client
            .post(self.url("/api/auth/signin"))
            .json(&json!({
                "username": username,
                "password": "hunter2hunter2",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    async fn signout(&self, token: &str) {
        let response = self
            .client
            .post(self.url("/api/auth/signout"))
            .header("Cookie", format!("auth_token={token}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
    }

    /// Register and sign in, returning the token.
    async fn register_and_signin(&self, username: &str) -> String {
        self.register(username).await;
        self.signin(username).await
    }

    async fn create_room(&self, token: &str, name: &str) -> String {
        let response = self
            .client
            .post(self.url("/api/rooms"))
            .header("Cookie", format!("auth_token={token}"))
            .json(&json!({ "name": name }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    async fn add_member(&self, token: &str, room_id: &str, username: &str) {
        let response = self
            .client
            .post(self.url(&format!("/api/rooms/{room_id}/members")))
            .header("Cookie", format!("auth_token={token}"))
            .json(&json!({ "username": username, "role": "member" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
    }

    /// Open an authenticated WebSocket connection.
    async fn connect_ws(&self, token: &str) -> WsClient {
        let mut request = self.ws_url().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Cookie", format!("auth_token={token}").parse().unwrap());
        let (socket, _) = connect_async(request).await.unwrap();
        socket
    }
}

/// Send one `{type, payload}` frame.
async fn send_event(socket: &mut WsClient, event_type: &str, payload: Value) {
    let frame = json!({ "type": event_type, "payload": payload }).to_string();
    socket.send(WsMessage::Text(frame)).await.unwrap();
}

/// Receive the next event frame, skipping protocol-level ping/pong.
async fn recv_event(socket: &mut WsClient) -> (String, Value) {
    loop {
        let frame = timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        match frame {
            WsMessage::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                return (
                    value["type"].as_str().unwrap().to_string(),
                    value["payload"].clone(),
                );
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no event frame arrives within a short window.
async fn expect_silence(socket: &mut WsClient) {
    match timeout(SILENCE_TIMEOUT, socket.next()).await {
        Err(_) => {}
        Ok(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_)))) => {}
        Ok(other) => panic!("expected silence, got: {other:?}"),
    }
}

// ── REST surface ──

#[tokio::test]
async fn register_rejects_duplicates_and_bad_input() {
    let server = TestServer::new().await;
    server.register("alice").await;

    let conflict = server
        .client
        .post(server.url("/api/users"))
        .json(&json!({
            "name": "alice again",
            "username": "alice",
            "password": "hunter2hunter2",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);

    let short = server
        .client
        .post(server.url("/api/users"))
        .json(&json!({ "name": "bo display", "username": "bo", "password": "hunter2hunter2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(short.status(), 400);
}

#[tokio::test]
async fn signin_round_trip_and_me() {
    let server = TestServer::new().await;
    let token = server.register_and_signin("alice").await;

    let me = server
        .client
        .get(server.url("/api/users/me"))
        .header("Cookie", format!("auth_token={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), 200);
    let body: Value = me.json().await.unwrap();
    assert_eq!(body["username"], "alice");

    let wrong = server
        .client
        .post(server.url("/api/auth/signin"))
        .json(&json!({ "username": "alice", "password": "not the password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
}

#[tokio::test]
async fn protected_routes_require_token() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/api/users/me"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(server.url("/api/users/me"))
        .header("Cookie", "auth_token=not-a-real-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn signout_revokes_token() {
    let server = TestServer::new().await;
    let token = server.register_and_signin("alice").await;
    server.signout(&token).await;

    let after = server
        .client
        .get(server.url("/api/users/me"))
        .header("Cookie", format!("auth_token={token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), 401);
}

#[tokio::test]
async fn room_history_over_rest() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let bob = server.register_and_signin("bob").await;
    let room_id = server.create_room(&alice, "den").await;
    server.add_member(&alice, &room_id, "bob").await;

    let mut alice_ws = server.connect_ws(&alice).await;
    send_event(
        &mut alice_ws,
        "message",
        json!({ "room_id": room_id, "type": 1, "data": "hello" }),
    )
    .await;
    let (_, payload) = recv_event(&mut alice_ws).await;
    let id = payload["id"].as_i64().unwrap();

    let response = server
        .client
        .get(server.url(&format!("/api/rooms/{room_id}/messages")))
        .header("Cookie", format!("auth_token={bob}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let messages: Value = response.json().await.unwrap();
    assert_eq!(messages[0]["id"].as_i64().unwrap(), id);
    assert_eq!(messages[0]["data"], "hello");

    // Non-members cannot read history.
    let eve = server.register_and_signin("eve").await;
    let response = server
        .client
        .get(server.url(&format!("/api/rooms/{room_id}/messages")))
        .header("Cookie", format!("auth_token={eve}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn my_rooms_lists_joined_rooms() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    server.create_room(&alice, "den").await;
    server.create_room(&alice, "attic").await;

    let response = server
        .client
        .get(server.url("/api/users/me/rooms"))
        .header("Cookie", format!("auth_token={alice}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let rooms: Value = response.json().await.unwrap();
    assert_eq!(rooms.as_array().unwrap().len(), 2);
}

// ── S1: message fan-out ──

#[tokio::test]
async fn message_fan_out_reaches_sender_and_members() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let bob = server.register_and_signin("bob").await;

    let mut alice_ws = server.connect_ws(&alice).await;
    let mut bob_ws = server.connect_ws(&bob).await;

    let room_id = server.create_room(&alice, "den").await;
    server.add_member(&alice, &room_id, "bob").await;

    send_event(
        &mut alice_ws,
        "message",
        json!({ "room_id": room_id, "type": 1, "data": "hi" }),
    )
    .await;

    let (alice_type, alice_payload) = recv_event(&mut alice_ws).await;
    let (bob_type, bob_payload) = recv_event(&mut bob_ws).await;

    assert_eq!(alice_type, "message");
    assert_eq!(bob_type, "message");
    assert_eq!(alice_payload, bob_payload);
    assert!(alice_payload["id"].as_i64().unwrap() > 0);
    assert_eq!(alice_payload["sender"], "alice");
    assert_eq!(alice_payload["data"], "hi");
    assert!(alice_payload["sent_at"].is_string());
}

// ── S2: read receipt ──

#[tokio::test]
async fn read_receipt_fans_out_and_advances_cursor() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let bob = server.register_and_signin("bob").await;

    let mut alice_ws = server.connect_ws(&alice).await;
    let mut bob_ws = server.connect_ws(&bob).await;

    let room_id = server.create_room(&alice, "den").await;
    server.add_member(&alice, &room_id, "bob").await;

    send_event(
        &mut alice_ws,
        "message",
        json!({ "room_id": room_id, "type": 1, "data": "hi" }),
    )
    .await;
    let (_, sent) = recv_event(&mut alice_ws).await;
    recv_event(&mut bob_ws).await;
    let message_id = sent["id"].as_i64().unwrap();

    send_event(&mut bob_ws, "read_message", json!({ "room_id": room_id })).await;

    let (alice_type, alice_payload) = recv_event(&mut alice_ws).await;
    let (bob_type, bob_payload) = recv_event(&mut bob_ws).await;

    assert_eq!(alice_type, "read_message");
    assert_eq!(bob_type, "read_message");
    assert_eq!(alice_payload["last_read_message"].as_i64().unwrap(), message_id);
    assert_eq!(alice_payload["read_by"], "bob");
    assert_eq!(alice_payload, bob_payload);

    let room = server
        .state
        .db
        .get_room_by_id(&room_id)
        .await
        .unwrap()
        .unwrap();
    let member = room.members.iter().find(|m| m.username == "bob").unwrap();
    assert_eq!(member.last_message_read, message_id);
}

#[tokio::test]
async fn read_receipt_with_nothing_to_mark_is_silent() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let mut alice_ws = server.connect_ws(&alice).await;

    let room_id = server.create_room(&alice, "den").await;
    send_event(&mut alice_ws, "read_message", json!({ "room_id": room_id })).await;
    expect_silence(&mut alice_ws).await;
}

// ── S3: presence transitions ──

#[tokio::test]
async fn presence_fires_only_on_zero_crossings() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let bob = server.register_and_signin("bob").await;

    // Friendship = shared room, established before anyone connects.
    let room_id = server.create_room(&alice, "den").await;
    server.add_member(&alice, &room_id, "bob").await;

    let mut alice_ws = server.connect_ws(&alice).await;
    // Nobody else is online; alice hears nothing on connect.
    expect_silence(&mut alice_ws).await;

    let mut bob_ws = server.connect_ws(&bob).await;

    // Cold-start sync tells bob that alice was already online, and alice
    // learns bob came up.
    let (event, payload) = recv_event(&mut bob_ws).await;
    assert_eq!(event, "online");
    assert_eq!(payload["username"], "alice");

    let (event, payload) = recv_event(&mut alice_ws).await;
    assert_eq!(event, "online");
    assert_eq!(payload["username"], "bob");

    // A second session for bob crosses no zero boundary: alice hears
    // nothing, and only the new connection gets the cold-start sync.
    let mut bob_ws2 = server.connect_ws(&bob).await;
    let (event, payload) = recv_event(&mut bob_ws2).await;
    assert_eq!(event, "online");
    assert_eq!(payload["username"], "alice");
    expect_silence(&mut alice_ws).await;

    // Closing both of bob's sessions yields exactly one offline.
    bob_ws.close(None).await.unwrap();
    bob_ws2.close(None).await.unwrap();

    let (event, payload) = recv_event(&mut alice_ws).await;
    assert_eq!(event, "offline");
    assert_eq!(payload["username"], "bob");
    expect_silence(&mut alice_ws).await;
}

#[tokio::test]
async fn is_online_probe_answers_only_the_asker() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    server.register("bob").await;

    let mut alice_ws = server.connect_ws(&alice).await;

    send_event(&mut alice_ws, "is_online", json!({ "username": "bob" })).await;
    let (event, payload) = recv_event(&mut alice_ws).await;
    assert_eq!(event, "offline");
    assert_eq!(payload["username"], "bob");

    let bob = server.signin("bob").await;
    let _bob_ws = server.connect_ws(&bob).await;

    send_event(&mut alice_ws, "is_online", json!({ "username": "bob" })).await;
    let (event, payload) = recv_event(&mut alice_ws).await;
    assert_eq!(event, "online");
    assert_eq!(payload["username"], "bob");
}

// ── S4: owner removal rejected ──

#[tokio::test]
async fn owner_removal_is_rejected() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let room_id = server.create_room(&alice, "den").await;

    let response = server
        .client
        .delete(server.url(&format!("/api/rooms/{room_id}/members/alice")))
        .header("Cookie", format!("auth_token={alice}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let room = server
        .state
        .db
        .get_room_by_id(&room_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(room.members.len(), 1);
    assert_eq!(room.members[0].username, "alice");
}

// ── S5: typing broadcast ──

#[tokio::test]
async fn typing_broadcasts_without_persisting() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let bob = server.register_and_signin("bob").await;
    let carol = server.register_and_signin("carol").await;

    let mut alice_ws = server.connect_ws(&alice).await;
    let mut bob_ws = server.connect_ws(&bob).await;
    let mut carol_ws = server.connect_ws(&carol).await;

    let room_id = server.create_room(&alice, "den").await;
    server.add_member(&alice, &room_id, "bob").await;
    server.add_member(&alice, &room_id, "carol").await;

    let typing = json!({ "typing": true, "username": "alice", "room_id": room_id });
    send_event(&mut alice_ws, "typing", typing.clone()).await;

    for socket in [&mut alice_ws, &mut bob_ws, &mut carol_ws] {
        let (event, payload) = recv_event(socket).await;
        assert_eq!(event, "typing");
        assert_eq!(payload, typing);
    }

    let messages = server
        .state
        .db
        .get_room_messages(&room_id, 0, 0)
        .await
        .unwrap();
    assert!(messages.is_empty());
}

// ── S6: revoked token at admission ──

#[tokio::test]
async fn revoked_token_is_rejected_at_upgrade() {
    let server = TestServer::new().await;
    let token = server.register_and_signin("dave").await;
    server.signout(&token).await;

    let mut request = server.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Cookie", format!("auth_token={token}").parse().unwrap());
    let result = connect_async(request).await;
    assert!(result.is_err());

    assert!(!server.state.manager.is_user_connected("dave").await);
}

// ── Malformed frames ──

#[tokio::test]
async fn malformed_frames_do_not_kill_the_session() {
    let server = TestServer::new().await;
    let alice = server.register_and_signin("alice").await;
    let mut alice_ws = server.connect_ws(&alice).await;

    alice_ws
        .send(WsMessage::Text("this is not json".to_string()))
        .await
        .unwrap();
    // No error frame comes back; the frame is dropped.
    expect_silence(&mut alice_ws).await;

    // The session still works afterwards.
    send_event(&mut alice_ws, "is_online", json!({ "username": "alice" })).await;
    let (event, _) = recv_event(&mut alice_ws).await;
    assert_eq!(event, "online");
}
