//! Integration tests for the WebSocket chat server.
//!
//! These tests start a real server on a free port and talk to it over raw
//! WebSocket connections, verifying the wire protocol end to end.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parley_realtime::protocol::{
    ClientEvent, ConversationRef, GroupId, MarkRead, SendMessage, ServerEvent, TypingTarget,
    UserId,
};
use parley_realtime::{ChatServer, ErrorCode, Identity, MemoryStore, ServerConfig, StaticAuthority};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    url: String,
    server: ChatServer,
    authority: Arc<StaticAuthority>,
    store: Arc<MemoryStore>,
}

impl TestServer {
    /// Register a session token for a new user.
    fn user(&self, name: &str) -> (String, UserId) {
        let user = UserId::new();
        let token = format!("token-{name}-{user}");
        self.authority.insert(token.clone(), Identity::new(user, name));
        (token, user)
    }
}

/// Start a server on a free port.
async fn start_test_server(config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let authority = Arc::new(StaticAuthority::new());
    let store = Arc::new(MemoryStore::new());
    let server = ChatServer::new(
        ServerConfig {
            bind_addr: addr.to_string(),
            ..config
        },
        authority.clone(),
        store.clone(),
    );
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    TestServer {
        url: format!("ws://{addr}"),
        server,
        authority,
        store,
    }
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, event: ClientEvent) {
    let json = event.to_json().unwrap();
    ws.send(WsMessage::Text(json.into())).await.unwrap();
}

/// Next server event, failing the test after two seconds.
async fn recv(ws: &mut Ws) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a server event");
        match frame {
            Some(Ok(WsMessage::Text(text))) => return ServerEvent::from_json(text.as_str()).unwrap(),
            Some(Ok(WsMessage::Close(_))) | None => panic!("connection closed while waiting for an event"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("websocket error: {e}"),
        }
    }
}

/// Skip events until one named `name` arrives.
async fn recv_named(ws: &mut Ws, name: &str) -> ServerEvent {
    loop {
        let event = recv(ws).await;
        if event.name() == name {
            return event;
        }
    }
}

/// Assert no text frame arrives within `millis`.
async fn expect_silence(ws: &mut Ws, millis: u64) {
    if let Ok(Some(Ok(WsMessage::Text(text)))) = timeout(Duration::from_millis(millis), ws.next()).await {
        panic!("unexpected event: {text}");
    }
}

/// Wait for the server to close the socket.
async fn expect_closed(ws: &mut Ws) {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("server did not close the connection");
        match frame {
            Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    }
}

/// Connect and authenticate, consuming `authenticated` and `online_users`.
async fn login(url: &str, token: &str) -> (Ws, Vec<UserId>) {
    let mut ws = connect(url).await;
    send(&mut ws, ClientEvent::Authenticate { token: token.into() }).await;
    match recv(&mut ws).await {
        ServerEvent::Authenticated(_) => {}
        other => panic!("expected authenticated, got {other:?}"),
    }
    let online = match recv(&mut ws).await {
        ServerEvent::OnlineUsers { users } => users.into_iter().map(|u| u.user_id).collect(),
        other => panic!("expected online_users, got {other:?}"),
    };
    (ws, online)
}

fn error_code(event: ServerEvent) -> ErrorCode {
    match event {
        ServerEvent::Error(body) => body.code,
        other => panic!("expected error, got {other:?}"),
    }
}

// ─── Authentication ──────────────────────────────────────────────

#[tokio::test]
async fn test_authenticate_reports_identity_and_online_users() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (bob_token, bob) = server.user("bob");

    let (mut alice_ws, online) = login(&server.url, &alice_token).await;
    assert!(online.is_empty());

    let mut bob_ws = connect(&server.url).await;
    send(&mut bob_ws, ClientEvent::Authenticate { token: bob_token }).await;
    match recv(&mut bob_ws).await {
        ServerEvent::Authenticated(summary) => {
            assert_eq!(summary.user_id, bob);
            assert_eq!(summary.username, "bob");
        }
        other => panic!("expected authenticated, got {other:?}"),
    }
    match recv(&mut bob_ws).await {
        ServerEvent::OnlineUsers { users } => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].user_id, alice);
        }
        other => panic!("expected online_users, got {other:?}"),
    }

    match recv(&mut alice_ws).await {
        ServerEvent::UserOnline(summary) => assert_eq!(summary.user_id, bob),
        other => panic!("expected user_online, got {other:?}"),
    }
    assert_eq!(server.server.stats().online_users, 2);
}

#[tokio::test]
async fn test_invalid_token_gets_auth_error_and_close() {
    let server = start_test_server(ServerConfig::default()).await;
    let mut ws = connect(&server.url).await;

    send(&mut ws, ClientEvent::Authenticate { token: "forged".into() }).await;
    assert!(matches!(recv(&mut ws).await, ServerEvent::AuthError { .. }));
    expect_closed(&mut ws).await;
    assert_eq!(server.server.stats().online_users, 0);
}

#[tokio::test]
async fn test_authority_outage_rejects_connection() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("alice");
    server.authority.set_available(false);

    let mut ws = connect(&server.url).await;
    send(&mut ws, ClientEvent::Authenticate { token }).await;
    assert!(matches!(recv(&mut ws).await, ServerEvent::AuthError { .. }));
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_silent_connection_times_out() {
    let server = start_test_server(ServerConfig {
        auth_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    })
    .await;
    let mut ws = connect(&server.url).await;

    match recv(&mut ws).await {
        ServerEvent::AuthError { error } => assert!(error.contains("No session token")),
        other => panic!("expected auth_error, got {other:?}"),
    }
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_events_before_authentication_are_rejected() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("alice");
    let mut ws = connect(&server.url).await;

    send(&mut ws, ClientEvent::SendMessage(SendMessage::direct(UserId::new(), "hi"))).await;
    assert_eq!(error_code(recv(&mut ws).await), ErrorCode::NotAuthenticated);

    // The connection survives and can still authenticate.
    send(&mut ws, ClientEvent::Authenticate { token }).await;
    assert!(matches!(recv(&mut ws).await, ServerEvent::Authenticated(_)));
}

#[tokio::test]
async fn test_logout_drops_session_and_closes() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (bob_token, _) = server.user("bob");
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    recv_named(&mut bob_ws, "user_online").await;
    assert_eq!(server.server.stats().cached_sessions, 2);

    send(&mut alice_ws, ClientEvent::Logout).await;
    expect_closed(&mut alice_ws).await;
    match recv_named(&mut bob_ws, "user_offline").await {
        ServerEvent::UserOffline(summary) => assert_eq!(summary.user_id, alice),
        other => panic!("expected user_offline, got {other:?}"),
    }
    assert_eq!(server.server.stats().cached_sessions, 1);

    // Revoked upstream; the cache no longer vouches for the token.
    server.authority.revoke(&alice_token);
    let mut again = connect(&server.url).await;
    send(&mut again, ClientEvent::Authenticate { token: alice_token }).await;
    assert!(matches!(recv(&mut again).await, ServerEvent::AuthError { .. }));
    expect_closed(&mut again).await;
}

// ─── Messaging ───────────────────────────────────────────────────

#[tokio::test]
async fn test_direct_message_delivered_live() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;

    send(&mut alice_ws, ClientEvent::SendMessage(SendMessage::direct(bob, "hello"))).await;

    let sent = match recv_named(&mut alice_ws, "message_sent").await {
        ServerEvent::MessageSent(message) => message,
        other => panic!("expected message_sent, got {other:?}"),
    };
    match recv(&mut bob_ws).await {
        ServerEvent::NewMessage(delivery) => {
            assert_eq!(delivery.message.id, sent.id);
            assert_eq!(delivery.message.sender_id, alice);
            assert_eq!(delivery.message.content, "hello");
            assert!(!delivery.queued);
            assert!(delivery.queued_at.is_none());
        }
        other => panic!("expected new_message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offline_recipient_gets_replay_on_login() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, _) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;

    for content in ["first", "second"] {
        send(&mut alice_ws, ClientEvent::SendMessage(SendMessage::direct(bob, content))).await;
        assert!(matches!(recv(&mut alice_ws).await, ServerEvent::MessageSent(_)));
    }
    assert_eq!(server.server.stats().offline.queued_events, 2);

    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    for expected in ["first", "second"] {
        match recv(&mut bob_ws).await {
            ServerEvent::NewMessage(delivery) => {
                assert_eq!(delivery.message.content, expected);
                assert!(delivery.queued);
                assert!(delivery.queued_at.is_some());
            }
            other => panic!("expected replayed new_message, got {other:?}"),
        }
    }
    assert_eq!(server.server.stats().offline.queued_events, 0);
}

#[tokio::test]
async fn test_invalid_target_is_reported() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("alice");
    let (mut ws, _) = login(&server.url, &token).await;

    let mut request = SendMessage::direct(UserId::new(), "x");
    request.group_id = Some(GroupId::new());
    send(&mut ws, ClientEvent::SendMessage(request)).await;

    assert_eq!(error_code(recv(&mut ws).await), ErrorCode::InvalidTarget);
    assert_eq!(server.store.message_count().await, 0);
}

#[tokio::test]
async fn test_store_outage_reports_persistence_failure() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, _) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    server.store.set_available(false);

    send(&mut alice_ws, ClientEvent::SendMessage(SendMessage::direct(bob, "lost"))).await;
    assert_eq!(
        error_code(recv_named(&mut alice_ws, "error").await),
        ErrorCode::PersistenceFailure
    );
    expect_silence(&mut bob_ws, 200).await;
}

// ─── Groups ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_group_message_reaches_members_only() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (carol_token, _) = server.user("carol");
    let group = GroupId::new();
    server.store.add_group(group, [alice, bob]).await;

    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    let (mut carol_ws, _) = login(&server.url, &carol_token).await;

    send(&mut alice_ws, ClientEvent::SendMessage(SendMessage::group(group, "team"))).await;

    assert!(matches!(
        recv_named(&mut alice_ws, "message_sent").await,
        ServerEvent::MessageSent(_)
    ));
    match recv_named(&mut bob_ws, "group_message").await {
        ServerEvent::GroupMessage(delivery) => {
            assert_eq!(delivery.message.group_id, Some(group));
            assert_eq!(delivery.message.content, "team");
        }
        other => panic!("expected group_message, got {other:?}"),
    }
    expect_silence(&mut carol_ws, 200).await;
}

#[tokio::test]
async fn test_group_send_by_non_member_rejected() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("mallory");
    let group = GroupId::new();
    server.store.add_group(group, [UserId::new()]).await;
    let (mut ws, _) = login(&server.url, &token).await;

    send(&mut ws, ClientEvent::SendMessage(SendMessage::group(group, "hi"))).await;
    assert_eq!(error_code(recv(&mut ws).await), ErrorCode::NotAMember);
}

#[tokio::test]
async fn test_join_room_requires_membership() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (carol_token, _) = server.user("carol");
    let group = GroupId::new();
    server.store.add_group(group, [alice]).await;

    let (mut carol_ws, _) = login(&server.url, &carol_token).await;
    send(&mut carol_ws, ClientEvent::JoinRoom { room: group }).await;
    assert_eq!(error_code(recv(&mut carol_ws).await), ErrorCode::NotAMember);

    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    send(&mut alice_ws, ClientEvent::JoinRoom { room: group }).await;
    assert_eq!(
        recv_named(&mut alice_ws, "room_joined").await,
        ServerEvent::RoomJoined { room: group }
    );
    send(&mut alice_ws, ClientEvent::LeaveRoom { room: group }).await;
    assert_eq!(recv(&mut alice_ws).await, ServerEvent::RoomLeft { room: group });
}

// ─── Read receipts ───────────────────────────────────────────────

#[tokio::test]
async fn test_mark_all_read_is_idempotent() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;

    for n in 0..5 {
        send(
            &mut alice_ws,
            ClientEvent::SendMessage(SendMessage::direct(bob, format!("m{n}"))),
        )
        .await;
        assert!(matches!(recv(&mut alice_ws).await, ServerEvent::MessageSent(_)));
    }

    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    for _ in 0..5 {
        assert!(matches!(recv(&mut bob_ws).await, ServerEvent::NewMessage(_)));
    }
    assert!(matches!(recv(&mut alice_ws).await, ServerEvent::UserOnline(_)));

    let conversation = ConversationRef {
        conversation_id: alice.as_uuid(),
        is_group: false,
    };
    send(&mut bob_ws, ClientEvent::MarkAllRead(conversation.clone())).await;
    match recv(&mut bob_ws).await {
        ServerEvent::MessagesMarked(marked) => assert_eq!(marked.message_ids.len(), 5),
        other => panic!("expected messages_marked, got {other:?}"),
    }
    match recv(&mut alice_ws).await {
        ServerEvent::MessagesRead(notice) => {
            assert_eq!(notice.message_ids.len(), 5);
            assert_eq!(notice.reader_id, bob);
            assert_eq!(notice.conversation_id, bob.as_uuid());
            assert!(!notice.is_group);
        }
        other => panic!("expected messages_read, got {other:?}"),
    }

    send(&mut bob_ws, ClientEvent::MarkAllRead(conversation)).await;
    match recv(&mut bob_ws).await {
        ServerEvent::MessagesMarked(marked) => assert!(marked.message_ids.is_empty()),
        other => panic!("expected messages_marked, got {other:?}"),
    }
    expect_silence(&mut alice_ws, 200).await;
    assert_eq!(server.store.receipt_count().await, 5);
}

#[tokio::test]
async fn test_mark_read_twice_notifies_once() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    assert!(matches!(recv(&mut alice_ws).await, ServerEvent::UserOnline(_)));

    send(&mut alice_ws, ClientEvent::SendMessage(SendMessage::direct(bob, "read me"))).await;
    assert!(matches!(recv(&mut alice_ws).await, ServerEvent::MessageSent(_)));
    let id = match recv(&mut bob_ws).await {
        ServerEvent::NewMessage(delivery) => delivery.message.id,
        other => panic!("expected new_message, got {other:?}"),
    };

    let request = MarkRead {
        message_ids: vec![id, id],
        conversation_id: alice.as_uuid(),
        is_group: false,
    };
    send(&mut bob_ws, ClientEvent::MarkMessagesRead(request.clone())).await;
    send(&mut bob_ws, ClientEvent::MarkMessagesRead(request)).await;

    match recv(&mut alice_ws).await {
        ServerEvent::MessagesRead(notice) => assert_eq!(notice.message_ids, vec![id]),
        other => panic!("expected messages_read, got {other:?}"),
    }
    expect_silence(&mut alice_ws, 200).await;
}

#[tokio::test]
async fn test_outsider_read_marks_are_ignored() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, _) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (mallory_token, _) = server.user("mallory");
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    let (mut mallory_ws, _) = login(&server.url, &mallory_token).await;

    send(&mut alice_ws, ClientEvent::SendMessage(SendMessage::direct(bob, "private"))).await;
    recv_named(&mut alice_ws, "message_sent").await;
    let id = match recv_named(&mut bob_ws, "new_message").await {
        ServerEvent::NewMessage(delivery) => delivery.message.id,
        other => panic!("expected new_message, got {other:?}"),
    };

    // Bob named as the peer of a conversation mallory is not part of.
    let request = MarkRead {
        message_ids: vec![id],
        conversation_id: bob.as_uuid(),
        is_group: false,
    };
    send(&mut mallory_ws, ClientEvent::MarkMessagesRead(request)).await;
    match recv(&mut mallory_ws).await {
        ServerEvent::MessagesMarked(marked) => assert!(marked.message_ids.is_empty()),
        other => panic!("expected messages_marked, got {other:?}"),
    }
    expect_silence(&mut bob_ws, 200).await;
    expect_silence(&mut alice_ws, 50).await;
    assert_eq!(server.store.receipt_count().await, 0);
}

// ─── Presence and typing ─────────────────────────────────────────

#[tokio::test]
async fn test_second_connection_forces_first_out() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, _) = server.user("alice");
    let (bob_token, _) = server.user("bob");
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    let (mut first, _) = login(&server.url, &alice_token).await;
    assert!(matches!(recv(&mut bob_ws).await, ServerEvent::UserOnline(_)));

    let (mut second, _) = login(&server.url, &alice_token).await;

    match recv(&mut first).await {
        ServerEvent::ForceDisconnect { reason } => assert!(reason.contains("superseded")),
        other => panic!("expected force_disconnect, got {other:?}"),
    }
    expect_closed(&mut first).await;

    // The user never went offline as far as others can tell.
    expect_silence(&mut bob_ws, 200).await;
    expect_silence(&mut second, 50).await;
    assert_eq!(server.server.stats().online_users, 2);
}

#[tokio::test]
async fn test_typing_cleared_on_disconnect() {
    let server = start_test_server(ServerConfig::default()).await;
    let (alice_token, alice) = server.user("alice");
    let (bob_token, bob) = server.user("bob");
    let (mut bob_ws, _) = login(&server.url, &bob_token).await;
    let (mut alice_ws, _) = login(&server.url, &alice_token).await;
    assert!(matches!(recv(&mut bob_ws).await, ServerEvent::UserOnline(_)));

    let target = TypingTarget {
        recipient_id: Some(bob),
        group_id: None,
    };
    send(&mut alice_ws, ClientEvent::TypingStart(target)).await;
    match recv(&mut bob_ws).await {
        ServerEvent::TypingStart(notice) => {
            assert_eq!(notice.user_id, alice);
            assert!(notice.is_typing);
        }
        other => panic!("expected typing_start, got {other:?}"),
    }

    alice_ws.close(None).await.unwrap();

    match recv(&mut bob_ws).await {
        ServerEvent::TypingStop(notice) => assert_eq!(notice.user_id, alice),
        other => panic!("expected typing_stop, got {other:?}"),
    }
    match recv(&mut bob_ws).await {
        ServerEvent::UserOffline(summary) => assert_eq!(summary.user_id, alice),
        other => panic!("expected user_offline, got {other:?}"),
    }
}

#[tokio::test]
async fn test_typing_in_unjoined_group_rejected() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("alice");
    let (mut ws, _) = login(&server.url, &token).await;

    let target = TypingTarget {
        recipient_id: None,
        group_id: Some(GroupId::new()),
    };
    send(&mut ws, ClientEvent::TypingStart(target)).await;
    assert_eq!(error_code(recv(&mut ws).await), ErrorCode::NotAMember);
}

// ─── Transport ───────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_payload_keeps_connection_open() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("alice");
    let (mut ws, _) = login(&server.url, &token).await;

    ws.send(WsMessage::Text("not json".into())).await.unwrap();
    assert_eq!(error_code(recv(&mut ws).await), ErrorCode::InvalidPayload);

    ws.send(WsMessage::Text(r#"{"event":"fly_away","data":{}}"#.into()))
        .await
        .unwrap();
    assert_eq!(error_code(recv(&mut ws).await), ErrorCode::InvalidPayload);

    ws.send(WsMessage::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    assert_eq!(error_code(recv(&mut ws).await), ErrorCode::InvalidPayload);

    send(&mut ws, ClientEvent::SendMessage(SendMessage::direct(UserId::new(), "still here"))).await;
    assert!(matches!(recv(&mut ws).await, ServerEvent::MessageSent(_)));
}

#[tokio::test]
async fn test_ping_pong() {
    let server = start_test_server(ServerConfig::default()).await;
    let mut ws = connect(&server.url).await;

    ws.send(WsMessage::Ping(vec![7u8, 7].into())).await.unwrap();
    let frame = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    match frame {
        Some(Ok(WsMessage::Pong(data))) => assert_eq!(data.as_ref(), &[7u8, 7]),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_signals_connections() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("alice");
    let (mut ws, _) = login(&server.url, &token).await;

    assert_eq!(server.server.shutdown(), 1);
    match recv(&mut ws).await {
        ServerEvent::ForceDisconnect { reason } => assert!(reason.contains("shutting down")),
        other => panic!("expected force_disconnect, got {other:?}"),
    }
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_connection_counters() {
    let server = start_test_server(ServerConfig::default()).await;
    let (token, _) = server.user("alice");
    let (mut ws, _) = login(&server.url, &token).await;

    let stats = server.server.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.cached_sessions, 1);

    ws.close(None).await.unwrap();
    expect_closed(&mut ws).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.server.stats().active_connections, 0);
    assert_eq!(server.server.stats().online_users, 0);
}
