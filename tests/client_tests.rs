#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for [`LobbyLinkClient`] against a scripted server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use lobbylink_client::error::LobbyLinkError;
use lobbylink_client::state::{DeliveryState, GamePhase, LobbyPhase};
use lobbylink_client::{
    ChannelStatus, ErrorCode, LobbyLinkClient, LobbyLinkConfig, LobbyLinkEvent, Route,
    TransportRegistry,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const CODE: &str = "K3F9QZ";

/// Join `CODE`, hosted by `host`, and wait until the client is in the lobby.
async fn join(client: &LobbyLinkClient, server: &mut ServerSide, host: &str, members: Vec<serde_json::Value>) {
    client.join_lobby(CODE).await.unwrap();
    let data = server.expect("lobby", "join_lobby").await;
    assert_eq!(data, json!({"lobby_code": CODE}));
    server.push(
        "lobby",
        "lobby_joined",
        json!({"lobby": lobby(CODE, host, 2, members, "waiting")}),
    );
    wait_view(&mut client.watch_lobby(), |v| v.phase == LobbyPhase::InLobby).await;
}

// ── Lobby ───────────────────────────────────────────────────────────

#[tokio::test]
async fn join_goes_through_joining_to_in_lobby() {
    let (mut client, _events, mut server) = start_client("u-2", None);

    client.join_lobby(CODE).await.unwrap();
    assert_eq!(client.lobby().phase, LobbyPhase::Joining);
    assert!(client.lobby().loading);
    server.expect("lobby", "join_lobby").await;

    server.push(
        "lobby",
        "lobby_joined",
        json!({"lobby": lobby(CODE, "u-1", 2, vec![member("u-1", "Ada", false), member("u-2", "Brin", false)], "waiting")}),
    );
    let view = wait_view(&mut client.watch_lobby(), |v| v.phase == LobbyPhase::InLobby).await;

    let snapshot = view.lobby.unwrap();
    let ids: Vec<_> = snapshot.members.iter().map(|m| m.user_id.as_str()).collect();
    assert_eq!(ids, vec!["u-1", "u-2"]);
    assert_eq!(usize::from(snapshot.current_players), snapshot.members.len());
    assert!(snapshot.members[0].is_host);
    assert!(!view.is_host);
    assert!(!view.loading);
    assert_eq!(
        wait_view(&mut client.watch_route(), |r| *r != Route::Home).await,
        Route::Lobby(CODE.into())
    );

    client.shutdown().await;
}

#[tokio::test]
async fn repeated_lobby_state_leaves_view_unchanged() {
    let (mut client, _events, mut server) = start_client("u-2", None);
    join(&client, &mut server, "u-1", vec![member("u-1", "Ada", false), member("u-2", "Brin", false)]).await;

    let state = lobby(CODE, "u-1", 2, vec![member("u-1", "Ada", true), member("u-2", "Brin", false)], "waiting");
    server.push("lobby", "lobby_state", state.clone());
    let first = wait_view(&mut client.watch_lobby(), |v| {
        v.lobby.as_ref().is_some_and(|l| l.members[0].is_ready)
    })
    .await;

    server.push("lobby", "lobby_state", state);
    // A marker event afterwards proves the duplicate was processed.
    server.push("lobby", "lobby_user_typing", json!({"user_id": "u-1", "nickname": "Ada"}));
    let second = wait_view(&mut client.watch_lobby(), |v| !v.typing.is_empty()).await;

    assert_eq!(first.lobby, second.lobby);
    client.shutdown().await;
}

#[tokio::test]
async fn kicked_resets_to_idle_and_navigates_home() {
    let (mut client, mut events, mut server) = start_client("u-2", None);
    join(&client, &mut server, "u-1", vec![member("u-1", "Ada", false), member("u-2", "Brin", false)]).await;
    wait_view(&mut client.watch_route(), |r| *r == Route::Lobby(CODE.into())).await;

    server.push(
        "lobby",
        "kicked_from_lobby",
        json!({"lobby_code": CODE, "message": "You were removed from the lobby by the host."}),
    );

    let event = wait_event(&mut events, |e| matches!(e, LobbyLinkEvent::Kicked { .. })).await;
    assert_eq!(
        event,
        LobbyLinkEvent::Kicked {
            lobby_code: Some(CODE.into()),
            message: "You were removed from the lobby by the host.".into(),
        }
    );
    let view = wait_view(&mut client.watch_lobby(), |v| v.phase == LobbyPhase::Idle).await;
    assert!(view.lobby.is_none());
    let error = view.last_error.unwrap();
    assert_eq!(error.error_code, Some(ErrorCode::Kicked));
    assert_eq!(wait_view(&mut client.watch_route(), |r| *r == Route::Home).await, Route::Home);

    client.shutdown().await;
}

#[tokio::test]
async fn server_error_while_joining_returns_to_idle() {
    let (mut client, mut events, mut server) = start_client("u-2", None);

    client.join_lobby("NOPE00").await.unwrap();
    server.expect("lobby", "join_lobby").await;
    server.push(
        "lobby",
        "lobby_error",
        json!({"message": "Lobby not found", "error_code": "LOBBY_NOT_FOUND"}),
    );

    let event = wait_event(&mut events, |e| matches!(e, LobbyLinkEvent::LobbyError(_))).await;
    let LobbyLinkEvent::LobbyError(error) = event else {
        unreachable!()
    };
    assert_eq!(error.error_code, Some(ErrorCode::LobbyNotFound));
    let view = wait_view(&mut client.watch_lobby(), |v| v.phase == LobbyPhase::Idle && !v.loading).await;
    assert!(view.lobby.is_none());
    assert_eq!(client.route(), Route::Home);

    client.shutdown().await;
}

#[tokio::test]
async fn second_join_while_joining_is_rejected() {
    let (mut client, _events, mut server) = start_client("u-2", None);
    client.join_lobby(CODE).await.unwrap();
    server.expect("lobby", "join_lobby").await;

    let err = client.join_lobby("OTHER1").await.unwrap_err();
    assert!(matches!(
        err,
        LobbyLinkError::AlreadyInLobby | LobbyLinkError::RequestPending(_)
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let (mut client, _events, mut server) = start_client("u-2", None);
    client.join_lobby(CODE).await.unwrap();
    server.expect("lobby", "join_lobby").await;

    server.push_raw("definitely not json");
    server.push_raw(r#"{"channel":"lobby","event":"lobby_exploded","data":{}}"#);
    server.push("lobby", "lobby_joined", json!({"lobby": "not an object"}));
    server.push(
        "lobby",
        "lobby_joined",
        json!({"lobby": lobby(CODE, "u-1", 2, vec![member("u-1", "Ada", false), member("u-2", "Brin", false)], "waiting")}),
    );

    let view = wait_view(&mut client.watch_lobby(), |v| v.phase == LobbyPhase::InLobby).await;
    assert_eq!(view.lobby.unwrap().lobby_code, CODE);
    client.shutdown().await;
}

#[tokio::test]
async fn reconnect_refetches_lobby() {
    let (connector, mut servers) = MockConnector::with_links(2);
    let attempts = Arc::clone(&connector.attempts);
    let registry = TransportRegistry::new(connector, fast_policy());
    let (mut client, mut events) = LobbyLinkClient::start(registry, None, LobbyLinkConfig::new("u-2"));
    let mut second = servers.pop().unwrap();
    let mut first = servers.pop().unwrap();

    join(&client, &mut first, "u-1", vec![member("u-1", "Ada", false), member("u-2", "Brin", false)]).await;
    first.drop_link();

    wait_event(&mut events, |e| {
        matches!(e, LobbyLinkEvent::Connection { status: ChannelStatus::Reconnecting { .. }, .. })
    })
    .await;
    second.expect("lobby", "get_lobby").await;
    assert_eq!(client.connection_status(), ChannelStatus::Connected);
    assert_eq!(*attempts.lock().unwrap(), 2);
    assert_eq!(client.lobby().phase, LobbyPhase::InLobby);

    client.shutdown().await;
}

#[tokio::test]
async fn refused_join_leaves_the_lobby_idle() {
    let (connector, _) = MockConnector::with_links(0);
    let registry = TransportRegistry::new(connector, fast_policy());
    let (mut client, mut events) = LobbyLinkClient::start(registry, None, LobbyLinkConfig::new("u-1"));
    wait_event(&mut events, |e| {
        matches!(e, LobbyLinkEvent::Connection { channel, status: ChannelStatus::Failed } if channel == "lobby")
    })
    .await;

    let err = client.join_lobby(CODE).await.unwrap_err();
    assert!(matches!(err, LobbyLinkError::NotConnected(_)));
    let view = client.lobby();
    assert_eq!(view.phase, LobbyPhase::Idle);
    assert!(!view.loading);
    assert!(view.pending.is_empty());

    // Not stuck behind the first attempt.
    let err = client.join_lobby(CODE).await.unwrap_err();
    assert!(matches!(err, LobbyLinkError::NotConnected(_)));

    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_transport() {
    let (mut client, mut events, mut server) = start_client("u-1", None);
    client.fetch_public_lobbies().await.unwrap();
    server.expect("lobby", "get_public_lobbies").await;

    client.shutdown().await;

    assert!(server.closed.load(std::sync::atomic::Ordering::Relaxed));
    wait_event(&mut events, |e| matches!(e, LobbyLinkEvent::Disconnected { .. })).await;
    assert!(matches!(
        client.toggle_ready().await,
        Err(LobbyLinkError::ClientClosed)
    ));
}

// ── Game ────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_player_tictactoe_starts_and_gates_turns() {
    let (mut host, mut host_events, mut host_server) = start_client("u-1", None);
    let (mut guest, _guest_events, mut guest_server) = start_client("u-2", None);

    // Host creates a two-seat tic-tac-toe lobby.
    host.create_lobby(2, true, None, Some("tictactoe".into())).await.unwrap();
    let data = host_server.expect("lobby", "create_lobby").await;
    assert_eq!(data["max_players"], json!(2));
    assert_eq!(data["game"], json!("tictactoe"));
    host_server.push(
        "lobby",
        "lobby_created",
        json!({"lobby": lobby(CODE, "u-1", 2, vec![member("u-1", "Ada", false)], "waiting")}),
    );
    let view = wait_view(&mut host.watch_lobby(), |v| v.phase == LobbyPhase::InLobby).await;
    assert!(view.is_host);

    // Guest joins; both sides see two members.
    let both = |ready_1: bool, ready_2: bool, status: &str| {
        lobby(CODE, "u-1", 2, vec![member("u-1", "Ada", ready_1), member("u-2", "Brin", ready_2)], status)
    };
    join(&guest, &mut guest_server, "u-1", vec![member("u-1", "Ada", false), member("u-2", "Brin", false)]).await;
    host_server.push("lobby", "lobby_state", both(false, false, "waiting"));
    wait_view(&mut host.watch_lobby(), |v| {
        v.lobby.as_ref().is_some_and(|l| l.members.len() == 2)
    })
    .await;
    assert!(matches!(
        host.start_game().await,
        Err(LobbyLinkError::NotReadyToStart(_))
    ));

    // Everyone readies up.
    host.toggle_ready().await.unwrap();
    host_server.expect("lobby", "toggle_ready").await;
    guest.toggle_ready().await.unwrap();
    guest_server.expect("lobby", "toggle_ready").await;
    for server in [&host_server, &guest_server] {
        server.push("lobby", "lobby_state", both(true, true, "waiting"));
    }
    let view = wait_view(&mut host.watch_lobby(), |v| v.can_start).await;
    assert!(view.all_members_ready);

    // Guests may not start.
    wait_view(&mut guest.watch_lobby(), |v| v.all_members_ready).await;
    assert!(matches!(guest.start_game().await, Err(LobbyLinkError::NotHost)));

    host.start_game().await.unwrap();
    let data = host_server.expect("game", "create_game").await;
    assert_eq!(data["game_name"], json!("tictactoe"));

    let started = json!({
        "lobby_code": CODE,
        "game_name": "tictactoe",
        "game_state": tictactoe_state("u-1", "u-2", Utc::now()),
    });
    for server in [&host_server, &guest_server] {
        server.push("game", "game_started", started.clone());
        server.push("lobby", "lobby_state", both(true, true, "in_game"));
    }

    let host_game = wait_view(&mut host.watch_game(), |g| g.phase == GamePhase::InProgress).await;
    let guest_game = wait_view(&mut guest.watch_game(), |g| g.phase == GamePhase::InProgress).await;
    let board = host_game.state.as_ref().unwrap().field("board").unwrap();
    assert_eq!(board.as_array().unwrap().len(), 9);
    assert!(board.as_array().unwrap().iter().all(serde_json::Value::is_null));
    assert!(host_game.is_my_turn);
    assert!(!guest_game.is_my_turn);

    let event = wait_event(&mut host_events, |e| matches!(e, LobbyLinkEvent::GameStarted { .. })).await;
    assert_eq!(
        event,
        LobbyLinkEvent::GameStarted {
            lobby_code: CODE.into(),
            game_name: "tictactoe".into(),
        }
    );
    assert_eq!(
        wait_view(&mut host.watch_route(), |r| matches!(r, Route::Game(_))).await,
        Route::Game(CODE.into())
    );
    assert_eq!(
        wait_view(&mut guest.watch_route(), |r| matches!(r, Route::Game(_))).await,
        Route::Game(CODE.into())
    );

    // Turn gating and the client-side legality check.
    assert!(matches!(
        guest.propose_move(json!({"position": 4})).await,
        Err(LobbyLinkError::NotYourTurn)
    ));
    assert!(matches!(
        host.propose_move(json!({"position": 9})).await,
        Err(LobbyLinkError::IllegalMove(_))
    ));
    host.propose_move(json!({"position": 4})).await.unwrap();
    let data = host_server.expect("game", "make_move").await;
    assert_eq!(data, json!({"move_data": {"position": 4}}));
    assert!(host.game().move_in_flight);
    assert!(matches!(
        host.propose_move(json!({"position": 0})).await,
        Err(LobbyLinkError::MoveInFlight)
    ));

    host.shutdown().await;
    guest.shutdown().await;
}

#[tokio::test]
async fn countdown_is_clamped_at_zero() {
    let (mut client, _events, mut server) = start_client("u-1", None);
    client.resync_game().await.unwrap();
    server.expect("game", "get_game_state").await;

    let stale = Utc::now() - chrono::Duration::seconds(40);
    server.push(
        "game",
        "game_state",
        json!({"game_state": tictactoe_state("u-2", "u-1", stale)}),
    );
    let view = wait_view(&mut client.watch_game(), |g| g.state.is_some()).await;
    assert_eq!(view.turn_remaining_secs, Some(0));

    let fresh = Utc::now() - chrono::Duration::seconds(10);
    server.push(
        "game",
        "game_state",
        json!({"game_state": tictactoe_state("u-1", "u-2", fresh)}),
    );
    let view = wait_view(&mut client.watch_game(), |g| g.is_my_turn).await;
    let remaining = view.turn_remaining_secs.unwrap();
    assert!((18..=20).contains(&remaining), "remaining was {remaining}");

    client.shutdown().await;
}

// ── Chat ────────────────────────────────────────────────────────────

#[tokio::test]
async fn attachment_echo_is_reconciled_to_one_message() {
    let api = Arc::new(MockChatApi::default());
    let (mut client, _events, mut server) = start_client("u-1", Some(api.clone()));
    client.ensure_conversation("u-2", Some("Brin".into()), None).await.unwrap();

    assert!(matches!(
        client.request_upload_target("notes.pdf", "application/pdf").await,
        Err(LobbyLinkError::InvalidAttachment(_))
    ));
    let target = client.request_upload_target("photo.png", "image/png").await.unwrap();
    assert_eq!(target.image_path, "chat/u-1/photo.png");
    assert_eq!(
        api.uploads.lock().unwrap().as_slice(),
        [("photo.png".to_owned(), "image/png".to_owned())]
    );

    let local_id = client.send_attachment("u-2", &target, None).await.unwrap();
    let data = server.expect("chat", "send_message").await;
    assert_eq!(
        data,
        json!({"friend_user_id": "u-2", "image_path": "chat/u-1/photo.png"})
    );
    let pending = client.chat();
    let echo = pending.conversations["u-2"].last_message().unwrap();
    assert_eq!(echo.id, local_id);
    assert_eq!(echo.delivery, DeliveryState::Pending);

    let relayed = direct_message("m-1", "u-1", "u-2", None, Some("chat/u-1/photo.png"));
    server.push("chat", "message", relayed.clone());
    server.push(
        "chat",
        "conversation_updated",
        json!({"friend_user_id": "u-2", "nickname": "Brin", "last_message": relayed}),
    );
    server.push("chat", "user_typing", json!({"user_id": "u-2"}));

    let view = wait_view(&mut client.watch_chat(), |c| c.conversations["u-2"].peer_typing).await;
    let conversation = &view.conversations["u-2"];
    assert_eq!(conversation.messages.len(), 1);
    let message = &conversation.messages[0];
    assert_eq!(message.id, "m-1");
    assert!(message.is_mine);
    assert_eq!(message.delivery, DeliveryState::Delivered);
    assert_eq!(message.image_path.as_deref(), Some("chat/u-1/photo.png"));
    assert_eq!(conversation.unread, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn unread_counts_until_conversation_is_opened() {
    let (mut client, mut events, mut server) = start_client("u-1", None);
    client.ensure_conversation("u-2", None, None).await.unwrap();
    client.send_message("u-2", "hi").await.unwrap();
    server.expect("chat", "send_message").await;

    server.push("chat", "message", direct_message("m-10", "u-2", "u-1", Some("hey"), None));
    server.push("chat", "message", direct_message("m-10", "u-2", "u-1", Some("hey"), None));
    server.push("chat", "message", direct_message("m-11", "u-2", "u-1", Some("game?"), None));

    let view = wait_view(&mut client.watch_chat(), |c| c.total_unread == 2).await;
    let conversation = &view.conversations["u-2"];
    let ids: Vec<_> = conversation.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(&ids[1..], ["m-10", "m-11"]);
    assert_eq!(conversation.unread, 2);
    let event = wait_event(&mut events, |e| matches!(e, LobbyLinkEvent::ChatMessage { .. })).await;
    let LobbyLinkEvent::ChatMessage { friend_id, message } = event else {
        unreachable!()
    };
    assert_eq!(friend_id, "u-2");
    assert_eq!(message.content.as_deref(), Some("hey"));

    client.open_conversation("u-2").await.unwrap();
    let view = client.chat();
    assert_eq!(view.active.as_deref(), Some("u-2"));
    assert_eq!(view.conversations["u-2"].unread, 0);
    assert_eq!(view.total_unread, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn send_to_unknown_conversation_fails() {
    let (mut client, _events, _server) = start_client("u-1", None);
    assert!(matches!(
        client.send_message("u-9", "hello").await,
        Err(LobbyLinkError::UnknownConversation(_))
    ));
    client.ensure_conversation("u-9", None, None).await.unwrap();
    assert!(matches!(
        client.send_message("u-9", "   ").await,
        Err(LobbyLinkError::EmptyMessage)
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn presence_and_friend_requests_stay_out_of_conversations() {
    let (mut client, mut events, mut server) = start_client("u-1", None);
    client.ensure_conversation("u-2", None, None).await.unwrap();
    client.send_typing("u-2").await.unwrap();
    server.expect("chat", "typing").await;

    server.push(
        "chat",
        "initial_friend_statuses",
        json!({"statuses": [
            {"user_id": "u-2", "status": "online"},
            {"user_id": "u-3", "status": "in_game", "lobby_code": CODE}
        ]}),
    );
    server.push(
        "chat",
        "friend_request_received",
        json!({"request_id": "fr-1", "from_user_id": "u-4", "nickname": "Cy"}),
    );

    let event = wait_event(&mut events, |e| matches!(e, LobbyLinkEvent::FriendRequest(_))).await;
    let LobbyLinkEvent::FriendRequest(request) = event else {
        unreachable!()
    };
    assert_eq!(request.from_user_id, "u-4");

    let presence = wait_view(&mut client.watch_presence(), |p| !p.requests.is_empty()).await;
    assert_eq!(presence.statuses.len(), 2);
    assert_eq!(presence.statuses["u-3"].lobby_code.as_deref(), Some(CODE));
    let chat = client.chat();
    assert_eq!(chat.conversations.keys().collect::<Vec<_>>(), ["u-2"]);
    assert!(chat.conversations["u-2"].messages.is_empty());

    client.dismiss_friend_request("fr-1").await.unwrap();
    assert!(client.presence().requests.is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn load_more_pages_history_through_the_api() {
    let api = Arc::new(MockChatApi::default());
    api.pages.lock().unwrap().push_back(lobbylink_client::protocol::chat::HistoryPage {
        messages: vec![serde_json::from_value(direct_message("m-1", "u-2", "u-1", Some("old"), None)).unwrap()],
        next_cursor: Some("m-1".into()),
        has_more: false,
    });
    let (mut client, _events, _server) = start_client("u-1", Some(api));
    client.ensure_conversation("u-2", None, None).await.unwrap();

    client.load_more("u-2").await.unwrap();
    let view = wait_view(&mut client.watch_chat(), |c| {
        !c.conversations["u-2"].messages.is_empty()
    })
    .await;
    let conversation = &view.conversations["u-2"];
    assert_eq!(conversation.messages[0].content.as_deref(), Some("old"));
    assert!(!conversation.has_more);
    assert!(!conversation.loading_more);

    // Nothing left to fetch: the call is a no-op.
    client.load_more("u-2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.chat().conversations["u-2"].messages.len(), 1);

    client.shutdown().await;
}
