//! # Lobby CLI Demo
//!
//! A small terminal client for the LobbyLink platform:
//!
//! 1. Connect the lobby, game and chat channels over one WebSocket
//! 2. Create a tic-tac-toe lobby, or join one by code
//! 3. Drive it from stdin (`ready`, `start`, `move 4`, `say gl hf`, ...)
//! 4. Print every event the client emits
//! 5. Shut down gracefully on `quit`, Ctrl+C or disconnect
//!
//! ## Running
//!
//! ```sh
//! LOBBYLINK_USER=u-1 cargo run --example lobby_cli
//!
//! # Join an existing lobby on another server:
//! LOBBYLINK_URL=wss://play.example.com/realtime LOBBYLINK_USER=u-2 \
//!     LOBBYLINK_CODE=K3F9QZ cargo run --example lobby_cli
//! ```

use lobbylink_client::{
    LobbyLinkClient, LobbyLinkConfig, LobbyLinkEvent, ReconnectPolicy, TransportRegistry,
    WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Default server URL when `LOBBYLINK_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:4000/realtime";

const HELP: &str = "commands: ready | start | move <0-8> | forfeit | say <text> | \
                    dm <friend> <text> | lobbies | leave | quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=lobbylink_client=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("LOBBYLINK_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let user = std::env::var("LOBBYLINK_USER").unwrap_or_else(|_| "u-1".to_string());
    let code = std::env::var("LOBBYLINK_CODE").ok();
    tracing::info!("Connecting to {url} as {user}");

    // ── Start ───────────────────────────────────────────────────────
    let registry = TransportRegistry::new(WebSocketConnector::new(url), ReconnectPolicy::default());
    let (mut client, mut event_rx) =
        LobbyLinkClient::start(registry, None, LobbyLinkConfig::new(user));

    match code {
        Some(code) => client.join_lobby(code).await?,
        None => {
            client
                .create_lobby(2, true, None, Some("tictactoe".to_string()))
                .await?
        }
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };
                match event {
                    LobbyLinkEvent::Connection { channel, status } => {
                        tracing::info!("{channel}: {status:?}");
                    }
                    LobbyLinkEvent::Navigate(route) => {
                        println!("→ {route:?}");
                    }
                    LobbyLinkEvent::LobbyEntered { lobby_code } => {
                        let lobby = client.lobby();
                        let members = lobby
                            .lobby
                            .map(|l| l.members.iter().map(|m| m.nickname.clone()).collect::<Vec<_>>())
                            .unwrap_or_default();
                        println!("In lobby {lobby_code} with {}", members.join(", "));
                    }
                    LobbyLinkEvent::LobbyMessage(message) => {
                        println!("[{}] {}", message.nickname, message.content);
                    }
                    LobbyLinkEvent::GameStarted { game_name, .. } => {
                        println!("{game_name} started, your turn: {}", client.game().is_my_turn);
                    }
                    LobbyLinkEvent::MoveApplied { player_id } => {
                        let game = client.game();
                        let board = game
                            .state
                            .as_ref()
                            .and_then(|s| s.field("board"))
                            .map(ToString::to_string)
                            .unwrap_or_default();
                        println!("{player_id} moved: {board} (your turn: {})", game.is_my_turn);
                    }
                    LobbyLinkEvent::GameEnded { result, winner_id } => {
                        println!("game over: {result:?} {}", winner_id.unwrap_or_default());
                    }
                    LobbyLinkEvent::ChatMessage { friend_id, message } => {
                        println!(
                            "dm from {friend_id}: {}",
                            message.content.unwrap_or_else(|| "<image>".to_string())
                        );
                    }
                    LobbyLinkEvent::Kicked { message, .. } => {
                        tracing::warn!("Kicked: {message}");
                    }
                    LobbyLinkEvent::LobbyError(error) => {
                        tracing::error!("Lobby error [{:?}]: {}", error.error_code, error.message);
                    }
                    LobbyLinkEvent::Disconnected { reason } => {
                        tracing::warn!("Disconnected: {}", reason.as_deref().unwrap_or("unknown"));
                        break;
                    }
                    other => {
                        tracing::debug!("Event: {other:?}");
                    }
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let (command, rest) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
                let outcome = match command {
                    "ready" => client.toggle_ready().await,
                    "start" => client.start_game().await,
                    "move" => match rest.trim().parse::<u8>() {
                        Ok(position) => client.propose_move(serde_json::json!({ "position": position })).await,
                        Err(_) => {
                            println!("usage: move <0-8>");
                            continue;
                        }
                    },
                    "forfeit" => client.forfeit().await,
                    "say" => client.send_lobby_message(rest).await,
                    "dm" => {
                        let (friend, text) = rest.split_once(' ').unwrap_or((rest, ""));
                        match client.ensure_conversation(friend, None, None).await {
                            Ok(()) => client.send_message(friend, text).await.map(|_| ()),
                            Err(e) => Err(e),
                        }
                    }
                    "lobbies" => client.fetch_public_lobbies().await,
                    "leave" => client.leave_lobby().await,
                    "quit" => break,
                    "" => continue,
                    _ => {
                        println!("{HELP}");
                        continue;
                    }
                };
                if let Err(e) = outcome {
                    println!("rejected: {e}");
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    client.shutdown().await;
    tracing::info!("Client shut down cleanly");

    Ok(())
}
