//! Cross-machine coordination.
//!
//! The lobby machine and the game engine never call each other. The
//! [`Coordinator`] watches their published views and answers with
//! [`Directive`]s, which the driver carries out through the engines' public
//! operations:
//!
//! - entering a lobby navigates to it and hands the game engine its context;
//! - the lobby switching to `in_game` makes the game engine fetch state;
//! - leaving (or being kicked from) a lobby resets the game and goes home;
//! - a game becoming live navigates to the game screen.

use tracing::debug;

use crate::protocol::lobby::LobbyStatus;
use crate::state::{GameContext, GamePhase, GameView, LobbyPhase, LobbyView};

/// Screen the UI should show.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Home,
    Lobby(String),
    Game(String),
}

/// Action the driver must apply to the game engine or the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Navigate(Route),
    SetGameContext(Option<GameContext>),
    /// Start following the lobby's game (`get_game_state`).
    EnterGame,
    ResetGame,
}

/// Observer of the lobby and game views.
#[derive(Debug, Default)]
pub struct Coordinator {
    route: Route,
    lobby_phase: LobbyPhase,
    lobby_code: Option<String>,
    lobby_status: Option<LobbyStatus>,
    context: Option<GameContext>,
    game_phase: GamePhase,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn observe_lobby(&mut self, view: &LobbyView) -> Vec<Directive> {
        let mut directives = Vec::new();
        let lobby = view
            .lobby
            .as_ref()
            .filter(|_| view.phase == LobbyPhase::InLobby);

        let context = lobby.map(|l| GameContext {
            lobby_code: l.lobby_code.clone(),
            game_name: l.game_name.clone(),
            game_rules: l.game_rules.clone(),
            is_host: view.is_host,
        });
        if context != self.context {
            self.context = context.clone();
            directives.push(Directive::SetGameContext(context));
        }

        match lobby {
            Some(lobby) => {
                let entered = self.lobby_phase != LobbyPhase::InLobby
                    || self.lobby_code.as_deref() != Some(lobby.lobby_code.as_str());
                if entered {
                    debug!(lobby_code = %lobby.lobby_code, "entered lobby");
                    self.lobby_status = None;
                    self.navigate(Route::Lobby(lobby.lobby_code.clone()), &mut directives);
                }
                if lobby.status == LobbyStatus::InGame && self.lobby_status != Some(LobbyStatus::InGame) {
                    debug!(lobby_code = %lobby.lobby_code, "lobby is in game, following it");
                    directives.push(Directive::EnterGame);
                }
                self.lobby_status = Some(lobby.status);
                self.lobby_code = Some(lobby.lobby_code.clone());
            }
            None => {
                if self.lobby_phase == LobbyPhase::InLobby {
                    debug!("lobby gone, resetting game");
                    directives.push(Directive::ResetGame);
                    self.navigate(Route::Home, &mut directives);
                }
                self.lobby_code = None;
                self.lobby_status = None;
            }
        }
        self.lobby_phase = view.phase;
        directives
    }

    pub fn observe_game(&mut self, view: &GameView) -> Vec<Directive> {
        let mut directives = Vec::new();
        if view.phase == GamePhase::InProgress && self.game_phase != GamePhase::InProgress {
            let code = view
                .context
                .as_ref()
                .map(|c| c.lobby_code.clone())
                .or_else(|| self.lobby_code.clone());
            if let Some(code) = code {
                self.navigate(Route::Game(code), &mut directives);
            }
        }
        self.game_phase = view.phase;
        directives
    }

    fn navigate(&mut self, route: Route, directives: &mut Vec<Directive>) {
        if self.route != route {
            self.route = route.clone();
            directives.push(Directive::Navigate(route));
        }
    }
}
