#![no_main]

use libfuzzer_sys::fuzz_target;
use lobbylink_client::protocol::game::GameState;
use lobbylink_client::state::game::turn_remaining;
use lobbylink_client::state::{MoveValidator, TicTacToe};

fuzz_target!(|data: &[u8]| {
    let Ok(state) = serde_json::from_slice::<GameState>(data) else {
        return;
    };

    // Countdowns must never panic on skewed or absurd timestamps.
    let _ = turn_remaining(&state, chrono::Utc::now());

    for position in [0, 4, 8, 9] {
        let _ = TicTacToe.check(&state, &serde_json::json!({ "position": position }));
    }
});
