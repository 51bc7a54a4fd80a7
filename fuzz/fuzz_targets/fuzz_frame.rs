#![no_main]

use libfuzzer_sys::fuzz_target;
use lobbylink_client::protocol::{
    ChannelEvent, ChatServerEvent, Frame, GameServerEvent, LobbyServerEvent,
};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(frame) = Frame::parse(text) else {
        return;
    };

    // Decode the payload the way the client loop would, regardless of the
    // channel it claims, so every event table sees arbitrary input.
    let _ = LobbyServerEvent::decode(&frame.event, &frame.data);
    let _ = GameServerEvent::decode(&frame.event, &frame.data);
    if let Ok(event) = ChatServerEvent::decode(&frame.event, &frame.data) {
        let _ = event.route();
    }
});
