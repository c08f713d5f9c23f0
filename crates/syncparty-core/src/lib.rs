pub mod device;
pub mod error;
pub mod net;
pub mod registry;
pub mod room;
pub mod time;
pub mod transport;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::net::messages::{ClientMessage, Intent, ServerEvent};
    use crate::net::protocol::{WireFormat, decode_server_event, encode_client_message};
    use crate::room::{Outcome, PartyRoom, RoomSettings};

    /// Fixed clock value for deterministic room tests.
    pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

    /// Create a room with default settings and `n` joined devices named
    /// `dev-1`..`dev-n`.
    pub fn make_room(code: &str, n: usize) -> PartyRoom {
        let mut room = PartyRoom::new(
            code,
            format!("party-{code}"),
            "Test party",
            &RoomSettings::default(),
        );
        for i in 1..=n {
            let outcome = room
                .apply_intent(
                    &format!("dev-{i}"),
                    None,
                    Intent::Join {
                        label: format!("Device {i}"),
                    },
                    TEST_EPOCH_MS,
                )
                .expect("join should succeed");
            assert!(matches!(outcome, Outcome::Applied(_)));
        }
        room
    }

    /// JSON text for an intent envelope, as a browser client would send it.
    pub fn intent_json(intent: Intent, seq: Option<u64>) -> String {
        let bytes = encode_client_message(&ClientMessage::Intent(intent), seq, WireFormat::Json)
            .expect("intent should encode");
        String::from_utf8(bytes).expect("json is utf-8")
    }

    /// Decode a JSON text frame sent by the hub.
    pub fn parse_event_json(text: &str) -> (Option<u64>, ServerEvent) {
        let env = decode_server_event(text.as_bytes(), WireFormat::Json)
            .unwrap_or_else(|e| panic!("bad hub frame {text:?}: {e}"));
        (env.seq, env.message)
    }
}
