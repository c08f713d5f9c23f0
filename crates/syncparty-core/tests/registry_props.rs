use std::collections::HashSet;

use proptest::prelude::*;

use syncparty_core::device::GridPos;
use syncparty_core::net::messages::Intent;
use syncparty_core::registry::DeviceRegistry;
use syncparty_core::room::{Outcome, PartyRoom, RoomSettings};
use syncparty_core::transport::MAX_SEQ;

#[derive(Debug, Clone)]
enum Op {
    Join(u8),
    Place(u8, u32, u32),
    Remove(u8),
    Resize(u32),
}

fn requested_seq() -> impl Strategy<Value = Option<u64>> {
    prop_oneof![
        Just(None),
        (0u64..40).prop_map(Some),
        (MAX_SEQ - 3..=MAX_SEQ + 3).prop_map(Some),
        (u64::MAX - 3..=u64::MAX).prop_map(Some),
        any::<u64>().prop_map(Some),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6).prop_map(Op::Join),
        (0u8..6, 0u32..7, 0u32..7).prop_map(|(d, x, y)| Op::Place(d, x, y)),
        (0u8..6).prop_map(Op::Remove),
        (0u32..9).prop_map(Op::Resize),
    ]
}

proptest! {
    #[test]
    fn no_two_devices_share_a_cell(ops in proptest::collection::vec(op(), 1..80)) {
        let mut reg = DeviceRegistry::new(5, 8, 16);
        for op in ops {
            match op {
                Op::Join(d) => { let _ = reg.join(&format!("d{d}"), "label"); },
                Op::Place(d, x, y) => { let _ = reg.place(&format!("d{d}"), GridPos::new(x, y)); },
                Op::Remove(d) => reg.remove(&format!("d{d}")),
                Op::Resize(n) => { let _ = reg.resize(n); },
            }

            let positions: Vec<GridPos> = reg.list().iter().filter_map(|d| d.position).collect();
            let unique: HashSet<GridPos> = positions.iter().copied().collect();
            prop_assert_eq!(positions.len(), unique.len());
            for pos in positions {
                prop_assert!(pos.fits(reg.grid_size()));
            }
            prop_assert!(reg.list().iter().filter(|d| d.is_main_device).count() <= 1);
        }
    }

    #[test]
    fn applied_sequence_numbers_strictly_increase(
        seqs in proptest::collection::vec(requested_seq(), 1..60),
    ) {
        let mut room = PartyRoom::new("PROP0001", "p", "prop", &RoomSettings::default());
        room.apply_intent("a", None, Intent::Join { label: "A".into() }, 0).unwrap();

        let mut last = room.last_seq();
        for (i, seq) in seqs.into_iter().enumerate() {
            let now = 1_000 + i as u64;
            let before = room.transport();
            match room.apply_intent("a", seq, Intent::Seek { seek_ms: i as u64 }, now) {
                Ok(Outcome::Applied(applied)) => {
                    prop_assert!(applied.seq > last);
                    prop_assert!(applied.seq <= MAX_SEQ + 60);
                    last = applied.seq;
                },
                Ok(Outcome::Stale(stale)) => {
                    prop_assert!(stale.seq <= last);
                    prop_assert_eq!(room.transport(), before);
                },
                Err(err) => {
                    prop_assert_eq!(err.code(), "InvalidIntent");
                    prop_assert!(seq.is_some_and(|s| s > MAX_SEQ));
                    prop_assert_eq!(room.transport(), before);
                },
            }
            prop_assert_eq!(room.last_seq(), last);
        }

        // Implicit numbers keep advancing after any mix of requests.
        let Outcome::Applied(applied) = room
            .apply_intent("a", None, Intent::Pause, 10_000)
            .unwrap()
        else {
            panic!("pause should apply");
        };
        prop_assert_eq!(applied.seq, last + 1);
    }

    #[test]
    fn play_always_starts_after_receipt(now in 0u64..u64::MAX / 2, rtt in 0u64..10_000) {
        let settings = RoomSettings::default();
        let mut room = PartyRoom::new("PROP0002", "p", "prop", &settings);
        room.apply_intent("a", None, Intent::Join { label: "A".into() }, now).unwrap();
        room.record_latency("a", rtt);
        let Outcome::Applied(applied) = room
            .apply_intent("a", None, Intent::Play { seek_ms: None }, now)
            .unwrap()
        else {
            panic!("play should apply");
        };
        prop_assert!(room.transport().reference_epoch_ms >= now + settings.safety_margin_ms);
        prop_assert_eq!(applied.events.len(), 1);
    }
}
