// tests/property/leader_race_test.rs

//! The leader node stays unique under racing sessions: for any number of
//! contenders, exactly one ephemeral create succeeds, and the slot only
//! reopens when the holder's session dies.

use proptest::prelude::*;

use falcon_cm::core::CmError;
use falcon_cm::core::store::CoordStore;
use falcon_cm::core::store::memory::MemoryStore;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        ..ProptestConfig::default()
    })]

    #[test]
    fn leader_create_is_unique_across_sessions(contenders in 2usize..=8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = MemoryStore::new();
            let admin = store.session();
            admin.create("/falcon", b"", false).await.unwrap();
            admin.create("/falcon/leaders", b"", false).await.unwrap();

            let sessions: Vec<_> = (0..contenders).map(|_| store.session()).collect();
            let mut wins = 0;
            let mut losses = 0;
            let mut winner = None;
            for (i, session) in sessions.iter().enumerate() {
                match session.create("/falcon/leaders/cn", b"ep", true).await {
                    Ok(()) => {
                        wins += 1;
                        winner = Some(i);
                    }
                    Err(CmError::AlreadyExists(_)) => losses += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!(wins, 1);
            assert_eq!(losses, contenders - 1);

            // Losing a non-holder session changes nothing.
            let loser = (winner.unwrap() + 1) % contenders;
            store.expire_session(&sessions[loser]);
            assert!(admin.exists("/falcon/leaders/cn").await.unwrap());

            // Losing the holder's session frees the slot for a new create.
            store.expire_session(&sessions[winner.unwrap()]);
            assert!(!admin.exists("/falcon/leaders/cn").await.unwrap());
            admin.create("/falcon/leaders/cn", b"ep2", true).await.unwrap();
        });
    }
}
