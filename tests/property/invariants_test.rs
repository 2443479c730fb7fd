// tests/property/invariants_test.rs

//! Pure-function invariants: LSN packing, slot names, endpoints, the
//! election winner, and the replacement-request naming contract.

use proptest::prelude::*;

use falcon_cm::core::db::lsn::{lsn_to_num, slot_name};
use falcon_cm::core::membership::pick_winner;
use falcon_cm::core::store::ClusterPaths;
use falcon_cm::core::store::paths::parse_need_supplement;
use falcon_cm::core::types::{Endpoint, Group};

proptest! {
    #[test]
    fn lsn_packing_roundtrips_components(hi in 0u64..=0xFFFF_FFFF, lo in 0u64..=0xFFFF_FFFF) {
        let text = format!("{hi:X}/{lo:X}");
        prop_assert_eq!(lsn_to_num(&text), (hi << 32) | lo);
    }

    #[test]
    fn lsn_ordering_is_monotonic(
        a in 0u64..=0xFFFF_FFFF, b in 0u64..=0xFFFF_FFFF,
        c in 0u64..=0xFFFF_FFFF, d in 0u64..=0xFFFF_FFFF,
    ) {
        let x = lsn_to_num(&format!("{a:X}/{b:X}"));
        let y = lsn_to_num(&format!("{c:X}/{d:X}"));
        prop_assert_eq!(x.cmp(&y), (a, b).cmp(&(c, d)));
    }

    #[test]
    fn slot_names_are_identifier_safe(node in "[a-z0-9.-]{1,64}") {
        let slot = slot_name(&node);
        prop_assert!(!slot.contains('.'));
        prop_assert!(!slot.contains('-'));
        prop_assert_eq!(slot.len(), node.len());
    }

    #[test]
    fn endpoint_display_parse_roundtrips(host in "[a-z0-9.]{1,32}", port in 1u16..=65535) {
        let ep = Endpoint::new(host, port);
        let back: Endpoint = ep.to_string().parse().unwrap();
        prop_assert_eq!(back, ep);
    }

    #[test]
    fn winner_has_max_lsn_and_min_endpoint_among_ties(
        entries in prop::collection::vec(
            (1u16..=200, 0u64..=5),
            1..=12,
        )
    ) {
        // Build distinct endpoints from the port; small LSN range forces ties.
        let deduped: std::collections::BTreeMap<u16, u64> = entries.into_iter().collect();
        let entries: Vec<(Endpoint, u64)> = deduped
            .into_iter()
            .map(|(port, lsn)| (Endpoint::new("10.0.0.1", port), lsn))
            .collect();
        let winner = pick_winner(&entries).unwrap();
        let max_lsn = entries.iter().map(|(_, l)| *l).max().unwrap();
        let winner_lsn = entries.iter().find(|(e, _)| e == winner).unwrap().1;
        prop_assert_eq!(winner_lsn, max_lsn);
        for (ep, lsn) in &entries {
            if *lsn == max_lsn {
                prop_assert!(winner.to_string() <= ep.to_string());
            }
        }
    }

    #[test]
    fn need_supplement_names_roundtrip(dn in 0u32..=64, k in 0u8..=1) {
        let paths = ClusterPaths::new("/falcon");
        let full = paths.need_supplement(Group::Dn(dn), k);
        let child = full.rsplit('/').next().unwrap();
        prop_assert_eq!(parse_need_supplement(child), Some((Group::Dn(dn), k)));
    }

    #[test]
    fn paths_never_contain_double_slashes(node in "[a-zA-Z0-9_-]{1,32}", dn in 0u32..=16) {
        let paths = ClusterPaths::new("/falcon");
        for path in [
            paths.presence(true, &node),
            paths.presence(false, &node),
            paths.host_node(Group::Dn(dn), &node),
            paths.member(Group::Cn, &node),
            paths.supplement(false, &node),
        ] {
            prop_assert!(!path.contains("//"));
            prop_assert!(path.starts_with('/'));
        }
    }
}
