// tests/unit_election_test.rs

use falcon_cm::core::membership::pick_winner;
use falcon_cm::core::types::Endpoint;

fn ep(s: &str) -> Endpoint {
    s.parse().unwrap()
}

#[test]
fn test_empty_candidate_set_has_no_winner() {
    assert_eq!(pick_winner(&[]), None);
}

#[test]
fn test_single_candidate_wins() {
    let entries = vec![(ep("10.0.0.2:5432"), 7)];
    assert_eq!(pick_winner(&entries), Some(&entries[0].0));
}

#[test]
fn test_max_lsn_wins() {
    let entries = vec![
        (ep("10.0.0.2:5432"), 100),
        (ep("10.0.0.3:5432"), 250),
        (ep("10.0.0.4:5432"), 90),
    ];
    assert_eq!(pick_winner(&entries).unwrap(), &ep("10.0.0.3:5432"));
}

#[test]
fn test_lsn_tie_broken_by_smallest_endpoint() {
    let entries = vec![
        (ep("10.0.0.9:5432"), 100),
        (ep("10.0.0.2:5432"), 100),
        (ep("10.0.0.5:5432"), 100),
    ];
    assert_eq!(pick_winner(&entries).unwrap(), &ep("10.0.0.2:5432"));
}

#[test]
fn test_zero_lsn_can_still_win_alone() {
    let entries = vec![(ep("10.0.0.2:5432"), 0)];
    assert_eq!(pick_winner(&entries).unwrap(), &ep("10.0.0.2:5432"));
}

#[test]
fn test_order_of_arrival_is_irrelevant() {
    let forward = vec![
        (ep("10.0.0.2:5432"), 10),
        (ep("10.0.0.3:5432"), 20),
    ];
    let reverse: Vec<_> = forward.iter().rev().cloned().collect();
    let a = pick_winner(&forward).unwrap().clone();
    let b = pick_winner(&reverse).unwrap().clone();
    assert_eq!(a, b);
}
