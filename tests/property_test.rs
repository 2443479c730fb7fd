// tests/property_test.rs

//! Property-based tests for the cluster manager.
//!
//! These verify invariants that must hold for arbitrary inputs: LSN
//! ordering, election winner selection, path layout, and the uniqueness of
//! the ephemeral leader node under racing sessions.

mod property {
    pub mod invariants_test;
    pub mod leader_race_test;
}
