//! End-to-end sync scenarios against an in-process fake remote.

mod common;
mod test_invariants;
mod test_scenarios;
