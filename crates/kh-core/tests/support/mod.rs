//! Shared test doubles for kh-core integration tests.

pub mod doubles;
