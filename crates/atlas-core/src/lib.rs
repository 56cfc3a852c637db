//! Foundational low-level utilities shared across Atlas crates.
//!
//! Provides the atomic snapshot-write helper and clock utilities used by the
//! task-runtime persistence layer.

pub mod clock;
pub mod fs_atomic;

pub use clock::unix_timestamp_ms;
pub use fs_atomic::write_atomic;
