//! Shared error helpers and cancellable timers used across the switchboard crates.

pub mod error;
pub mod timer;

pub use {
    error::FromMessage,
    timer::{AbortOnDrop, IntervalHandle},
};
