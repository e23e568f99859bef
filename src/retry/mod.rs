// src/retry/mod.rs
mod backoff;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
