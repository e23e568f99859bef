// src/client/mod.rs
mod factory;

pub use factory::{ClientFactory, ClientOptions};
