// src/lib.rs
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod metrics;
pub mod retry;

pub use endpoint::{DynamicEndpoints, Endpoint, EndpointKey, EndpointSource, StaticEndpoints};
pub use error::{HealthError, Result};
pub use health::{HealthCheckedGroup, MonitorContext};
