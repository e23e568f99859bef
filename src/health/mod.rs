// src/health/mod.rs
mod builder;
mod checker;
mod close;
mod context;
mod dispatch;
mod executor;
mod group;
mod snapshot;
mod strategy;

pub use builder::HealthCheckedGroupBuilder;
pub use checker::HttpHealthChecker;
pub use close::{AsyncCloseable, CloseHandle, CloseState};
pub use context::{MonitorContext, ProbeRequest, DEGRADED_HEADER};
pub use executor::ContextExecutor;
pub use group::{CheckerFactory, EndpointPredicate, HealthCheckedGroup, HealthListener, ListenerId};
pub use snapshot::SnapshotGroup;
pub use strategy::{all, AllStrategy, HealthCheckStrategy, PartialStrategy};
