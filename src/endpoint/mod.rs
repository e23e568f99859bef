// src/endpoint/mod.rs
mod endpoint;
mod source;

pub use endpoint::{Attributes, Endpoint, EndpointKey, DEFAULT_WEIGHT};
pub(crate) use endpoint::snapshots_identical;
pub use source::{
    DynamicEndpoints, EndpointSource, SourceListener, SourceUpdate, StaticEndpoints,
    SubscriptionId,
};
