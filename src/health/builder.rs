// src/health/builder.rs
use super::checker::HttpHealthChecker;
use super::close::CloseTracker;
use super::context::CheckSettings;
use super::group::{CheckerFactory, EndpointPredicate, GroupParts, HealthCheckedGroup};
use super::strategy::{all, HealthCheckStrategy};
use crate::client::{ClientFactory, ClientOptions};
use crate::config::{HealthCheckConfig, SessionProtocol};
use crate::endpoint::{Endpoint, EndpointSource};
use crate::error::{HealthError, Result};
use crate::metrics::HealthMetrics;
use crate::retry::{Backoff, ExponentialBackoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Builder for [`HealthCheckedGroup`]. Without a checker factory the group
/// probes every endpoint over HTTP at the configured path.
pub struct HealthCheckedGroupBuilder {
    source: Arc<dyn EndpointSource>,
    name: String,
    config: HealthCheckConfig,
    backoff: Option<Arc<dyn Backoff>>,
    client_options: Option<ClientOptions>,
    client_factory: Option<ClientFactory>,
    checker_factory: Option<CheckerFactory>,
    strategy: Arc<dyn HealthCheckStrategy>,
    predicate: Option<EndpointPredicate>,
    metrics: Option<Arc<HealthMetrics>>,
    runtime: Option<Handle>,
}

impl HealthCheckedGroup {
    pub fn builder<S>(source: S) -> HealthCheckedGroupBuilder
    where
        S: EndpointSource + 'static,
    {
        HealthCheckedGroupBuilder::new(Arc::new(source))
    }
}

impl HealthCheckedGroupBuilder {
    pub fn new(source: Arc<dyn EndpointSource>) -> Self {
        Self {
            source,
            name: "default".to_string(),
            config: HealthCheckConfig::default(),
            backoff: None,
            client_options: None,
            client_factory: None,
            checker_factory: None,
            strategy: all(),
            predicate: None,
            metrics: None,
            runtime: None,
        }
    }

    /// Name used in logs and metric labels.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Takes timing, protocol, port, path, retry and client settings from
    /// `config`. Later `with_*` calls override individual values.
    pub fn with_config(mut self, config: &HealthCheckConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.interval_ms = millis(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = millis(timeout);
        self
    }

    pub fn with_protocol(mut self, protocol: SessionProtocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Probe port; 0 uses each endpoint's own port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Path probed by the default HTTP checker.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Ignored when a client factory is supplied.
    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client_options = Some(options);
        self
    }

    /// The factory owns the group: closing it closes the group.
    pub fn with_client_factory(mut self, factory: ClientFactory) -> Self {
        self.client_factory = Some(factory);
        self
    }

    pub fn with_checker_factory(mut self, factory: CheckerFactory) -> Self {
        self.checker_factory = Some(factory);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn HealthCheckStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Endpoint) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runtime that drives context task queues. Defaults to the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validates the settings, subscribes to the source and starts checking.
    pub fn build(self) -> Result<HealthCheckedGroup> {
        self.config
            .validate()
            .map_err(|e| HealthError::Config(e.to_string()))?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| HealthError::NoRuntime)?,
        };

        let client_factory = match self.client_factory {
            Some(factory) => factory,
            None => ClientFactory::new(
                self.client_options
                    .unwrap_or_else(|| ClientOptions::from(&self.config.client)),
            ),
        };
        if client_factory.is_closing() {
            return Err(HealthError::FactoryClosed);
        }

        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::from_config(&self.config.retry)));
        let checker_factory = self
            .checker_factory
            .unwrap_or_else(|| HttpHealthChecker::new(&self.config.path).into_factory());

        let settings = Arc::new(CheckSettings {
            interval: self.config.interval(),
            timeout: self.config.timeout(),
            protocol: self.config.protocol,
            port: self.config.port,
            backoff,
            client_factory,
        });

        HealthCheckedGroup::start(GroupParts {
            name: self.name,
            source: self.source,
            settings,
            checker_factory,
            strategy: self.strategy,
            predicate: self.predicate,
            metrics: self.metrics,
            closes: CloseTracker::new(runtime),
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::StaticEndpoints;

    #[test]
    fn test_build_requires_runtime() {
        let result = HealthCheckedGroup::builder(StaticEndpoints::new(Vec::<Endpoint>::new())).build();
        assert!(matches!(result, Err(HealthError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let result = HealthCheckedGroup::builder(StaticEndpoints::new(Vec::<Endpoint>::new()))
            .with_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(HealthError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_closed_factory() {
        use crate::health::AsyncCloseable;

        let factory = ClientFactory::default();
        factory.close().await.unwrap();
        let result = HealthCheckedGroup::builder(StaticEndpoints::new(Vec::<Endpoint>::new()))
            .with_client_factory(factory)
            .build();
        assert!(matches!(result, Err(HealthError::FactoryClosed)));
    }

    #[test]
    fn test_durations_saturate_instead_of_truncating() {
        let builder = HealthCheckedGroupBuilder::new(Arc::new(StaticEndpoints::new(Vec::new())))
            .with_interval(Duration::MAX)
            .with_timeout(Duration::from_millis(1500));
        assert_eq!(builder.config.interval_ms, u64::MAX);
        assert_eq!(builder.config.timeout_ms, 1500);
    }

    #[tokio::test]
    async fn test_empty_source_is_ready_immediately() {
        let group = HealthCheckedGroup::builder(StaticEndpoints::new(Vec::<Endpoint>::new()))
            .with_name("empty")
            .build()
            .unwrap();
        assert!(group.when_ready().await.unwrap().is_empty());
        assert_eq!(group.name(), "empty");
        group.close().await.unwrap();
    }
}
