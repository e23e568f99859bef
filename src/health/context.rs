// src/health/context.rs
use super::close::{AsyncCloseable, CloseTracker};
use super::executor::ContextExecutor;
use crate::client::{ClientFactory, ClientOptions};
use crate::config::SessionProtocol;
use crate::endpoint::{Endpoint, EndpointKey};
use crate::retry::Backoff;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Response header marking a healthy endpoint as running in degraded mode.
pub const DEGRADED_HEADER: &str = "x-envoy-degraded";

/// Probe settings shared by every context of a group.
pub(crate) struct CheckSettings {
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) protocol: SessionProtocol,
    pub(crate) port: u16,
    pub(crate) backoff: Arc<dyn Backoff>,
    pub(crate) client_factory: ClientFactory,
}

/// Describes the probe request behind a health update, for diagnostics.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub id: Uuid,
    pub method: reqwest::Method,
    pub url: String,
    pub started_at: Instant,
}

impl ProbeRequest {
    pub fn new(method: reqwest::Method, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            url: url.into(),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct HealthUpdate {
    pub(crate) key: EndpointKey,
    pub(crate) context_id: u64,
    pub(crate) score: f64,
    pub(crate) degraded: bool,
    pub(crate) cause: Option<String>,
}

/// Receives health updates posted by contexts.
pub(crate) trait HealthSink: Send + Sync {
    fn post_health(&self, update: HealthUpdate);
}

#[derive(Debug, Default)]
struct HealthState {
    initialized: bool,
    score: f64,
    degraded: bool,
    last_failure: Option<String>,
    last_updated: Option<DateTime<Utc>>,
}

/// Per-endpoint handle given to a checker factory.
///
/// A context lives while its endpoint is tracked by the group. After it is
/// destroyed its task queue rejects new work and [`update_health`] calls
/// are ignored.
///
/// [`update_health`]: MonitorContext::update_health
pub struct MonitorContext {
    id: u64,
    epoch: u64,
    endpoint: Endpoint,
    settings: Arc<CheckSettings>,
    executor: ContextExecutor,
    sink: Weak<dyn HealthSink>,
    health: Mutex<HealthState>,
    consecutive_failures: AtomicU32,
    destroyed: AtomicBool,
    checker: Mutex<Option<Arc<dyn AsyncCloseable>>>,
}

impl MonitorContext {
    pub(crate) fn new(
        id: u64,
        epoch: u64,
        endpoint: Endpoint,
        settings: Arc<CheckSettings>,
        closes: &CloseTracker,
        sink: Weak<dyn HealthSink>,
    ) -> Arc<Self> {
        let executor = ContextExecutor::new(endpoint.key().clone(), closes.runtime().clone());
        Arc::new(Self {
            id,
            epoch,
            endpoint,
            settings,
            executor,
            sink,
            health: Mutex::new(HealthState::default()),
            consecutive_failures: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            checker: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn executor(&self) -> &ContextExecutor {
        &self.executor
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.settings.protocol
    }

    /// The configured probe port, else the endpoint's port, else the
    /// protocol's default port.
    pub fn probe_port(&self) -> u16 {
        match self.settings.port {
            0 => self
                .endpoint
                .port()
                .unwrap_or_else(|| self.settings.protocol.default_port()),
            port => port,
        }
    }

    pub fn interval(&self) -> Duration {
        self.settings.interval
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    pub fn retry_backoff(&self) -> &Arc<dyn Backoff> {
        &self.settings.backoff
    }

    pub fn client_factory(&self) -> &ClientFactory {
        &self.settings.client_factory
    }

    pub fn client_options(&self) -> &ClientOptions {
        self.settings.client_factory.options()
    }

    /// Delay before the next probe: the interval after a success, the retry
    /// backoff after consecutive failures.
    pub fn next_delay(&self) -> Duration {
        match self.consecutive_failures.load(Ordering::SeqCst) {
            0 => self.settings.interval,
            failures => self.settings.backoff.next_delay(failures),
        }
    }

    /// Reports the outcome of a probe.
    ///
    /// `score` is clamped to [0, 1]; any positive score counts as healthy.
    /// The endpoint is degraded when `headers` carries [`DEGRADED_HEADER`].
    /// `cause` is only recorded for diagnostics. Calls made after the
    /// context is destroyed have no effect.
    pub fn update_health(
        &self,
        score: f64,
        request: Option<&ProbeRequest>,
        headers: Option<&HeaderMap>,
        cause: Option<&anyhow::Error>,
    ) {
        if self.is_destroyed() {
            debug!(endpoint = %self.endpoint, "Ignoring health update for destroyed context");
            return;
        }

        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        if score > 0.0 {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        }

        let degraded = headers.map_or(false, |h| h.contains_key(DEGRADED_HEADER));
        let cause = cause.map(|e| format!("{:#}", e));
        if let Some(cause) = &cause {
            debug!(
                endpoint = %self.endpoint,
                request = ?request.map(|r| r.id),
                url = ?request.map(|r| r.url.as_str()),
                "Health check failed: {}",
                cause
            );
        }

        if let Some(sink) = self.sink.upgrade() {
            sink.post_health(HealthUpdate {
                key: self.endpoint.key().clone(),
                context_id: self.id,
                score,
                degraded,
                cause,
            });
        }
    }

    pub fn health_score(&self) -> f64 {
        self.health.lock().score
    }

    pub fn is_degraded(&self) -> bool {
        self.health.lock().degraded
    }

    pub fn last_failure(&self) -> Option<String> {
        self.health.lock().last_failure.clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.health.lock().last_updated
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// The candidate-list revision this context was created for.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.health.lock().initialized
    }

    /// Initialized, or destroyed before its first update.
    pub(crate) fn is_settled(&self) -> bool {
        self.is_destroyed() || self.is_initialized()
    }

    /// Healthy as seen by the group: initialized, alive, and score > 0.
    pub(crate) fn counts_as_healthy(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let health = self.health.lock();
        health.initialized && health.score > 0.0
    }

    /// Applies an update and returns whether the visible health changed.
    pub(crate) fn apply(&self, score: f64, degraded: bool, cause: Option<String>) -> bool {
        let mut health = self.health.lock();
        let was_healthy = health.initialized && health.score > 0.0;
        let first = !health.initialized;
        let degraded_changed = health.degraded != degraded;

        health.initialized = true;
        health.score = score;
        health.degraded = degraded;
        health.last_updated = Some(Utc::now());
        if let Some(cause) = cause {
            health.last_failure = Some(cause);
        }

        first || was_healthy != (score > 0.0) || degraded_changed
    }

    pub(crate) fn attach_checker(&self, checker: Arc<dyn AsyncCloseable>, closes: &Arc<CloseTracker>) {
        let mut slot = self.checker.lock();
        if self.is_destroyed() {
            drop(slot);
            closes.spawn_close(self.endpoint.key().clone(), checker);
            return;
        }
        *slot = Some(checker);
    }

    /// Terminal and idempotent. Queued work is left to finish; the checker
    /// is closed in the background.
    pub(crate) fn destroy(&self, closes: &Arc<CloseTracker>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.executor.shutdown();

        let checker = self.checker.lock().take();
        if let Some(checker) = checker {
            closes.spawn_close(self.endpoint.key().clone(), checker);
        }
        debug!(endpoint = %self.endpoint, epoch = self.epoch, "Health checker context destroyed");
    }
}

impl std::fmt::Debug for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorContext")
            .field("endpoint", &self.endpoint.key())
            .field("epoch", &self.epoch)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FixedBackoff;
    use reqwest::header::HeaderValue;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<HealthUpdate>>,
    }

    impl HealthSink for Recorder {
        fn post_health(&self, update: HealthUpdate) {
            self.updates.lock().push(update);
        }
    }

    fn settings(port: u16) -> Arc<CheckSettings> {
        Arc::new(CheckSettings {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(1),
            protocol: SessionProtocol::Https,
            port,
            backoff: Arc::new(FixedBackoff::new(Duration::from_millis(250))),
            client_factory: ClientFactory::default(),
        })
    }

    fn context(endpoint: Endpoint, port: u16, sink: &Arc<Recorder>) -> (Arc<MonitorContext>, Arc<CloseTracker>) {
        let closes = CloseTracker::new(Handle::current());
        let weak: Weak<dyn HealthSink> = Arc::downgrade(sink) as Weak<dyn HealthSink>;
        let ctx = MonitorContext::new(7, 1, endpoint, settings(port), &closes, weak);
        (ctx, closes)
    }

    #[tokio::test]
    async fn test_update_health_posts_clamped_score_and_degraded_flag() {
        let sink = Arc::new(Recorder::default());
        let (ctx, _closes) = context(Endpoint::of("foo"), 0, &sink);

        let mut headers = HeaderMap::new();
        headers.insert(DEGRADED_HEADER, HeaderValue::from_static(""));
        ctx.update_health(7.0, None, Some(&headers), None);
        ctx.update_health(f64::NAN, None, None, Some(&anyhow::anyhow!("refused")));

        let updates = sink.updates.lock();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].score, 1.0);
        assert!(updates[0].degraded);
        assert_eq!(updates[0].context_id, 7);
        assert_eq!(updates[1].score, 0.0);
        assert!(!updates[1].degraded);
        assert_eq!(updates[1].cause.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn test_next_delay_follows_outcomes() {
        let sink = Arc::new(Recorder::default());
        let (ctx, _closes) = context(Endpoint::of("foo"), 0, &sink);

        assert_eq!(ctx.next_delay(), Duration::from_secs(3));
        ctx.update_health(0.0, None, None, None);
        assert_eq!(ctx.next_delay(), Duration::from_millis(250));
        ctx.update_health(1.0, None, None, None);
        assert_eq!(ctx.next_delay(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_probe_port_resolution() {
        let sink = Arc::new(Recorder::default());
        let (ctx, _) = context(Endpoint::of("foo"), 0, &sink);
        assert_eq!(ctx.probe_port(), 443);
        let (ctx, _) = context(Endpoint::new("foo", 8080), 0, &sink);
        assert_eq!(ctx.probe_port(), 8080);
        let (ctx, _) = context(Endpoint::new("foo", 8080), 9090, &sink);
        assert_eq!(ctx.probe_port(), 9090);
    }

    #[tokio::test]
    async fn test_apply_reports_visible_changes_only() {
        let sink = Arc::new(Recorder::default());
        let (ctx, _) = context(Endpoint::of("foo"), 0, &sink);

        assert!(!ctx.is_settled());
        assert!(ctx.apply(0.0, false, Some("timeout".into())));
        assert!(ctx.is_settled());
        assert!(!ctx.counts_as_healthy());
        assert!(!ctx.apply(0.0, false, None));
        assert!(ctx.apply(0.5, false, None));
        assert!(ctx.counts_as_healthy());
        assert!(!ctx.apply(1.0, false, None));
        assert!(ctx.apply(1.0, true, None));
        assert_eq!(ctx.last_failure().as_deref(), Some("timeout"));
        assert!(ctx.last_updated().is_some());
    }

    #[tokio::test]
    async fn test_destroy_is_terminal() {
        let sink = Arc::new(Recorder::default());
        let (ctx, closes) = context(Endpoint::of("foo"), 0, &sink);
        let checker = Arc::new(super::super::CloseHandle::new());
        ctx.attach_checker(checker.clone(), &closes);

        ctx.destroy(&closes);
        ctx.destroy(&closes);
        closes.wait_idle().await;

        assert!(checker.is_closed());
        assert!(ctx.is_destroyed());
        assert!(ctx.is_settled());
        assert!(ctx.executor().execute(|| {}).unwrap_err().is_destroyed());

        ctx.update_health(1.0, None, None, None);
        assert!(sink.updates.lock().is_empty());
        assert!(!ctx.counts_as_healthy());

        // A checker attached after destruction is closed right away.
        let late = Arc::new(super::super::CloseHandle::new());
        ctx.attach_checker(late.clone(), &closes);
        closes.wait_idle().await;
        assert!(late.is_closed());
    }
}
