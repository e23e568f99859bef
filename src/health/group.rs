// src/health/group.rs
use super::close::{AsyncCloseable, CloseHandle, CloseTracker};
use super::context::{CheckSettings, HealthSink, HealthUpdate, MonitorContext};
use super::dispatch::Dispatcher;
use super::snapshot::{SnapshotChain, SnapshotGroup};
use super::strategy::HealthCheckStrategy;
use crate::endpoint::{snapshots_identical, Endpoint, EndpointKey, EndpointSource, SourceUpdate, SubscriptionId};
use crate::error::{HealthError, Result};
use crate::metrics::HealthMetrics;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Creates the checker for a freshly tracked endpoint. The returned resource
/// is closed when the endpoint stops being tracked.
pub type CheckerFactory =
    Arc<dyn Fn(Arc<MonitorContext>) -> anyhow::Result<Arc<dyn AsyncCloseable>> + Send + Sync>;

/// Filters candidates before they are considered for health checking.
pub type EndpointPredicate = Arc<dyn Fn(&Endpoint) -> bool + Send + Sync>;

/// Receives every published healthy-endpoint snapshot.
pub type HealthListener = Arc<dyn Fn(&[Endpoint]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
enum Readiness {
    Pending,
    Ready(Arc<Vec<Endpoint>>),
    Closed,
}

enum Event {
    Source(SourceUpdate),
    Health(HealthUpdate),
    AddListener {
        id: ListenerId,
        listener: HealthListener,
        notify_initial: bool,
    },
}

struct Tracked {
    ctx: Arc<MonitorContext>,
    refs: usize,
}

#[derive(Default)]
struct GroupState {
    revision: Option<u64>,
    contexts: HashMap<EndpointKey, Tracked>,
    chain: SnapshotChain,
    ready: bool,
}

/// Everything a group needs besides its runtime state. Built by
/// [`HealthCheckedGroupBuilder`](super::HealthCheckedGroupBuilder).
pub(crate) struct GroupParts {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn EndpointSource>,
    pub(crate) settings: Arc<CheckSettings>,
    pub(crate) checker_factory: CheckerFactory,
    pub(crate) strategy: Arc<dyn HealthCheckStrategy>,
    pub(crate) predicate: Option<EndpointPredicate>,
    pub(crate) metrics: Option<Arc<HealthMetrics>>,
    pub(crate) closes: Arc<CloseTracker>,
}

pub(crate) struct GroupInner {
    name: String,
    source: Arc<dyn EndpointSource>,
    settings: Arc<CheckSettings>,
    checker_factory: CheckerFactory,
    strategy: Arc<dyn HealthCheckStrategy>,
    predicate: Option<EndpointPredicate>,
    metrics: Option<Arc<HealthMetrics>>,
    closes: Arc<CloseTracker>,

    state: Mutex<GroupState>,
    dispatcher: Dispatcher<Event>,
    snapshot: ArcSwap<Vec<Endpoint>>,
    listeners: Mutex<Vec<(ListenerId, HealthListener)>>,
    readiness: watch::Sender<Readiness>,
    lifecycle: CloseHandle,
    outcome: OnceLock<Result<()>>,

    subscription: Mutex<Option<SubscriptionId>>,
    registration: Mutex<Option<u64>>,
    next_context_id: AtomicU64,
    next_listener_id: AtomicU64,
    this: Weak<GroupInner>,
}

/// A live view of the healthy subset of a changing candidate list.
///
/// Every candidate selected by the strategy gets a [`MonitorContext`] and a
/// checker built by the checker factory. The group publishes the endpoints
/// whose contexts report a positive score, in candidate order, with the
/// `healthy` and `degraded` attributes filled in. Snapshot transitions are
/// totally ordered and listeners see each one exactly once.
#[derive(Clone)]
pub struct HealthCheckedGroup {
    inner: Arc<GroupInner>,
}

impl HealthCheckedGroup {
    pub(crate) fn start(parts: GroupParts) -> Result<Self> {
        let inner = Arc::new_cyclic(|this| GroupInner {
            name: parts.name,
            source: parts.source,
            settings: parts.settings,
            checker_factory: parts.checker_factory,
            strategy: parts.strategy,
            predicate: parts.predicate,
            metrics: parts.metrics,
            closes: parts.closes,
            state: Mutex::new(GroupState::default()),
            dispatcher: Dispatcher::new(),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            readiness: watch::channel(Readiness::Pending).0,
            lifecycle: CloseHandle::new(),
            outcome: OnceLock::new(),
            subscription: Mutex::new(None),
            registration: Mutex::new(None),
            next_context_id: AtomicU64::new(0),
            next_listener_id: AtomicU64::new(0),
            this: this.clone(),
        });

        let owned: Weak<dyn AsyncCloseable> = Arc::downgrade(&inner) as Weak<dyn AsyncCloseable>;
        let registration = inner.settings.client_factory.register(owned)?;
        *inner.registration.lock() = Some(registration);

        let weak = Arc::downgrade(&inner);
        let (subscription, current) = inner.source.subscribe(Arc::new(move |update: SourceUpdate| {
            if let Some(inner) = weak.upgrade() {
                inner.post(Event::Source(update));
            }
        }));
        *inner.subscription.lock() = Some(subscription);

        info!(
            group = %inner.name,
            strategy = inner.strategy.name(),
            interval = ?inner.settings.interval,
            "Health-checked endpoint group started"
        );

        if let Some(update) = current {
            inner.post(Event::Source(update));
        }
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The last published snapshot. It stays as it was when the group closed.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.snapshot.load().as_ref().clone()
    }

    /// Same as [`endpoints`](Self::endpoints), but empty once closing starts.
    pub fn all_healthy_endpoints(&self) -> Vec<Endpoint> {
        if self.is_closing() {
            return Vec::new();
        }
        self.endpoints()
    }

    /// Resolves with the first published snapshot, which is published once
    /// every context of some candidate revision has had its first update.
    /// Fails with [`HealthError::Closed`] if the group closes first.
    pub async fn when_ready(&self) -> Result<Vec<Endpoint>> {
        let mut rx = self.inner.readiness.subscribe();
        let readiness = rx
            .wait_for(|r| !matches!(r, Readiness::Pending))
            .await
            .map_err(|_| HealthError::Closed)?
            .clone();
        match readiness {
            Readiness::Ready(snapshot) => Ok(snapshot.as_ref().clone()),
            _ => Err(HealthError::Closed),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Registers `listener` for every snapshot published from now on. With
    /// `notify_initial`, a ready group also delivers its current snapshot
    /// right away, ahead of any later transition.
    pub fn add_listener<F>(&self, listener: F, notify_initial: bool) -> ListenerId
    where
        F: Fn(&[Endpoint]) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.post(Event::AddListener {
            id,
            listener: Arc::new(listener),
            notify_initial,
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Stops following the source, destroys every context, and waits for all
    /// checkers to close. Concurrent and repeated calls share one outcome;
    /// checker close failures are reported together as
    /// [`HealthError::CheckerClose`].
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown().await
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lifecycle.is_closing()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    /// The snapshot groups currently in the chain, oldest first.
    pub fn snapshot_groups(&self) -> Vec<Arc<SnapshotGroup>> {
        self.inner.state.lock().chain.peek()
    }

    /// Number of endpoints with a live context.
    pub fn monitored_count(&self) -> usize {
        self.inner.state.lock().contexts.len()
    }

    /// The live context for `key`, if the endpoint is tracked.
    pub fn context(&self, key: &EndpointKey) -> Option<Arc<MonitorContext>> {
        self.inner.state.lock().contexts.get(key).map(|t| t.ctx.clone())
    }
}

impl std::fmt::Debug for HealthCheckedGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckedGroup")
            .field("name", &self.inner.name)
            .field("endpoints", &self.inner.snapshot.load().len())
            .field("state", &self.inner.lifecycle.state())
            .finish()
    }
}

#[async_trait]
impl AsyncCloseable for HealthCheckedGroup {
    async fn close(&self) -> anyhow::Result<()> {
        Ok(self.inner.shutdown().await?)
    }
}

impl GroupInner {
    fn post(&self, event: Event) {
        self.dispatcher.dispatch(event, |event| self.handle(event));
    }

    fn handle(&self, event: Event) {
        match event {
            Event::Source(update) => self.reconcile(update),
            Event::Health(update) => self.apply_health(update),
            Event::AddListener {
                id,
                listener,
                notify_initial,
            } => {
                self.listeners.lock().push((id, listener.clone()));
                if notify_initial && self.is_ready() && !self.lifecycle.is_closing() {
                    let current = self.snapshot.load_full();
                    listener(current.as_slice());
                }
            }
        }
    }

    fn is_ready(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Ready(_))
    }

    fn reconcile(&self, update: SourceUpdate) {
        let mut state = self.state.lock();
        if self.lifecycle.is_closing() {
            return;
        }
        if let Some(current) = state.revision {
            if update.revision <= current {
                debug!(group = %self.name, revision = update.revision, current, "Ignoring stale candidate list");
                return;
            }
        }
        state.revision = Some(update.revision);

        let mut seen = HashSet::new();
        let candidates: Vec<Endpoint> = update
            .endpoints
            .iter()
            .filter(|e| self.predicate.as_ref().map_or(true, |accept| accept(*e)))
            .filter(|e| seen.insert(e.key().clone()))
            .cloned()
            .collect();
        let selected = self.strategy.select(&candidates);

        let mut contexts = HashMap::with_capacity(selected.len());
        let mut created = Vec::new();
        for endpoint in selected {
            if contexts.contains_key(endpoint.key()) {
                continue;
            }
            let key = endpoint.key().clone();
            let ctx = match state.contexts.get_mut(&key) {
                Some(tracked) => {
                    tracked.refs += 1;
                    tracked.ctx.clone()
                }
                None => {
                    let ctx = MonitorContext::new(
                        self.next_context_id.fetch_add(1, Ordering::Relaxed),
                        update.revision,
                        endpoint,
                        self.settings.clone(),
                        &self.closes,
                        self.this.clone() as Weak<dyn HealthSink>,
                    );
                    state.contexts.insert(key.clone(), Tracked { ctx: ctx.clone(), refs: 1 });
                    created.push(ctx.clone());
                    ctx
                }
            };
            contexts.insert(key, ctx);
        }

        state.chain.push(SnapshotGroup::new(update.revision, candidates, contexts));
        debug!(
            group = %self.name,
            revision = update.revision,
            monitored = state.contexts.len(),
            created = created.len(),
            chain = state.chain.len(),
            "Reconciled candidate list"
        );
        if let Some(metrics) = &self.metrics {
            metrics.update_monitored(&self.name, state.contexts.len());
        }
        // Raised under the lock so a concurrent close waits for these factories.
        let _starting = (!created.is_empty()).then(|| self.closes.enter());
        drop(state);

        // Factories run unlocked; updates they post are queued behind this event.
        for ctx in &created {
            self.start_checker(ctx);
        }

        let state = self.state.lock();
        if self.lifecycle.is_closing() {
            return;
        }
        self.settle(state);
    }

    fn start_checker(&self, ctx: &Arc<MonitorContext>) {
        if ctx.is_destroyed() {
            return;
        }
        match (self.checker_factory)(ctx.clone()) {
            Ok(checker) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_checker_created(&self.name);
                }
                ctx.attach_checker(checker, &self.closes);
            }
            Err(e) => {
                warn!(
                    group = %self.name,
                    endpoint = %ctx.endpoint(),
                    "Failed to create health checker: {:#}",
                    e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_checker_failure(&self.name, "create");
                }
                ctx.apply(0.0, false, Some(format!("{:#}", e)));
            }
        }
    }

    fn apply_health(&self, update: HealthUpdate) {
        let state = self.state.lock();
        if self.lifecycle.is_closing() {
            return;
        }
        let ctx = match state.contexts.get(&update.key) {
            Some(tracked) if tracked.ctx.id() == update.context_id && !tracked.ctx.is_destroyed() => {
                tracked.ctx.clone()
            }
            _ => return,
        };

        let healthy = update.score > 0.0;
        let changed = ctx.apply(update.score, update.degraded, update.cause);
        if let Some(metrics) = &self.metrics {
            metrics.record_health_update(&self.name, &update.key.to_string(), healthy);
        }
        if !changed {
            return;
        }
        debug!(
            group = %self.name,
            endpoint = %update.key,
            score = update.score,
            degraded = update.degraded,
            "Endpoint health changed"
        );
        self.settle(state);
    }

    /// Publishes what the chain now shows, then retires the groups made
    /// obsolete by the newest initialized one and publishes again. Until the
    /// group is ready nothing is published.
    fn settle(&self, mut state: MutexGuard<'_, GroupState>) {
        let mut snapshots = Vec::with_capacity(2);

        if !state.ready {
            let Some(index) = state.chain.latest_initialized_index() else {
                return;
            };
            let retired = state.chain.retire_before(index);
            self.release(&mut state, retired);
            state.ready = true;
            snapshots.push(state.chain.healthy_endpoints());
        } else {
            snapshots.push(state.chain.healthy_endpoints());
            if let Some(index) = state.chain.latest_initialized_index().filter(|i| *i > 0) {
                let retired = state.chain.retire_before(index);
                self.release(&mut state, retired);
                snapshots.push(state.chain.healthy_endpoints());
            }
        }

        let monitored = state.contexts.len();
        drop(state);

        for snapshot in snapshots {
            self.publish(snapshot, monitored);
        }
    }

    fn release(&self, state: &mut GroupState, retired: Vec<Arc<SnapshotGroup>>) {
        for group in retired {
            for key in group.keys() {
                let Some(tracked) = state.contexts.get_mut(key) else {
                    continue;
                };
                tracked.refs -= 1;
                if tracked.refs > 0 {
                    continue;
                }
                if let Some(tracked) = state.contexts.remove(key) {
                    tracked.ctx.destroy(&self.closes);
                    if let Some(metrics) = &self.metrics {
                        metrics.forget_endpoint(&self.name, &key.to_string());
                    }
                }
            }
            debug!(group = %self.name, revision = group.revision(), "Retired snapshot group");
        }
    }

    fn publish(&self, snapshot: Vec<Endpoint>, monitored: usize) {
        if self.lifecycle.is_closing() {
            return;
        }
        let first = !self.is_ready();
        if !first && snapshots_identical(self.snapshot.load().as_slice(), &snapshot) {
            return;
        }

        let snapshot = Arc::new(snapshot);
        self.snapshot.store(snapshot.clone());
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(&self.name, snapshot.len(), monitored);
        }

        if first {
            self.readiness.send_replace(Readiness::Ready(snapshot.clone()));
            info!(
                group = %self.name,
                healthy = snapshot.len(),
                monitored,
                "Health-checked endpoint group is ready"
            );
        } else {
            debug!(group = %self.name, healthy = snapshot.len(), monitored, "Published healthy endpoints");
        }

        let listeners: Vec<HealthListener> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(snapshot.as_slice());
        }
    }

    /// Stops following the source and destroys every context.
    fn detach(&self) -> usize {
        if let Some(id) = self.subscription.lock().take() {
            self.source.unsubscribe(id);
        }
        if let Some(id) = self.registration.lock().take() {
            self.settings.client_factory.deregister(id);
        }

        let contexts: Vec<Arc<MonitorContext>> = {
            let mut state = self.state.lock();
            state.chain.drain();
            state.contexts.drain().map(|(_, tracked)| tracked.ctx).collect()
        };
        for ctx in &contexts {
            ctx.destroy(&self.closes);
        }
        contexts.len()
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.lifecycle.begin_close() {
            self.lifecycle.when_closed().await;
            return self.outcome.get().cloned().unwrap_or(Ok(()));
        }

        self.closes.start_collecting();
        let destroyed = self.detach();
        self.readiness.send_if_modified(|r| {
            if matches!(r, Readiness::Pending) {
                *r = Readiness::Closed;
                true
            } else {
                false
            }
        });
        if let Some(metrics) = &self.metrics {
            metrics.update_monitored(&self.name, 0);
        }
        info!(
            group = %self.name,
            contexts = destroyed,
            pending_closes = self.closes.pending(),
            "Closing health-checked endpoint group"
        );

        self.closes.wait_idle().await;
        let failures = self.closes.take_failures();
        let outcome = if failures.is_empty() {
            Ok(())
        } else {
            if let Some(metrics) = &self.metrics {
                for _ in &failures {
                    metrics.record_checker_failure(&self.name, "close");
                }
            }
            Err(HealthError::CheckerClose(failures))
        };

        let _ = self.outcome.set(outcome.clone());
        self.lifecycle
            .finish_close(outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        match &outcome {
            Ok(()) => info!(group = %self.name, "Health-checked endpoint group closed"),
            Err(e) => warn!(group = %self.name, "Health-checked endpoint group closed: {}", e),
        }
        outcome
    }
}

impl HealthSink for GroupInner {
    fn post_health(&self, update: HealthUpdate) {
        self.post(Event::Health(update));
    }
}

#[async_trait]
impl AsyncCloseable for GroupInner {
    async fn close(&self) -> anyhow::Result<()> {
        Ok(self.shutdown().await?)
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if !self.lifecycle.is_closing() {
            debug!(group = %self.name, "Health-checked endpoint group dropped without close");
            self.detach();
        }
    }
}
