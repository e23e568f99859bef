// src/health/snapshot.rs
use super::context::MonitorContext;
use crate::endpoint::{Endpoint, EndpointKey};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

/// The contexts alive for one candidate-list revision.
///
/// A group is initialized once every member context has received its first
/// health update or has been destroyed, or once the group is superseded.
/// Initialization never reverts.
pub struct SnapshotGroup {
    revision: u64,
    candidates: Vec<Endpoint>,
    contexts: HashMap<EndpointKey, Arc<MonitorContext>>,
    initialized: watch::Sender<bool>,
}

impl SnapshotGroup {
    pub(crate) fn new(
        revision: u64,
        candidates: Vec<Endpoint>,
        contexts: HashMap<EndpointKey, Arc<MonitorContext>>,
    ) -> Self {
        Self {
            revision,
            candidates,
            contexts,
            initialized: watch::channel(false).0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Deduplicated candidates in source order, including unselected ones.
    pub fn candidates(&self) -> &[Endpoint] {
        &self.candidates
    }

    pub fn context(&self, key: &EndpointKey) -> Option<&Arc<MonitorContext>> {
        self.contexts.get(key)
    }

    pub fn contexts(&self) -> impl Iterator<Item = &Arc<MonitorContext>> {
        self.contexts.values()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        if *self.initialized.borrow() {
            return true;
        }
        let settled = self.contexts.values().all(|ctx| ctx.is_settled());
        if settled {
            self.supersede();
        }
        settled
    }

    /// Resolves once the group is initialized.
    pub async fn when_initialized(&self) {
        let mut rx = self.initialized.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn supersede(&self) {
        self.initialized.send_if_modified(|done| !std::mem::replace(done, true));
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &EndpointKey> {
        self.contexts.keys()
    }
}

impl std::fmt::Debug for SnapshotGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotGroup")
            .field("revision", &self.revision)
            .field("candidates", &self.candidates.len())
            .field("contexts", &self.contexts.len())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Groups in commit order, oldest first.
#[derive(Default)]
pub(crate) struct SnapshotChain {
    groups: VecDeque<Arc<SnapshotGroup>>,
}

impl SnapshotChain {
    pub(crate) fn push(&mut self, group: SnapshotGroup) {
        self.groups.push_back(Arc::new(group));
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }

    pub(crate) fn peek(&self) -> Vec<Arc<SnapshotGroup>> {
        self.groups.iter().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<SnapshotGroup>> {
        let drained: Vec<_> = self.groups.drain(..).collect();
        drained.iter().for_each(|group| group.supersede());
        drained
    }

    /// Evaluates every group, so older groups signal as they settle too.
    pub(crate) fn latest_initialized_index(&self) -> Option<usize> {
        let mut latest = None;
        for (index, group) in self.groups.iter().enumerate() {
            if group.is_initialized() {
                latest = Some(index);
            }
        }
        latest
    }

    /// Removes and returns every group older than `index`.
    pub(crate) fn retire_before(&mut self, index: usize) -> Vec<Arc<SnapshotGroup>> {
        let index = index.min(self.groups.len());
        let retired: Vec<_> = self.groups.drain(..index).collect();
        retired.iter().for_each(|group| group.supersede());
        retired
    }

    /// The healthy endpoints across the chain: oldest group first, each in
    /// candidate order, first occurrence of a key wins.
    pub(crate) fn healthy_endpoints(&self) -> Vec<Endpoint> {
        let mut seen = HashSet::new();
        let mut healthy = Vec::new();
        for group in &self.groups {
            for candidate in &group.candidates {
                let Some(ctx) = group.contexts.get(candidate.key()) else {
                    continue;
                };
                if ctx.counts_as_healthy() && seen.insert(candidate.key().clone()) {
                    healthy.push(candidate.with_health(true, ctx.is_degraded()));
                }
            }
        }
        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientFactory;
    use crate::config::SessionProtocol;
    use crate::health::close::CloseTracker;
    use crate::health::context::{CheckSettings, HealthSink, HealthUpdate};
    use crate::retry::FixedBackoff;
    use std::sync::Weak;
    use std::time::Duration;
    use tokio::runtime::Handle;

    struct NullSink;

    impl HealthSink for NullSink {
        fn post_health(&self, _update: HealthUpdate) {}
    }

    struct Fixture {
        closes: Arc<CloseTracker>,
        settings: Arc<CheckSettings>,
        sink: Arc<NullSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                closes: CloseTracker::new(Handle::current()),
                settings: Arc::new(CheckSettings {
                    interval: Duration::from_secs(1),
                    timeout: Duration::from_secs(1),
                    protocol: SessionProtocol::Http,
                    port: 0,
                    backoff: Arc::new(FixedBackoff::new(Duration::from_millis(10))),
                    client_factory: ClientFactory::default(),
                }),
                sink: Arc::new(NullSink),
            }
        }

        fn context(&self, endpoint: &Endpoint) -> Arc<MonitorContext> {
            let sink: Weak<dyn HealthSink> = Arc::downgrade(&self.sink) as Weak<dyn HealthSink>;
            MonitorContext::new(0, 1, endpoint.clone(), self.settings.clone(), &self.closes, sink)
        }

        fn group(&self, revision: u64, candidates: &[Endpoint]) -> (SnapshotGroup, Vec<Arc<MonitorContext>>) {
            let contexts: Vec<_> = candidates.iter().map(|e| self.context(e)).collect();
            let map = candidates
                .iter()
                .zip(&contexts)
                .map(|(e, ctx)| (e.key().clone(), ctx.clone()))
                .collect();
            (SnapshotGroup::new(revision, candidates.to_vec(), map), contexts)
        }
    }

    #[tokio::test]
    async fn test_group_initializes_once_all_contexts_settle() {
        let fixture = Fixture::new();
        let (group, contexts) = fixture.group(1, &[Endpoint::of("a"), Endpoint::of("b")]);
        assert!(!group.is_initialized());

        contexts[0].apply(1.0, false, None);
        assert!(!group.is_initialized());

        contexts[1].destroy(&fixture.closes);
        assert!(group.is_initialized());

        let empty = SnapshotGroup::new(2, Vec::new(), HashMap::new());
        assert!(empty.is_initialized());
    }

    #[tokio::test]
    async fn test_when_initialized_resolves_on_settle_or_retirement() {
        let fixture = Fixture::new();
        let mut chain = SnapshotChain::default();
        let (first, _) = fixture.group(1, &[Endpoint::of("a")]);
        let (second, contexts) = fixture.group(2, &[Endpoint::of("b")]);
        chain.push(first);
        chain.push(second);
        let groups = chain.peek();

        let pending = tokio::time::timeout(Duration::from_millis(20), groups[1].when_initialized()).await;
        assert!(pending.is_err());

        contexts[0].apply(0.0, false, Some("refused".into()));
        assert_eq!(chain.latest_initialized_index(), Some(1));
        groups[1].when_initialized().await;

        assert!(!groups[0].is_initialized());
        chain.retire_before(1);
        groups[0].when_initialized().await;
        assert!(groups[0].is_initialized());
    }

    #[tokio::test]
    async fn test_chain_dedups_across_groups_oldest_first() {
        let fixture = Fixture::new();
        let a = Endpoint::of("a");
        let b = Endpoint::of("b");
        let mut chain = SnapshotChain::default();

        let (first, old) = fixture.group(1, &[a.clone(), b.clone()]);
        let (second, new) = fixture.group(2, &[b.with_weight(150), a.clone()]);
        chain.push(first);
        chain.push(second);
        for ctx in old.iter().chain(&new) {
            ctx.apply(1.0, false, None);
        }

        let healthy = chain.healthy_endpoints();
        assert_eq!(healthy.iter().map(Endpoint::host).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(healthy[1].weight(), 1000);
        assert!(healthy.iter().all(Endpoint::is_healthy));

        assert_eq!(chain.latest_initialized_index(), Some(1));
        let retired = chain.retire_before(1);
        assert_eq!(retired.len(), 1);
        assert_eq!(chain.len(), 1);

        let healthy = chain.healthy_endpoints();
        assert_eq!(healthy.iter().map(Endpoint::host).collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(healthy[0].weight(), 150);
    }

    #[tokio::test]
    async fn test_unhealthy_and_destroyed_contexts_are_excluded() {
        let fixture = Fixture::new();
        let mut chain = SnapshotChain::default();
        let (group, contexts) = fixture.group(1, &[Endpoint::of("a"), Endpoint::of("b"), Endpoint::of("c")]);
        chain.push(group);

        contexts[0].apply(0.0, false, None);
        contexts[1].apply(1.0, true, None);
        contexts[2].apply(1.0, false, None);
        contexts[2].destroy(&fixture.closes);

        let healthy = chain.healthy_endpoints();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].host(), "b");
        assert!(healthy[0].is_degraded());

        assert_eq!(chain.drain().len(), 1);
        assert!(chain.healthy_endpoints().is_empty());
    }
}
