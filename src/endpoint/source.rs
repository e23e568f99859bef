// src/endpoint/source.rs
use super::Endpoint;
use parking_lot::Mutex;
use std::sync::Arc;

/// One revision of a source's candidate list. Revisions only grow.
#[derive(Debug, Clone)]
pub struct SourceUpdate {
    pub revision: u64,
    pub endpoints: Arc<[Endpoint]>,
}

pub type SourceListener = Arc<dyn Fn(SourceUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A push-based provider of candidate endpoints.
pub trait EndpointSource: Send + Sync {
    /// Registers `listener` and returns the current list, if the source has
    /// one, atomically with the registration.
    fn subscribe(&self, listener: SourceListener) -> (SubscriptionId, Option<SourceUpdate>);

    fn unsubscribe(&self, id: SubscriptionId);

    fn current(&self) -> Option<SourceUpdate>;
}

#[derive(Default)]
struct DynamicState {
    latest: Option<SourceUpdate>,
    revision: u64,
    next_id: u64,
    listeners: Vec<(SubscriptionId, SourceListener)>,
}

/// A candidate list that is replaced wholesale by [`DynamicEndpoints::set`].
#[derive(Clone, Default)]
pub struct DynamicEndpoints {
    state: Arc<Mutex<DynamicState>>,
}

impl DynamicEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<I>(&self, endpoints: I)
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let (update, listeners) = {
            let mut state = self.state.lock();
            state.revision += 1;
            let update = SourceUpdate {
                revision: state.revision,
                endpoints: endpoints.into_iter().collect(),
            };
            state.latest = Some(update.clone());
            let listeners: Vec<_> = state.listeners.iter().map(|(_, l)| l.clone()).collect();
            (update, listeners)
        };

        tracing::debug!(
            revision = update.revision,
            "Candidate list updated: {} endpoint(s)",
            update.endpoints.len()
        );

        // Listeners run outside the lock; out-of-order delivery is resolved
        // by the revision number.
        for listener in listeners {
            listener(update.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

impl EndpointSource for DynamicEndpoints {
    fn subscribe(&self, listener: SourceListener) -> (SubscriptionId, Option<SourceUpdate>) {
        let mut state = self.state.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.listeners.push((id, listener));
        (id, state.latest.clone())
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().listeners.retain(|(sid, _)| *sid != id);
    }

    fn current(&self) -> Option<SourceUpdate> {
        self.state.lock().latest.clone()
    }
}

/// A fixed candidate list.
#[derive(Debug, Clone)]
pub struct StaticEndpoints {
    update: SourceUpdate,
}

impl StaticEndpoints {
    pub fn new<I>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = Endpoint>,
    {
        Self {
            update: SourceUpdate {
                revision: 1,
                endpoints: endpoints.into_iter().collect(),
            },
        }
    }
}

impl From<Endpoint> for StaticEndpoints {
    fn from(endpoint: Endpoint) -> Self {
        Self::new([endpoint])
    }
}

impl EndpointSource for StaticEndpoints {
    fn subscribe(&self, _listener: SourceListener) -> (SubscriptionId, Option<SourceUpdate>) {
        (SubscriptionId(0), Some(self.update.clone()))
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}

    fn current(&self) -> Option<SourceUpdate> {
        Some(self.update.clone())
    }
}
