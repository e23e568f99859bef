// src/health/strategy.rs
use crate::endpoint::{Endpoint, EndpointKey};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Chooses which candidates get a health checker.
pub trait HealthCheckStrategy: Send + Sync {
    fn select(&self, candidates: &[Endpoint]) -> Vec<Endpoint>;

    fn name(&self) -> &'static str;
}

/// Checks every candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllStrategy;

impl HealthCheckStrategy for AllStrategy {
    fn select(&self, candidates: &[Endpoint]) -> Vec<Endpoint> {
        candidates.to_vec()
    }

    fn name(&self) -> &'static str {
        "all"
    }
}

pub fn all() -> Arc<dyn HealthCheckStrategy> {
    Arc::new(AllStrategy)
}

#[derive(Debug, Clone, Copy)]
enum Limit {
    Count(usize),
    Percentage(f64),
}

/// Checks a bounded subset of candidates. Candidates selected in an earlier
/// round stay selected while they remain candidates; free slots are filled
/// in candidate order.
#[derive(Debug)]
pub struct PartialStrategy {
    limit: Limit,
    selected: Mutex<Vec<EndpointKey>>,
}

impl PartialStrategy {
    pub fn of_count(max: usize) -> Self {
        Self {
            limit: Limit::Count(max),
            selected: Mutex::new(Vec::new()),
        }
    }

    /// `percentage` is clamped to [0, 100]. At least one candidate is
    /// selected whenever there are any.
    pub fn of_percentage(percentage: f64) -> Self {
        Self {
            limit: Limit::Percentage(percentage.clamp(0.0, 100.0)),
            selected: Mutex::new(Vec::new()),
        }
    }

    fn capacity(&self, candidates: usize) -> usize {
        match self.limit {
            Limit::Count(max) => max.min(candidates),
            Limit::Percentage(p) => {
                let n = (candidates as f64 * p / 100.0).ceil() as usize;
                n.clamp(candidates.min(1), candidates)
            }
        }
    }
}

impl HealthCheckStrategy for PartialStrategy {
    fn select(&self, candidates: &[Endpoint]) -> Vec<Endpoint> {
        let capacity = self.capacity(candidates.len());
        let mut selected = self.selected.lock();

        let present: HashSet<&EndpointKey> = candidates.iter().map(Endpoint::key).collect();
        selected.retain(|key| present.contains(key));
        selected.truncate(capacity);

        let mut chosen: HashSet<EndpointKey> = selected.iter().cloned().collect();
        for candidate in candidates {
            if selected.len() >= capacity {
                break;
            }
            if chosen.insert(candidate.key().clone()) {
                selected.push(candidate.key().clone());
            }
        }

        candidates
            .iter()
            .filter(|c| chosen.contains(c.key()))
            .cloned()
            .collect()
    }

    fn name(&self) -> &'static str {
        "partial"
    }
}
