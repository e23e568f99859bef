// src/health/close.rs
use crate::endpoint::EndpointKey;
use crate::error::CheckerCloseFailure;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A resource that is released asynchronously, such as a running checker.
#[async_trait]
pub trait AsyncCloseable: Send + Sync {
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    Closing,
    Closed,
}

type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A closeable whose hook runs exactly once. Every `close()` caller waits
/// for the hook and observes the same outcome.
pub struct CloseHandle {
    state: watch::Sender<CloseState>,
    hook: Mutex<Option<CloseHook>>,
    outcome: OnceLock<Result<(), String>>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self {
            state: watch::channel(CloseState::Open).0,
            hook: Mutex::new(None),
            outcome: OnceLock::new(),
        }
    }

    pub fn on_close<F, Fut>(hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = Self::new();
        *handle.hook.lock() = Some(Box::new(move || hook().boxed()));
        handle
    }

    pub fn state(&self) -> CloseState {
        *self.state.borrow()
    }

    pub fn is_closing(&self) -> bool {
        self.state() != CloseState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CloseState::Closed
    }

    pub async fn when_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == CloseState::Closed).await;
    }

    /// Moves Open to Closing. Only the caller that gets `true` finishes the close.
    pub(crate) fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == CloseState::Open {
                *state = CloseState::Closing;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn finish_close(&self, outcome: Result<(), String>) {
        let _ = self.outcome.set(outcome);
        self.state.send_replace(CloseState::Closed);
    }

    /// Waits for the close started by another caller and returns its outcome.
    pub(crate) async fn wait_outcome(&self) -> Result<()> {
        self.when_closed().await;
        match self.outcome.get() {
            Some(Err(reason)) => Err(anyhow!("{}", reason)),
            _ => Ok(()),
        }
    }

    async fn close_once(&self) -> Result<()> {
        if !self.begin_close() {
            return self.wait_outcome().await;
        }

        let hook = self.hook.lock().take();
        let result = match hook {
            Some(hook) => hook().await,
            None => Ok(()),
        };
        self.finish_close(result.as_ref().map(|_| ()).map_err(|e| format!("{:#}", e)));
        result
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncCloseable for CloseHandle {
    async fn close(&self) -> Result<()> {
        self.close_once().await
    }
}

/// Counts checker closes in flight so that a group close can wait for all
/// of them. Failures are recorded once the group starts closing.
pub(crate) struct CloseTracker {
    runtime: Handle,
    pending: watch::Sender<usize>,
    collecting: AtomicBool,
    failures: Mutex<Vec<CheckerCloseFailure>>,
}

/// Keeps [`CloseTracker::wait_idle`] waiting until dropped.
pub(crate) struct PendingGuard {
    tracker: Arc<CloseTracker>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.tracker.pending.send_modify(|n| *n -= 1);
    }
}

impl CloseTracker {
    pub(crate) fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            pending: watch::channel(0).0,
            collecting: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn enter(self: &Arc<Self>) -> PendingGuard {
        self.pending.send_modify(|n| *n += 1);
        PendingGuard {
            tracker: self.clone(),
        }
    }

    pub(crate) fn spawn_close(
        self: &Arc<Self>,
        endpoint: EndpointKey,
        checker: Arc<dyn AsyncCloseable>,
    ) {
        let guard = self.enter();

        self.runtime.spawn(async move {
            let tracker = &guard.tracker;
            match checker.close().await {
                Ok(()) => debug!(endpoint = %endpoint, "Health checker closed"),
                Err(e) => {
                    warn!(endpoint = %endpoint, "Failed to close health checker: {:#}", e);
                    if tracker.collecting.load(Ordering::SeqCst) {
                        tracker.failures.lock().push(CheckerCloseFailure {
                            endpoint,
                            reason: format!("{:#}", e),
                        });
                    }
                }
            }
        });
    }

    pub(crate) fn start_collecting(&self) {
        self.collecting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub(crate) fn take_failures(&self) -> Vec<CheckerCloseFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}
