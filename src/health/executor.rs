// src/health/executor.rs
use crate::endpoint::EndpointKey;
use crate::error::{HealthError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error};

type Job = BoxFuture<'static, ()>;

struct Shared {
    endpoint: EndpointKey,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    runtime: Handle,
}

/// A serial task queue scoped to one monitor context.
///
/// Jobs run one after another on a dedicated task. Once the queue is shut
/// down every submission fails with [`HealthError::ContextDestroyed`], while
/// jobs already queued or running are left to finish.
#[derive(Clone)]
pub struct ContextExecutor {
    shared: Arc<Shared>,
}

impl ContextExecutor {
    pub(crate) fn new(endpoint: EndpointKey, runtime: Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let worker_endpoint = endpoint.clone();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!(endpoint = %worker_endpoint, "Health check task panicked");
                }
            }
            debug!(endpoint = %worker_endpoint, "Context task queue drained");
        });

        Self {
            shared: Arc::new(Shared {
                endpoint,
                tx: Mutex::new(Some(tx)),
                runtime,
            }),
        }
    }

    /// Queues an async job.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(job.boxed())
    }

    /// Queues a blocking-free closure.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(async move { job() }.boxed())
    }

    /// Queues `job` after `delay`. Fails immediately if the context is
    /// already destroyed; if it is destroyed while waiting, the job is
    /// dropped without running.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(self.destroyed());
        }

        let executor = self.clone();
        self.shared.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if executor.spawn(job).is_err() {
                debug!(
                    endpoint = %executor.shared.endpoint,
                    "Dropped scheduled health check for destroyed context"
                );
            }
        });
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.tx.lock().is_none()
    }

    pub(crate) fn shutdown(&self) {
        self.shared.tx.lock().take();
    }

    fn submit(&self, job: Job) -> Result<()> {
        let tx = self.shared.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| self.destroyed()),
            None => Err(self.destroyed()),
        }
    }

    fn destroyed(&self) -> HealthError {
        HealthError::ContextDestroyed {
            endpoint: self.shared.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor() -> ContextExecutor {
        ContextExecutor::new(EndpointKey::new("foo", Some(80)), Handle::current())
    }

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let executor = executor();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            let tx = tx.clone();
            executor
                .spawn(async move {
                    tokio::task::yield_now().await;
                    let _ = tx.send(i);
                })
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown_but_finishes_queued_work() {
        let executor = executor();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        executor
            .execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        executor.shutdown();

        let err = executor.execute(|| {}).unwrap_err();
        assert!(err.is_destroyed());
        assert!(err.to_string().contains("destroyed"));
        assert!(executor.schedule(Duration::from_millis(1), async {}).is_err());

        for _ in 0..100 {
            if ran.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_job_dropped_when_destroyed_while_waiting() {
        let executor = executor();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        executor
            .schedule(Duration::from_secs(5), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        executor.shutdown();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_queue() {
        let executor = executor();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(|| panic!("probe exploded")).unwrap();
        executor
            .execute(move || {
                let _ = tx.send(());
            })
            .unwrap();
        assert!(rx.await.is_ok());
    }
}
