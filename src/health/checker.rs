// src/health/checker.rs
use super::close::{AsyncCloseable, CloseHandle};
use super::context::{MonitorContext, ProbeRequest};
use super::group::CheckerFactory;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// Probes `GET {scheme}://{host}:{port}{path}` on the context's task queue.
///
/// A 2xx response scores 1, anything else 0. The next probe is scheduled
/// with [`MonitorContext::next_delay`] until the checker is closed or the
/// context is destroyed.
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    path: Arc<str>,
}

struct Probe {
    path: Arc<str>,
    stopped: AtomicBool,
}

impl HttpHealthChecker {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: Arc::from(path.as_ref()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn into_factory(self) -> CheckerFactory {
        Arc::new(move |ctx: Arc<MonitorContext>| self.start(ctx))
    }

    /// Queues the first probe and returns the handle that stops the loop.
    pub fn start(&self, ctx: Arc<MonitorContext>) -> Result<Arc<dyn AsyncCloseable>> {
        let probe = Arc::new(Probe {
            path: self.path.clone(),
            stopped: AtomicBool::new(false),
        });
        probe.url(&ctx)?;

        ctx.executor().spawn(probe_round(ctx.clone(), probe.clone()))?;
        debug!(endpoint = %ctx.endpoint(), path = %self.path, "Started HTTP health checker");

        let handle = CloseHandle::on_close(move || async move {
            probe.stopped.store(true, Ordering::SeqCst);
            Ok(())
        });
        Ok(Arc::new(handle))
    }
}

fn probe_round(ctx: Arc<MonitorContext>, probe: Arc<Probe>) -> BoxFuture<'static, ()> {
    async move {
        if probe.is_stopped() {
            return;
        }
        probe.check(&ctx).await;
        if probe.is_stopped() {
            return;
        }

        let delay = ctx.next_delay();
        let next = probe_round(ctx.clone(), probe.clone());
        if let Err(e) = ctx.executor().schedule(delay, next) {
            debug!(endpoint = %ctx.endpoint(), "Stopping HTTP health checker: {}", e);
        }
    }
    .boxed()
}

impl Probe {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn url(&self, ctx: &MonitorContext) -> Result<Url> {
        let host = ctx.endpoint().host();
        let authority = if host.contains(':') {
            format!("[{}]:{}", host, ctx.probe_port())
        } else {
            format!("{}:{}", host, ctx.probe_port())
        };
        let base = Url::parse(&format!("{}://{}", ctx.protocol().scheme(), authority))?;
        Ok(base.join(&self.path)?)
    }

    async fn check(&self, ctx: &MonitorContext) {
        let url = match self.url(ctx) {
            Ok(url) => url,
            Err(e) => {
                ctx.update_health(0.0, None, None, Some(&e));
                return;
            }
        };
        let request = ProbeRequest::new(Method::GET, url.as_str());
        let was_healthy = ctx.health_score() > 0.0;

        let client = match ctx.client_factory().http_client().await {
            Ok(client) => client,
            Err(e) => {
                ctx.update_health(0.0, Some(&request), None, Some(&anyhow!(e)));
                return;
            }
        };

        let result = timeout(ctx.timeout(), client.get(url).send()).await;
        let elapsed = request.started_at.elapsed();

        match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    ctx.update_health(1.0, Some(&request), Some(response.headers()), None);
                    if !was_healthy {
                        info!(endpoint = %ctx.endpoint(), ?elapsed, "Endpoint is now healthy");
                    } else {
                        debug!(endpoint = %ctx.endpoint(), ?elapsed, "Endpoint is healthy");
                    }
                } else {
                    let cause = anyhow!("HTTP {}", status);
                    ctx.update_health(0.0, Some(&request), Some(response.headers()), Some(&cause));
                    self.log_failure(ctx, was_healthy, &cause);
                }
            }
            Ok(Err(e)) => {
                let cause = anyhow!(e);
                ctx.update_health(0.0, Some(&request), None, Some(&cause));
                self.log_failure(ctx, was_healthy, &cause);
            }
            Err(_) => {
                let cause = anyhow!("Request timeout after {:?}", ctx.timeout());
                ctx.update_health(0.0, Some(&request), None, Some(&cause));
                self.log_failure(ctx, was_healthy, &cause);
            }
        }
    }

    fn log_failure(&self, ctx: &MonitorContext, was_healthy: bool, cause: &anyhow::Error) {
        if was_healthy {
            warn!(endpoint = %ctx.endpoint(), "Endpoint is now unhealthy: {}", cause);
        } else {
            debug!(endpoint = %ctx.endpoint(), "Endpoint is still unhealthy: {}", cause);
        }
    }
}
