// src/client/factory.rs
use crate::config::ClientConfig;
use crate::error::{HealthError, Result};
use crate::health::{AsyncCloseable, CloseHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Settings for the HTTP client used by probes.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub user_agent: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub headers: BTreeMap<String, String>,
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout_ms.map(Duration::from_millis),
            headers: config.headers.clone(),
        }
    }
}

impl ClientOptions {
    fn build_client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HealthError::Client(format!("header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HealthError::Client(format!("header value {:?}: {}", value, e)))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        builder
            .build()
            .map_err(|e| HealthError::Client(e.to_string()))
    }
}

struct FactoryInner {
    options: ClientOptions,
    client: OnceCell<reqwest::Client>,
    clients_built: AtomicUsize,
    owned: DashMap<u64, Weak<dyn AsyncCloseable>>,
    next_id: AtomicU64,
    lifecycle: CloseHandle,
}

/// Owns the probe HTTP client and the groups built on top of it. Closing the
/// factory closes every group it owns.
#[derive(Clone)]
pub struct ClientFactory {
    inner: Arc<FactoryInner>,
}

impl ClientFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                options,
                client: OnceCell::new(),
                clients_built: AtomicUsize::new(0),
                owned: DashMap::new(),
                next_id: AtomicU64::new(0),
                lifecycle: CloseHandle::new(),
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The shared client, built on first use. Concurrent first callers all
    /// receive the same instance.
    pub async fn http_client(&self) -> Result<reqwest::Client> {
        if self.is_closing() {
            return Err(HealthError::FactoryClosed);
        }

        let inner = &self.inner;
        let client = inner
            .client
            .get_or_try_init(|| async {
                let client = inner.options.build_client()?;
                inner.clients_built.fetch_add(1, Ordering::SeqCst);
                debug!("Built probe HTTP client");
                Ok::<_, HealthError>(client)
            })
            .await?;
        Ok(client.clone())
    }

    pub fn clients_built(&self) -> usize {
        self.inner.clients_built.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lifecycle.is_closing()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    pub fn owned_count(&self) -> usize {
        self.inner.owned.len()
    }

    pub(crate) fn register(&self, resource: Weak<dyn AsyncCloseable>) -> Result<u64> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.owned.insert(id, resource);

        // A close that started before the insert may have missed it.
        if self.is_closing() {
            self.inner.owned.remove(&id);
            return Err(HealthError::FactoryClosed);
        }
        Ok(id)
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.inner.owned.remove(&id);
    }
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

#[async_trait]
impl AsyncCloseable for ClientFactory {
    async fn close(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_close() {
            return inner.lifecycle.wait_outcome().await;
        }

        let owned: Vec<Arc<dyn AsyncCloseable>> = inner
            .owned
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        inner.owned.clear();

        info!("Closing client factory with {} owned group(s)", owned.len());

        let results = futures::future::join_all(owned.iter().map(|r| r.close())).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| format!("{:#}", e))
            .collect();

        let outcome = if failures.is_empty() {
            Ok(())
        } else {
            warn!("{} owned group(s) failed to close", failures.len());
            Err(failures.join("; "))
        };
        inner.lifecycle.finish_close(outcome.clone());
        outcome.map_err(|reason| anyhow::anyhow!("{}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_client_built_once_under_concurrent_first_use() {
        let factory = ClientFactory::default();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let factory = factory.clone();
                tokio::spawn(async move { factory.http_client().await.map(|_| ()) })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert!(task.unwrap().is_ok());
        }
        assert_eq!(factory.clients_built(), 1);
    }

    #[tokio::test]
    async fn test_invalid_header_is_reported() {
        let mut options = ClientOptions::default();
        options.headers.insert("bad header".into(), "x".into());
        let factory = ClientFactory::new(options);

        let err = factory.http_client().await.unwrap_err();
        assert!(matches!(err, HealthError::Client(_)));
        assert_eq!(factory.clients_built(), 0);
    }

    #[tokio::test]
    async fn test_close_closes_owned_resources_once() {
        let factory = ClientFactory::default();
        let resource: Arc<CloseHandle> = Arc::new(CloseHandle::new());
        let weak: Weak<dyn AsyncCloseable> = Arc::downgrade(&resource) as Weak<dyn AsyncCloseable>;
        factory.register(weak).unwrap();
        assert_eq!(factory.owned_count(), 1);

        factory.close().await.unwrap();
        factory.close().await.unwrap();

        assert!(resource.is_closed());
        assert!(factory.is_closed());
        assert_eq!(factory.owned_count(), 0);
        assert!(matches!(
            factory.http_client().await,
            Err(HealthError::FactoryClosed)
        ));

        let late: Arc<CloseHandle> = Arc::new(CloseHandle::new());
        let weak: Weak<dyn AsyncCloseable> = Arc::downgrade(&late) as Weak<dyn AsyncCloseable>;
        assert!(factory.register(weak).is_err());
    }
}
