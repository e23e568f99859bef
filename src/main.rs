// src/main.rs
use anyhow::{Context, Result};
use healthwatch::config::{self, Config};
use healthwatch::health::HealthCheckedGroup;
use healthwatch::metrics::HealthMetricsRegistry;
use healthwatch::{DynamicEndpoints, Endpoint};
use tokio::signal;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("healthwatch=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;
    let endpoints = parse_endpoints(&config)?;

    let metrics_registry = HealthMetricsRegistry::new()?;

    let source = DynamicEndpoints::new();
    let group = HealthCheckedGroup::builder(source.clone())
        .with_name("healthwatch")
        .with_config(&config.health_check)
        .with_metrics(metrics_registry.collector())
        .build()?;

    group.add_listener(
        |endpoints: &[Endpoint]| {
            let healthy: Vec<String> = endpoints
                .iter()
                .map(|e| {
                    if e.is_degraded() {
                        format!("{} (degraded)", e)
                    } else {
                        e.to_string()
                    }
                })
                .collect();
            info!("Healthy endpoints ({}): [{}]", healthy.len(), healthy.join(", "));
        },
        true,
    );

    info!(
        "Monitoring {} endpoint(s) on {} every {:?}",
        endpoints.len(),
        config.health_check.path,
        config.health_check.interval()
    );
    source.set(endpoints);

    shutdown_signal().await;

    if let Err(e) = group.close().await {
        warn!("Health checkers did not close cleanly: {}", e);
    }

    match metrics_registry.gather() {
        Ok(text) => debug!("Final metrics:\n{}", String::from_utf8_lossy(&text)),
        Err(e) => error!("Failed to gather metrics: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}

fn parse_endpoints(config: &Config) -> Result<Vec<Endpoint>> {
    config
        .endpoints
        .iter()
        .map(|raw| {
            raw.parse::<Endpoint>()
                .with_context(|| format!("Invalid endpoint {:?}", raw))
        })
        .collect()
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
