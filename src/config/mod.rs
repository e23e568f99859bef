// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&contents).context("Failed to parse YAML config")?
        }
        _ => serde_json::from_str(&contents).context("Failed to parse JSON config")?,
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_yaml_with_defaults() {
        let file = write_temp(
            ".yaml",
            r#"
health_check:
  interval_ms: 500
  protocol: https
  retry:
    backoff_max_ms: 2000
endpoints:
  - "10.0.0.1:8080"
  - "backend.internal"
"#,
        );

        let config = load_config(file.path()).await.unwrap();
        assert_eq!(config.health_check.interval_ms, 500);
        assert_eq!(config.health_check.timeout_ms, 10_000);
        assert_eq!(config.health_check.path, "/health");
        assert_eq!(config.health_check.protocol, SessionProtocol::Https);
        assert_eq!(config.health_check.retry.backoff_base_ms, 200);
        assert_eq!(config.health_check.retry.backoff_max_ms, 2000);
        assert_eq!(config.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_load_json() {
        let file = write_temp(
            ".json",
            r#"{"health_check": {"path": "/ready", "port": 9090}, "endpoints": []}"#,
        );

        let config = load_config(file.path()).await.unwrap();
        assert_eq!(config.health_check.path, "/ready");
        assert_eq!(config.health_check.port, 9090);
    }

    #[tokio::test]
    async fn test_rejects_invalid_values() {
        let file = write_temp(".yaml", "health_check:\n  path: health\n");
        assert!(load_config(file.path()).await.is_err());

        let file = write_temp(".yaml", "endpoints:\n  - \"host:notaport\"\n");
        assert!(load_config(file.path()).await.is_err());

        let file = write_temp(
            ".yaml",
            "health_check:\n  retry:\n    backoff_base_ms: 5000\n    backoff_max_ms: 100\n",
        );
        assert!(load_config(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = load_config("/nonexistent/healthwatch.yaml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
