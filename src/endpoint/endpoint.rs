// src/endpoint/endpoint.rs
use crate::error::HealthError;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_WEIGHT: u32 = 1000;

/// Identity of an endpoint. Two endpoints with the same key are the same
/// endpoint regardless of weight or attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    host: Arc<str>,
    port: Option<u16>,
}

impl EndpointKey {
    pub fn new(host: impl AsRef<str>, port: Option<u16>) -> Self {
        Self {
            host: Arc::from(host.as_ref()),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bracket = self.host.contains(':');
        match (bracket, self.port) {
            (true, Some(port)) => write!(f, "[{}]:{}", self.host, port),
            (true, None) => write!(f, "[{}]", self.host),
            (false, Some(port)) => write!(f, "{}:{}", self.host, port),
            (false, None) => f.write_str(&self.host),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    healthy: Option<bool>,
    degraded: Option<bool>,
    labels: BTreeMap<String, String>,
}

impl Attributes {
    pub fn healthy(&self) -> Option<bool> {
        self.healthy
    }

    pub fn degraded(&self) -> Option<bool> {
        self.degraded
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

/// An immutable network endpoint.
///
/// Equality and hashing only look at host and port. Use
/// [`Endpoint::is_identical`] to also compare weight and attributes.
#[derive(Debug, Clone)]
pub struct Endpoint {
    key: EndpointKey,
    weight: u32,
    attrs: Attributes,
}

impl Endpoint {
    /// An endpoint without a port, probed on the group's configured port.
    pub fn of(host: impl AsRef<str>) -> Self {
        Self::from_key(EndpointKey::new(host, None))
    }

    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self::from_key(EndpointKey::new(host, Some(port)))
    }

    pub fn from_key(key: EndpointKey) -> Self {
        Self {
            key,
            weight: DEFAULT_WEIGHT,
            attrs: Attributes::default(),
        }
    }

    pub fn with_weight(&self, weight: u32) -> Self {
        Self {
            weight,
            ..self.clone()
        }
    }

    pub fn with_label(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut endpoint = self.clone();
        endpoint.attrs.labels.insert(key.into(), value.into());
        endpoint
    }

    // healthy/degraded are computed by the group, never by callers.
    pub(crate) fn with_health(&self, healthy: bool, degraded: bool) -> Self {
        let mut endpoint = self.clone();
        endpoint.attrs.healthy = Some(healthy);
        endpoint.attrs.degraded = Some(degraded);
        endpoint
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        self.key.host()
    }

    pub fn port(&self) -> Option<u16> {
        self.key.port()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn is_healthy(&self) -> bool {
        self.attrs.healthy.unwrap_or(false)
    }

    pub fn is_degraded(&self) -> bool {
        self.attrs.degraded.unwrap_or(false)
    }

    pub fn is_identical(&self, other: &Endpoint) -> bool {
        self.key == other.key && self.weight == other.weight && self.attrs == other.attrs
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}

impl FromStr for Endpoint {
    type Err = HealthError;

    /// Accepts `host`, `host:port`, `[v6]` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || HealthError::InvalidEndpoint(s.to_string());

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) if !port.contains(':') => (host, Some(port)),
                Some(_) => return Err(invalid()),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Endpoint::from_key(EndpointKey::new(host, port)))
    }
}

/// Deep comparison of two snapshots, including weights and attributes.
pub(crate) fn snapshots_identical(a: &[Endpoint], b: &[Endpoint]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_identical(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_weight_and_attributes() {
        let a = Endpoint::new("10.0.0.1", 8080);
        let b = a.with_weight(150).with_label("zone", "a");

        assert_eq!(a, b);
        assert!(!a.is_identical(&b));

        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a, Endpoint::new("10.0.0.1", 8081));
        assert_ne!(Endpoint::of("foo"), Endpoint::new("foo", 80));
    }

    #[test]
    fn test_health_attributes_are_unset_until_computed() {
        let endpoint = Endpoint::of("foo");
        assert_eq!(endpoint.attrs().healthy(), None);
        assert!(!endpoint.is_healthy());

        let computed = endpoint.with_health(true, true);
        assert!(computed.is_healthy());
        assert!(computed.is_degraded());
        assert_eq!(computed.weight(), DEFAULT_WEIGHT);
    }

    #[test]
    fn test_parses_host_port_forms() {
        let e: Endpoint = "example.com:443".parse().unwrap();
        assert_eq!(e.host(), "example.com");
        assert_eq!(e.port(), Some(443));

        let e: Endpoint = "example.com".parse().unwrap();
        assert_eq!(e.port(), None);

        let e: Endpoint = "[::1]:9000".parse().unwrap();
        assert_eq!(e.host(), "::1");
        assert_eq!(e.port(), Some(9000));
        assert_eq!(e.to_string(), "[::1]:9000");

        assert!("".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!("a:b:c".parse::<Endpoint>().is_err());
        assert!("[::1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_snapshot_comparison_sees_weight_changes() {
        let before = vec![Endpoint::of("a"), Endpoint::of("b")];
        let after = vec![Endpoint::of("a"), Endpoint::of("b").with_weight(150)];
        assert!(snapshots_identical(&before, &before.clone()));
        assert!(!snapshots_identical(&before, &after));
        assert!(!snapshots_identical(&before, &before[..1]));
    }
}
