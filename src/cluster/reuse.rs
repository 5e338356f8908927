//! Reuse of already running nodes
//!
//! A node that opts into reuse is looked up by the fingerprint of the
//! container it would launch. When a matching endpoint is already known the
//! node attaches to it instead of starting a new container.

use crate::container::ContainerSpec;
use crate::network::ServiceEndpoint;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::warn;

/// SHA-256 over the parts of a container spec that define its behaviour
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a spec joined to the named network
    ///
    /// Container name, labels and the runtime network id are left out so
    /// the same configuration hashes identically across sessions.
    pub fn of(spec: &ContainerSpec, network_name: &str) -> Self {
        let mut hasher = Sha256::new();

        hasher.update(b"image\0");
        hasher.update(spec.image.to_string().as_bytes());
        hasher.update(b"\0network\0");
        hasher.update(network_name.as_bytes());

        for alias in &spec.aliases {
            hasher.update(b"\0alias\0");
            hasher.update(alias.as_bytes());
        }

        for (key, value) in &spec.env {
            hasher.update(b"\0env\0");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }

        let mut ports = spec.exposed_ports.clone();
        ports.sort_unstable();
        for port in ports {
            hasher.update(b"\0port\0");
            hasher.update(port.to_be_bytes());
        }

        for arg in &spec.cmd {
            hasher.update(b"\0cmd\0");
            hasher.update(arg.as_bytes());
        }

        let digest = hasher.finalize();
        Fingerprint(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..12])
    }
}

/// Lookup of running nodes by fingerprint
pub trait ReuseLookup: Send + Sync {
    /// Endpoint of a running node with this fingerprint
    fn find_running(&self, fingerprint: &Fingerprint) -> Option<ServiceEndpoint>;

    /// Record a freshly started node
    fn remember(&self, fingerprint: Fingerprint, endpoint: ServiceEndpoint);

    /// Drop a node that is no longer running
    fn forget(&self, fingerprint: &Fingerprint);
}

/// In-memory reuse lookup, shareable between orchestrators
#[derive(Debug, Default)]
pub struct ReuseRegistry {
    entries: RwLock<HashMap<Fingerprint, ServiceEndpoint>>,
}

impl ReuseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every orchestrator in the process
    pub fn shared() -> Arc<ReuseRegistry> {
        static SHARED: OnceLock<Arc<ReuseRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(ReuseRegistry::new())).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReuseLookup for ReuseRegistry {
    fn find_running(&self, fingerprint: &Fingerprint) -> Option<ServiceEndpoint> {
        match self.entries.read() {
            Ok(entries) => entries.get(fingerprint).cloned(),
            Err(_) => {
                warn!("Reuse registry lock poisoned; starting a fresh node");
                None
            }
        }
    }

    fn remember(&self, fingerprint: Fingerprint, endpoint: ServiceEndpoint) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(fingerprint, endpoint);
        }
    }

    fn forget(&self, fingerprint: &Fingerprint) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::LABEL_SESSION;
    use crate::container::ImageRef;
    use crate::network::{ExternalAddress, InternalAddress};
    use chrono::Utc;

    fn spec() -> ContainerSpec {
        ContainerSpec::new("s1-registry", ImageRef::new("confluentinc/cp-schema-registry", "6.2.0-1-ubi8"))
            .env("SCHEMA_REGISTRY_HOST_NAME", "schema-registry")
            .port(8081)
            .network("net-id-1", "schema-registry")
    }

    #[test]
    fn test_fingerprint_ignores_session_details() {
        let a = spec().label(LABEL_SESSION, "one");
        let mut b = spec().label(LABEL_SESSION, "two");
        b.name = "s2-registry".to_string();
        b.network = Some("net-id-2".to_string());

        assert_eq!(Fingerprint::of(&a, "fabric"), Fingerprint::of(&b, "fabric"));
        assert_eq!(Fingerprint::of(&a, "fabric").as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_tracks_configuration() {
        let base = Fingerprint::of(&spec(), "fabric");

        assert_ne!(base, Fingerprint::of(&spec().env("EXTRA", "1"), "fabric"));
        assert_ne!(base, Fingerprint::of(&spec().port(9999), "fabric"));
        assert_ne!(base, Fingerprint::of(&spec(), "other-fabric"));
    }

    #[test]
    fn test_registry_round_trip() {
        let registry = ReuseRegistry::new();
        let fingerprint = Fingerprint::of(&spec(), "fabric");
        assert!(registry.find_running(&fingerprint).is_none());

        let endpoint = ServiceEndpoint {
            name: "registry".to_string(),
            internal: InternalAddress { alias: "schema-registry".to_string(), port: 8081 },
            external: ExternalAddress { host: "localhost".to_string(), port: 49170 },
            ports: Default::default(),
            ready: true,
            container_id: "abc".to_string(),
            started_at: Utc::now(),
        };

        registry.remember(fingerprint.clone(), endpoint.clone());
        assert_eq!(registry.find_running(&fingerprint), Some(endpoint));
        assert_eq!(registry.len(), 1);

        registry.forget(&fingerprint);
        assert!(registry.is_empty());
    }
}
