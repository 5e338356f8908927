//! Endpoint addressing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Address of a node as seen from inside the fabric (`alias:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalAddress {
    pub alias: String,
    pub port: u16,
}

impl std::fmt::Display for InternalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.alias, self.port)
    }
}

/// Address of a node as seen from the host (`host:mapped-port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ExternalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where an address is going to be used from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vantage {
    /// Another container on the same fabric
    Fabric,
    /// The host running the tests
    Host,
}

/// Reachability of one running node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Logical node name
    pub name: String,
    /// Address on the fabric
    pub internal: InternalAddress,
    /// Address from the host
    pub external: ExternalAddress,
    /// Every published container port and its host port
    pub ports: BTreeMap<u16, u16>,
    /// Whether the readiness probe passed
    pub ready: bool,
    /// Runtime container identifier
    pub container_id: String,
    /// When the node became ready
    pub started_at: DateTime<Utc>,
}

impl ServiceEndpoint {
    /// Host port for a published container port
    pub fn mapped_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }

    /// Address for the given vantage point
    pub fn address(&self, vantage: Vantage) -> String {
        match vantage {
            Vantage::Fabric => self.internal.to_string(),
            Vantage::Host => self.external.to_string(),
        }
    }

    /// `http://host:mapped-port`
    pub fn http_url(&self) -> String {
        format!("http://{}", self.external)
    }

    /// `http://alias:port`, for configuration consumed by other containers
    pub fn internal_http_url(&self) -> String {
        format!("http://{}", self.internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint {
            name: "registry".to_string(),
            internal: InternalAddress {
                alias: "schema-registry".to_string(),
                port: 8081,
            },
            external: ExternalAddress {
                host: "localhost".to_string(),
                port: 49160,
            },
            ports: BTreeMap::from([(8081, 49160)]),
            ready: true,
            container_id: "abc".to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_addresses_by_vantage() {
        let ep = endpoint();
        assert_eq!(ep.address(Vantage::Fabric), "schema-registry:8081");
        assert_eq!(ep.address(Vantage::Host), "localhost:49160");
        assert_eq!(ep.http_url(), "http://localhost:49160");
        assert_eq!(ep.internal_http_url(), "http://schema-registry:8081");
        assert_eq!(ep.mapped_port(8081), Some(49160));
        assert_eq!(ep.mapped_port(9092), None);
    }
}
