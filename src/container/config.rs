//! Container configuration

use crate::error::{FlotillaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Label carrying the orchestrator session a container belongs to
pub const LABEL_SESSION: &str = "io.flotilla.session";
/// Label carrying the logical node name
pub const LABEL_NODE: &str = "io.flotilla.node";
/// Label carrying the configuration fingerprint
pub const LABEL_FINGERPRINT: &str = "io.flotilla.fingerprint";

/// Tag used when an image reference has none
pub const DEFAULT_TAG: &str = "latest";

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container has exited on its own or was stopped
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Observed state of a launched container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
}

impl ContainerState {
    pub fn running() -> Self {
        Self {
            status: ContainerStatus::Running,
            exit_code: None,
        }
    }

    pub fn exited(code: Option<i32>) -> Self {
        Self {
            status: ContainerStatus::Exited,
            exit_code: code,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    pub fn has_exited(&self) -> bool {
        self.status == ContainerStatus::Exited
    }
}

/// Image reference (`repository[:tag]`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Parse an image reference, defaulting the tag to `latest`.
    ///
    /// A colon only separates the tag when it comes after the last `/`, so
    /// `registry:5000/app` keeps the registry port in the repository.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(FlotillaError::InvalidConfig(
                "Image reference is empty".to_string(),
            ));
        }

        let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match reference[name_start..].rfind(':') {
            Some(i) => {
                let split = name_start + i;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(FlotillaError::InvalidConfig(format!(
                "Invalid image reference: {}",
                reference
            )));
        }

        Ok(Self::new(repository, tag))
    }

    /// Same repository with a different tag
    pub fn with_tag(&self, tag: &str) -> Self {
        Self::new(&self.repository, tag)
    }

    /// Whether this image can stand in for `repository`
    pub fn is_compatible_with(&self, repository: &str) -> bool {
        self.repository == repository
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = FlotillaError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(image: ImageRef) -> Self {
        image.to_string()
    }
}

/// Everything a runtime needs to launch one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image to run
    pub image: ImageRef,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Container ports to publish on random host ports
    pub exposed_ports: Vec<u16>,
    /// Exposed ports pinned to a fixed host port
    #[serde(default)]
    pub host_ports: BTreeMap<u16, u16>,
    /// Runtime network to join
    pub network: Option<String>,
    /// Aliases on that network
    pub aliases: Vec<String>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Command override
    pub cmd: Vec<String>,
}

impl ContainerSpec {
    /// Create a new container spec
    pub fn new(name: &str, image: ImageRef) -> Self {
        Self {
            name: name.to_string(),
            image,
            env: BTreeMap::new(),
            exposed_ports: Vec::new(),
            host_ports: BTreeMap::new(),
            network: None,
            aliases: Vec::new(),
            labels: BTreeMap::new(),
            cmd: Vec::new(),
        }
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Publish a container port
    pub fn port(mut self, container_port: u16) -> Self {
        if !self.exposed_ports.contains(&container_port) {
            self.exposed_ports.push(container_port);
        }
        self
    }

    /// Publish a container port on a fixed host port
    pub fn publish(mut self, container_port: u16, host_port: u16) -> Self {
        self.host_ports.insert(container_port, host_port);
        self.port(container_port)
    }

    /// Join a network under an alias
    pub fn network(mut self, network: &str, alias: &str) -> Self {
        self.network = Some(network.to_string());
        if !self.aliases.iter().any(|a| a == alias) {
            self.aliases.push(alias.to_string());
        }
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Set command to run
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Logical node name, if the spec was produced for one
    pub fn node_name(&self) -> Option<&str> {
        self.labels.get(LABEL_NODE).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_reference() {
        let image = ImageRef::parse("confluentinc/cp-schema-registry:6.2.0-1-ubi8").unwrap();
        assert_eq!(image.repository, "confluentinc/cp-schema-registry");
        assert_eq!(image.tag, "6.2.0-1-ubi8");

        let image = ImageRef::parse("alpine").unwrap();
        assert_eq!(image.tag, "latest");

        let image = ImageRef::parse("localhost:5000/team/app").unwrap();
        assert_eq!(image.repository, "localhost:5000/team/app");
        assert_eq!(image.tag, "latest");

        let image = ImageRef::parse("localhost:5000/team/app:1.2").unwrap();
        assert_eq!(image.repository, "localhost:5000/team/app");
        assert_eq!(image.tag, "1.2");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("busybox:").is_err());
        assert!(ImageRef::parse(":1.0").is_err());
    }

    #[test]
    fn test_spec_builder_dedupes() {
        let spec = ContainerSpec::new("c1", ImageRef::new("alpine", "3.5"))
            .port(8081)
            .port(8081)
            .network("net", "svc")
            .network("net", "svc")
            .label(LABEL_NODE, "svc");

        assert_eq!(spec.exposed_ports, vec![8081]);
        assert_eq!(spec.aliases, vec!["svc".to_string()]);
        assert_eq!(spec.node_name(), Some("svc"));
    }
}
