//! Cluster manifest files
//!
//! A manifest describes a cluster in YAML:
//!
//! ```yaml
//! name: confluent
//! services:
//!   broker:
//!     profile: broker
//!   registry:
//!     profile: schema-registry
//!     depends_on: [broker]
//!   sqlserver:
//!     profile: sql-server
//!     image: confluentinc/ksqldb-server:${KSQL_VERSION:-0.17.0}
//!     depends_on: [broker, registry]
//! ```
//!
//! Services are registered in file order, which is also the tie-break order
//! for starting independent services.

use super::graph::ClusterGraph;
use super::orchestrator::{ClusterOrchestrator, StartMode};
use crate::container::ContainerRuntime;
use crate::error::{FlotillaError, Result};
use crate::network::NetworkFabric;
use crate::node::{ConfigValue, ProfileKind, ReadinessPolicy, ServiceNode};
use crate::settings::Settings;
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Manifest file names looked up in a directory
pub const DEFAULT_MANIFEST_FILES: &[&str] = &["flotilla.yaml", "flotilla.yml", "cluster.yaml"];

/// Cluster manifest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterManifest {
    /// Cluster name
    #[serde(default)]
    pub name: Option<String>,
    /// Fixed network name, generated when unset
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub start_mode: Option<StartMode>,
    /// Services in file order
    #[serde(default, deserialize_with = "ordered_services")]
    pub services: Vec<(String, ServiceManifest)>,
}

/// One service of a manifest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceManifest {
    #[serde(default)]
    pub profile: ProfileKind,
    /// Image overriding the profile default
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    /// Port served on the fabric and published to the host
    #[serde(default)]
    pub port: Option<u16>,
    /// Further container ports to publish
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub readiness: Option<ReadinessPolicy>,
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    #[serde(default)]
    pub reuse: bool,
    #[serde(default)]
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub bindings: Vec<BindingManifest>,
}

/// Environment as a map or as `KEY=value` strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    Map(BTreeMap<String, ConfigValue>),
    Array(Vec<String>),
}

/// Command as a shell string or in exec form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Shell(String),
    Exec(Vec<String>),
}

/// Configuration key bound to a named dependency's endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct BindingManifest {
    pub dependency: String,
    pub key: String,
    pub template: String,
}

fn ordered_services<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, ServiceManifest)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ServicesVisitor;

    impl<'de> Visitor<'de> for ServicesVisitor {
        type Value = Vec<(String, ServiceManifest)>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a map of service names to services")
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut services: Vec<(String, ServiceManifest)> = Vec::new();
            while let Some((name, service)) = map.next_entry::<String, Option<ServiceManifest>>()? {
                if services.iter().any(|(existing, _)| *existing == name) {
                    return Err(de::Error::custom(format!("duplicate service '{}'", name)));
                }
                services.push((name, service.unwrap_or_default()));
            }
            Ok(services)
        }
    }

    deserializer.deserialize_map(ServicesVisitor)
}

impl EnvironmentConfig {
    fn pairs(&self) -> Result<Vec<(String, ConfigValue)>> {
        match self {
            EnvironmentConfig::Map(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            EnvironmentConfig::Array(items) => items
                .iter()
                .map(|item| {
                    item.split_once('=')
                        .map(|(k, v)| (k.to_string(), ConfigValue::from(v)))
                        .ok_or_else(|| FlotillaError::InvalidConfig(format!(
                            "Environment entry '{}' is not KEY=value",
                            item
                        )))
                })
                .collect(),
        }
    }
}

impl CommandConfig {
    fn args(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            CommandConfig::Exec(args) => args.clone(),
        }
    }
}

impl ServiceManifest {
    /// Build the node for this service; dependencies are added by the graph
    pub fn to_node(&self, name: &str) -> Result<ServiceNode> {
        let mut node = ServiceNode::of_kind(name, self.profile);

        if let Some(ref image) = self.image {
            node = node.with_image(image)?;
        }
        if let Some(ref alias) = self.alias {
            node = node.with_alias(alias);
        }
        if let Some(port) = self.port {
            node = node.with_port(port);
        }
        for port in &self.ports {
            node = node.with_exposed_port(*port);
        }
        if let Some(ref readiness) = self.readiness {
            node = node.with_readiness(readiness.clone());
        }
        if let Some(secs) = self.startup_timeout_secs {
            node = node.with_startup_timeout(Duration::from_secs(secs));
        }
        if let Some(ref command) = self.command {
            node = node.with_command(command.args());
        }
        for binding in &self.bindings {
            node = node.with_binding(&binding.dependency, &binding.key, &binding.template);
        }

        node = node.with_reuse(self.reuse);

        if let Some(ref environment) = self.environment {
            node.configure(environment.pairs()?)?;
        }

        Ok(node)
    }
}

impl ClusterManifest {
    /// Build the dependency graph; forward references between services are allowed
    pub fn build_graph(&self) -> Result<ClusterGraph> {
        let mut graph = ClusterGraph::new();

        for (name, service) in &self.services {
            graph.add_node(service.to_node(name)?, &[])?;
        }

        for (name, service) in &self.services {
            for dependency in &service.depends_on {
                if dependency == name {
                    return Err(FlotillaError::Cycle(vec![name.clone(), name.clone()]));
                }
                graph.add_edge(name, dependency)?;
            }
        }

        Ok(graph)
    }

    /// Orchestrator for this manifest; manifest values win over settings
    pub fn build_orchestrator(
        &self,
        settings: &Settings,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<ClusterOrchestrator> {
        let graph = self.build_graph()?;
        let mut orchestrator = ClusterOrchestrator::from_settings(graph, settings, runtime);

        if let Some(ref network) = self.network {
            orchestrator = orchestrator.with_fabric(Arc::new(NetworkFabric::new(network)));
        }
        if let Some(mode) = self.start_mode {
            orchestrator = orchestrator.with_start_mode(mode);
        }

        Ok(orchestrator)
    }
}

/// Manifest file parser
pub struct ManifestParser;

impl ManifestParser {
    /// Find a manifest file in `dir`
    pub fn find_manifest_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse a manifest file, interpolating the process environment
    pub fn parse_file(path: &Path) -> Result<ClusterManifest> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlotillaError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_str(&Self::interpolate(&content, &env)?)
    }

    /// Parse a manifest from a string
    pub fn parse_str(content: &str) -> Result<ClusterManifest> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Replace `${VAR}` and `${VAR:-default}` with values from `env`
    ///
    /// Unset variables without a default are left as they are.
    pub fn interpolate(content: &str, env: &HashMap<String, String>) -> Result<String> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")?;

        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                match (env.get(&caps[1]), caps.get(2)) {
                    (Some(value), _) => value.clone(),
                    (None, Some(default)) => default.as_str().to_string(),
                    (None, None) => caps[0].to_string(),
                }
            })
            .into_owned())
    }

    /// Check a manifest without starting anything
    ///
    /// Returns warnings for suspicious but valid settings.
    pub fn validate(manifest: &ClusterManifest) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if manifest.services.is_empty() {
            return Err(FlotillaError::InvalidConfig(
                "Manifest defines no services".to_string(),
            ));
        }

        let graph = manifest.build_graph()?;

        let mut aliases = HashSet::new();
        for node in graph.nodes() {
            node.validate()?;

            if !aliases.insert(node.alias().to_string()) {
                return Err(FlotillaError::AliasConflict {
                    alias: node.alias().to_string(),
                    fabric: manifest.network.clone().unwrap_or_else(|| "cluster".to_string()),
                });
            }
        }

        for (name, service) in &manifest.services {
            if service.profile == ProfileKind::Generic && service.readiness.is_none() {
                warnings.push(format!(
                    "Service '{}' has no readiness policy and is ready as soon as it runs",
                    name
                ));
            }

            if let Some(ref environment) = service.environment {
                let profile = crate::node::ServiceProfile::for_kind(service.profile);
                for (key, _) in environment.pairs()? {
                    if profile.bindings.iter().any(|b| b.key == key) {
                        warnings.push(format!(
                            "Service '{}' sets {} which is normally derived from its dependencies",
                            name, key
                        ));
                    }
                }
            }

            if service.reuse {
                warnings.push(format!(
                    "Service '{}' asks for reuse, which only applies when reuse is enabled",
                    name
                ));
            }
        }

        Ok(warnings)
    }
}
