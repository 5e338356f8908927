//! Service profiles
//!
//! A profile describes one kind of service: its default image, alias, ports,
//! environment, readiness policy and how it wires itself to the endpoints of
//! the nodes it depends on.

use super::probe::ReadinessPolicy;
use crate::container::ImageRef;
use crate::error::{FlotillaError, Result};
use crate::network::ServiceEndpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Broker listener reachable from other containers on the fabric
pub const BROKER_INTERNAL_PORT: u16 = 9092;
/// Broker listener published to the host
pub const BROKER_EXTERNAL_PORT: u16 = 9093;
/// Broker controller listener
pub const BROKER_CONTROLLER_PORT: u16 = 9094;
/// Schema registry HTTP port
pub const SCHEMA_REGISTRY_PORT: u16 = 8081;
/// SQL server HTTP port
pub const SQL_SERVER_PORT: u16 = 8088;

/// Kind of service a profile describes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileKind {
    /// Message broker
    Broker,
    /// Schema registry
    SchemaRegistry,
    /// SQL-on-streams server
    SqlServer,
    /// Any other image
    #[default]
    Generic,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 4] = [
        ProfileKind::Broker,
        ProfileKind::SchemaRegistry,
        ProfileKind::SqlServer,
        ProfileKind::Generic,
    ];
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileKind::Broker => write!(f, "broker"),
            ProfileKind::SchemaRegistry => write!(f, "schema-registry"),
            ProfileKind::SqlServer => write!(f, "sql-server"),
            ProfileKind::Generic => write!(f, "generic"),
        }
    }
}

impl FromStr for ProfileKind {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broker" => Ok(ProfileKind::Broker),
            "schema-registry" => Ok(ProfileKind::SchemaRegistry),
            "sql-server" => Ok(ProfileKind::SqlServer),
            "generic" => Ok(ProfileKind::Generic),
            other => Err(FlotillaError::InvalidConfig(format!(
                "Unknown profile: {}",
                other
            ))),
        }
    }
}

/// A configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Int(i) => write!(f, "{}", i),
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Str(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<u16> for ConfigValue {
    fn from(value: u16) -> Self {
        ConfigValue::Int(value.into())
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

/// Which dependency a binding reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindingSource {
    /// Any dependency of this profile kind
    Kind(ProfileKind),
    /// The dependency with this logical name
    Node(String),
}

/// Configuration key derived from a dependency's endpoint
///
/// Templates understand `{alias}`, `{port}`, `{host}` and `{external_port}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyBinding {
    pub source: BindingSource,
    pub key: String,
    pub template: String,
}

impl DependencyBinding {
    pub fn on_kind(kind: ProfileKind, key: &str, template: &str) -> Self {
        Self {
            source: BindingSource::Kind(kind),
            key: key.to_string(),
            template: template.to_string(),
        }
    }

    pub fn on_node(node: &str, key: &str, template: &str) -> Self {
        Self {
            source: BindingSource::Node(node.to_string()),
            key: key.to_string(),
            template: template.to_string(),
        }
    }

    /// Whether this binding reads from the named dependency
    pub fn matches(&self, name: &str, kind: ProfileKind) -> bool {
        match &self.source {
            BindingSource::Kind(k) => *k == kind,
            BindingSource::Node(n) => n == name,
        }
    }

    /// Render the template against a dependency endpoint
    pub fn render(&self, endpoint: &ServiceEndpoint) -> String {
        self.template
            .replace("{alias}", &endpoint.internal.alias)
            .replace("{port}", &endpoint.internal.port.to_string())
            .replace("{host}", &endpoint.external.host)
            .replace("{external_port}", &endpoint.external.port.to_string())
    }
}

/// Defaults and wiring for one kind of service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub kind: ProfileKind,
    /// Default image
    pub image: Option<ImageRef>,
    /// Repositories the image may be swapped for
    pub compatible_images: Vec<String>,
    /// Default network alias (the node name when empty)
    pub alias: String,
    /// Port other containers on the fabric connect to
    pub port: u16,
    /// Container port whose host mapping is the external address
    pub published_port: u16,
    /// Publish `published_port` on a host port chosen before launch, so the
    /// configuration can name it as `{host}` and `{external_port}`
    #[serde(default)]
    pub pin_host_port: bool,
    /// Further ports to publish
    pub extra_ports: Vec<u16>,
    /// Default configuration, may reference `{alias}` and `{port}`, and
    /// `{host}` and `{external_port}` when the host port is pinned
    pub defaults: BTreeMap<String, ConfigValue>,
    pub readiness: ReadinessPolicy,
    pub bindings: Vec<DependencyBinding>,
}

impl ServiceProfile {
    /// Built-in profile for a kind
    ///
    /// `Generic` has no image and no port; callers have to supply both.
    pub fn for_kind(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Broker => Self::broker(),
            ProfileKind::SchemaRegistry => Self::schema_registry(),
            ProfileKind::SqlServer => Self::sql_server(),
            ProfileKind::Generic => Self::generic(),
        }
    }

    /// Single-node KRaft broker
    pub fn broker() -> Self {
        let defaults = [
            ("CLUSTER_ID", "4L6g3nShT-eMCtK--X86sw"),
            ("KAFKA_NODE_ID", "1"),
            ("KAFKA_PROCESS_ROLES", "broker,controller"),
            ("KAFKA_CONTROLLER_QUORUM_VOTERS", "1@localhost:9094"),
            ("KAFKA_LISTENERS", "BROKER://0.0.0.0:{port},PLAINTEXT://0.0.0.0:9093,CONTROLLER://0.0.0.0:9094"),
            ("KAFKA_ADVERTISED_LISTENERS", "BROKER://{alias}:{port},PLAINTEXT://{host}:{external_port}"),
            ("KAFKA_LISTENER_SECURITY_PROTOCOL_MAP", "BROKER:PLAINTEXT,PLAINTEXT:PLAINTEXT,CONTROLLER:PLAINTEXT"),
            ("KAFKA_INTER_BROKER_LISTENER_NAME", "BROKER"),
            ("KAFKA_CONTROLLER_LISTENER_NAMES", "CONTROLLER"),
            ("KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR", "1"),
            ("KAFKA_TRANSACTION_STATE_LOG_MIN_ISR", "1"),
            ("KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR", "1"),
            ("KAFKA_GROUP_INITIAL_REBALANCE_DELAY_MS", "0"),
        ];

        Self {
            kind: ProfileKind::Broker,
            image: Some(ImageRef::new("confluentinc/cp-kafka", "7.4.0")),
            compatible_images: vec!["confluentinc/cp-kafka".to_string()],
            alias: "kafka".to_string(),
            port: BROKER_INTERNAL_PORT,
            published_port: BROKER_EXTERNAL_PORT,
            pin_host_port: true,
            extra_ports: Vec::new(),
            defaults: string_defaults(&defaults),
            readiness: ReadinessPolicy::log_pattern(".*Kafka Server started.*"),
            bindings: Vec::new(),
        }
    }

    pub fn schema_registry() -> Self {
        let defaults = [
            ("SCHEMA_REGISTRY_HOST_NAME", "{alias}"),
            ("SCHEMA_REGISTRY_LISTENERS", "http://0.0.0.0:{port}"),
        ];

        Self {
            kind: ProfileKind::SchemaRegistry,
            image: Some(ImageRef::new("confluentinc/cp-schema-registry", "6.2.0-1-ubi8")),
            compatible_images: vec!["confluentinc/cp-schema-registry".to_string()],
            alias: "schema-registry".to_string(),
            port: SCHEMA_REGISTRY_PORT,
            published_port: SCHEMA_REGISTRY_PORT,
            pin_host_port: false,
            extra_ports: Vec::new(),
            defaults: string_defaults(&defaults),
            readiness: ReadinessPolicy::http_status("/subjects", 200),
            bindings: vec![DependencyBinding::on_kind(
                ProfileKind::Broker,
                "SCHEMA_REGISTRY_KAFKASTORE_BOOTSTRAP_SERVERS",
                "PLAINTEXT://{alias}:{port}",
            )],
        }
    }

    pub fn sql_server() -> Self {
        let defaults = [
            ("KSQL_HOST_NAME", "{alias}"),
            ("KSQL_LISTENERS", "http://0.0.0.0:{port}"),
        ];

        Self {
            kind: ProfileKind::SqlServer,
            image: Some(ImageRef::new("confluentinc/cp-ksqldb-server", "6.2.0-1-ubi8")),
            compatible_images: vec![
                "confluentinc/cp-ksqldb-server".to_string(),
                "confluentinc/ksqldb-server".to_string(),
            ],
            alias: "ksql-server".to_string(),
            port: SQL_SERVER_PORT,
            published_port: SQL_SERVER_PORT,
            pin_host_port: false,
            extra_ports: Vec::new(),
            defaults: string_defaults(&defaults),
            readiness: ReadinessPolicy::log_pattern(".*INFO Server up and running.*"),
            bindings: vec![
                DependencyBinding::on_kind(
                    ProfileKind::Broker,
                    "KSQL_BOOTSTRAP_SERVERS",
                    "PLAINTEXT://{alias}:{port}",
                ),
                DependencyBinding::on_kind(
                    ProfileKind::SchemaRegistry,
                    "KSQL_KSQL_SCHEMA_REGISTRY_URL",
                    "http://{alias}:{port}",
                ),
            ],
        }
    }

    pub fn generic() -> Self {
        Self {
            kind: ProfileKind::Generic,
            image: None,
            compatible_images: Vec::new(),
            alias: String::new(),
            port: 0,
            published_port: 0,
            pin_host_port: false,
            extra_ports: Vec::new(),
            defaults: BTreeMap::new(),
            readiness: ReadinessPolicy::Running,
            bindings: Vec::new(),
        }
    }

    /// Check that `image` may replace the profile's default
    pub fn check_image(&self, image: &ImageRef) -> Result<()> {
        if self.compatible_images.is_empty()
            || self.compatible_images.iter().any(|r| image.is_compatible_with(r))
        {
            return Ok(());
        }

        Err(FlotillaError::InvalidConfig(format!(
            "Image {} is not compatible with the {} profile (expected one of: {})",
            image,
            self.kind,
            self.compatible_images.join(", ")
        )))
    }

    /// Every container port the profile publishes
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for port in [self.port, self.published_port].iter().chain(&self.extra_ports) {
            if *port != 0 && !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }
}

/// Substitute a node's own `{alias}` and `{port}` into a value
pub fn render_self(value: &str, alias: &str, port: u16) -> String {
    value
        .replace("{alias}", alias)
        .replace("{port}", &port.to_string())
}

/// Substitute the host address a pinned port is published on
pub fn render_host(value: &str, host: &str, external_port: u16) -> String {
    value
        .replace("{host}", host)
        .replace("{external_port}", &external_port.to_string())
}

fn string_defaults(pairs: &[(&str, &str)]) -> BTreeMap<String, ConfigValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), ConfigValue::from(*v)))
        .collect()
}
