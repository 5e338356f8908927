//! Service nodes

use super::probe::{ProbeState, ProbeTarget, ReadinessPolicy, ReadinessProbe};
use super::profile::{
    render_host, render_self, BindingSource, ConfigValue, DependencyBinding, ProfileKind, ServiceProfile,
};
use crate::cluster::reuse::{Fingerprint, ReuseLookup};
use crate::container::config::{LABEL_FINGERPRINT, LABEL_NODE, LABEL_SESSION};
use crate::container::{ContainerRuntime, ContainerSpec, ImageRef};
use crate::error::{FlotillaError, Result};
use crate::network::{ExternalAddress, InternalAddress, NetworkFabric, ServiceEndpoint};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Startup timeout for nodes that do not set one
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Registered, not started
    Created,
    /// Launched, waiting for readiness
    Starting,
    /// Ready
    Running,
    /// Start failed
    Failed,
    /// Stopped
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "created"),
            NodeState::Starting => write!(f, "starting"),
            NodeState::Running => write!(f, "running"),
            NodeState::Failed => write!(f, "failed"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Membership of a node in a fabric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub fabric: String,
    pub alias: String,
}

/// A running dependency as seen by its dependents
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub kind: ProfileKind,
    pub endpoint: ServiceEndpoint,
}

/// Everything a node needs from its orchestrator to start
#[derive(Clone)]
pub struct StartContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Runtime network id to join
    pub network_id: Option<String>,
    /// Fabric name, part of the reuse fingerprint
    pub network_name: String,
    /// Session id used in container names and labels
    pub session: String,
    /// Running dependencies by logical name
    pub dependencies: BTreeMap<String, ResolvedDependency>,
    pub reuse: Option<Arc<dyn ReuseLookup>>,
    /// Timeout for nodes without their own
    pub default_timeout: Duration,
}

/// One deployable service of a cluster
#[derive(Debug)]
pub struct ServiceNode {
    /// Logical name
    name: String,
    /// Profile with any per-node customisation applied
    profile: ServiceProfile,
    /// Caller supplied configuration
    overlay: BTreeMap<String, ConfigValue>,
    startup_timeout: Option<Duration>,
    reuse: bool,
    command: Vec<String>,
    /// Declared dependencies, in declaration order
    dependencies: Vec<String>,
    attachment: Option<Attachment>,
    state: NodeState,
    container_id: Option<String>,
    endpoint: Option<ServiceEndpoint>,
    probe_state: ProbeState,
    reused: bool,
    fingerprint: Option<Fingerprint>,
}

impl ServiceNode {
    /// Create a node from a profile
    pub fn new(name: &str, profile: ServiceProfile) -> Self {
        Self {
            name: name.to_string(),
            profile,
            overlay: BTreeMap::new(),
            startup_timeout: None,
            reuse: false,
            command: Vec::new(),
            dependencies: Vec::new(),
            attachment: None,
            state: NodeState::Created,
            container_id: None,
            endpoint: None,
            probe_state: ProbeState::Pending,
            reused: false,
            fingerprint: None,
        }
    }

    /// Create a node from a built-in profile
    pub fn of_kind(name: &str, kind: ProfileKind) -> Self {
        Self::new(name, ServiceProfile::for_kind(kind))
    }

    pub fn broker(name: &str) -> Self {
        Self::of_kind(name, ProfileKind::Broker)
    }

    pub fn schema_registry(name: &str) -> Self {
        Self::of_kind(name, ProfileKind::SchemaRegistry)
    }

    pub fn sql_server(name: &str) -> Self {
        Self::of_kind(name, ProfileKind::SqlServer)
    }

    /// Generic node running `image` and serving on `port` (0 for none)
    pub fn generic(name: &str, image: &str, port: u16) -> Result<Self> {
        Ok(Self::of_kind(name, ProfileKind::Generic)
            .with_image(image)?
            .with_port(port))
    }

    /// Replace the image; it must be compatible with the profile
    pub fn with_image(mut self, reference: &str) -> Result<Self> {
        let image = ImageRef::parse(reference)?;
        self.profile.check_image(&image)?;
        self.profile.image = Some(image);
        Ok(self)
    }

    /// Keep the profile's image repository with another tag
    pub fn with_tag(mut self, tag: &str) -> Result<Self> {
        let image = self.profile.image.as_ref()
            .ok_or_else(|| FlotillaError::InvalidConfig(format!("Node {} has no image", self.name)))?
            .with_tag(tag);
        self.profile.image = Some(image);
        Ok(self)
    }

    /// Preferred fabric alias
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.profile.alias = alias.to_string();
        self
    }

    /// Port served on the fabric and published to the host
    pub fn with_port(mut self, port: u16) -> Self {
        self.profile.port = port;
        self.profile.published_port = port;
        self
    }

    /// Publish another container port
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        if !self.profile.extra_ports.contains(&port) {
            self.profile.extra_ports.push(port);
        }
        self
    }

    pub fn with_env(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.overlay.insert(key.to_string(), value.into());
        self
    }

    pub fn with_readiness(mut self, policy: ReadinessPolicy) -> Self {
        self.profile.readiness = policy;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Opt into attaching to an already running identical node
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Derive `key` from the endpoint of the dependency named `dependency`
    pub fn with_binding(mut self, dependency: &str, key: &str, template: &str) -> Self {
        self.profile.bindings.push(DependencyBinding::on_node(dependency, key, template));
        self
    }

    /// Merge configuration over the profile defaults
    ///
    /// Later values for the same key replace earlier ones.
    pub fn configure<I, K, V>(&mut self, overlay: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.ensure_unstarted()?;

        for (key, value) in overlay {
            self.overlay.insert(key.into(), value.into());
        }

        Ok(())
    }

    /// Add a dependency binding before start
    pub fn bind(&mut self, dependency: &str, key: &str, template: &str) -> Result<()> {
        self.ensure_unstarted()?;
        self.profile.bindings.push(DependencyBinding::on_node(dependency, key, template));
        Ok(())
    }

    /// Join a fabric under `alias`
    ///
    /// Returns whether this call registered the alias on the fabric.
    pub fn attach_to(&mut self, fabric: &NetworkFabric, alias: &str) -> Result<bool> {
        self.ensure_unstarted()?;

        if let Some(ref current) = self.attachment {
            if current.fabric != fabric.name() {
                return Err(FlotillaError::InvalidConfig(format!(
                    "Node {} is already attached to network {}",
                    self.name, current.fabric
                )));
            }
            if current.alias == alias {
                return Ok(false);
            }
        }

        let registered = fabric.attach(alias, &self.name)?;

        if let Some(previous) = self.attachment.take() {
            fabric.detach(&previous.alias)?;
        }

        self.attachment = Some(Attachment {
            fabric: fabric.name().to_string(),
            alias: alias.to_string(),
        });

        Ok(registered)
    }

    /// Leave the fabric the node is attached to
    pub fn detach_from(&mut self, fabric: &NetworkFabric) -> Result<()> {
        match self.attachment {
            Some(ref attachment) if attachment.fabric == fabric.name() => {
                fabric.detach(&attachment.alias)?;
                self.attachment = None;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Check everything that can be checked before launch
    pub fn validate(&self) -> Result<()> {
        if self.profile.image.is_none() {
            return Err(FlotillaError::InvalidConfig(format!(
                "Node {} has no image",
                self.name
            )));
        }

        ReadinessProbe::from_policy(&self.profile.readiness, self.profile.published_port, self.timeout(DEFAULT_STARTUP_TIMEOUT))?;

        for binding in &self.profile.bindings {
            if let BindingSource::Node(ref dependency) = binding.source {
                if !self.dependencies.contains(dependency) {
                    return Err(FlotillaError::InvalidConfig(format!(
                        "Node {} binds {} to {}, which it does not depend on",
                        self.name, binding.key, dependency
                    )));
                }
            }
        }

        Ok(())
    }

    /// Alias on the fabric, or the preferred alias when not attached
    pub fn alias(&self) -> &str {
        match self.attachment {
            Some(ref attachment) => &attachment.alias,
            None if !self.profile.alias.is_empty() => &self.profile.alias,
            None => &self.name,
        }
    }

    /// Configuration the container is launched with
    ///
    /// Profile defaults, then values bound from dependencies, then the
    /// caller's overlay. Values may reference the node's own `{alias}` and
    /// `{port}`. A pinned host port is only known at launch, so `{host}` and
    /// `{external_port}` are left as written here.
    pub fn effective_config(
        &self,
        dependencies: &BTreeMap<String, ResolvedDependency>,
    ) -> Result<BTreeMap<String, String>> {
        self.render_config(dependencies, None)
    }

    /// Effective configuration, with `{host}` and `{external_port}` filled in
    /// from `external` when the host port is already known
    fn render_config(
        &self,
        dependencies: &BTreeMap<String, ResolvedDependency>,
        external: Option<&ExternalAddress>,
    ) -> Result<BTreeMap<String, String>> {
        let alias = self.alias().to_string();
        let port = self.profile.port;
        let render = |value: &ConfigValue| {
            let value = render_self(&value.to_string(), &alias, port);
            match external {
                Some(address) => render_host(&value, &address.host, address.port),
                None => value,
            }
        };
        let mut config = BTreeMap::new();

        for (key, value) in &self.profile.defaults {
            config.insert(key.clone(), render(value));
        }

        for binding in &self.profile.bindings {
            let mut values = Vec::new();
            for name in &self.dependencies {
                let Some(dependency) = dependencies.get(name) else {
                    if matches!(binding.source, BindingSource::Node(ref n) if n == name) {
                        return Err(FlotillaError::NotRunning(format!(
                            "dependency {} of {}",
                            name, self.name
                        )));
                    }
                    continue;
                };

                if binding.matches(name, dependency.kind) {
                    values.push(binding.render(&dependency.endpoint));
                }
            }

            if !values.is_empty() {
                config.insert(binding.key.clone(), values.join(","));
            }
        }

        for (key, value) in &self.overlay {
            config.insert(key.clone(), render(value));
        }

        Ok(config)
    }

    /// Launch the node and wait for it to become ready
    pub async fn start(&mut self, ctx: &StartContext) -> Result<ServiceEndpoint> {
        if self.state != NodeState::Created {
            return Err(FlotillaError::AlreadyStarted(self.name.clone()));
        }

        self.state = NodeState::Starting;
        info!("Starting {} ({})", self.name, self.image_label());

        match self.launch(ctx).await {
            Ok(endpoint) => {
                self.state = NodeState::Running;
                self.endpoint = Some(endpoint.clone());
                info!("{} is running at {} ({})", self.name, endpoint.external, endpoint.internal);
                Ok(endpoint)
            }
            Err(e) => {
                self.state = NodeState::Failed;
                warn!("Failed to start {}: {}", self.name, e);
                Err(e)
            }
        }
    }

    async fn launch(&mut self, ctx: &StartContext) -> Result<ServiceEndpoint> {
        let mut probe = ReadinessProbe::from_policy(
            &self.profile.readiness,
            self.profile.published_port,
            self.timeout(ctx.default_timeout),
        )?;

        let env = self.effective_config(&ctx.dependencies)?;
        let mut spec = self.container_spec(ctx, env)?;
        let fingerprint = Fingerprint::of(&spec, &ctx.network_name);
        self.fingerprint = Some(fingerprint.clone());

        if self.reuse {
            if let Some(ref lookup) = ctx.reuse {
                if let Some(mut endpoint) = lookup.find_running(&fingerprint) {
                    info!("Reusing running {} ({})", self.name, fingerprint);
                    endpoint.name = self.name.clone();
                    self.reused = true;
                    self.probe_state = ProbeState::Ready;
                    return Ok(endpoint);
                }
            }
        }

        if self.profile.pin_host_port && self.profile.published_port != 0 {
            let external = ExternalAddress {
                host: ctx.runtime.host(),
                port: reserve_host_port().await?,
            };
            let env = self.render_config(&ctx.dependencies, Some(&external))?;
            spec = self.container_spec(ctx, env)?
                .publish(self.profile.published_port, external.port);
        }

        let spec = spec.label(LABEL_FINGERPRINT, fingerprint.as_str());
        let id = ctx.runtime.launch(&spec).await?;
        debug!("Launched {} as container {}", self.name, id);
        self.container_id = Some(id.clone());

        let target = ProbeTarget {
            runtime: ctx.runtime.as_ref(),
            container_id: &id,
        };
        let waited = probe.wait(&self.name, &target).await;
        self.probe_state = probe.state().clone();
        waited?;

        let endpoint = self.resolve_endpoint(ctx.runtime.as_ref(), &id).await?;

        if self.reuse {
            if let Some(ref lookup) = ctx.reuse {
                lookup.remember(fingerprint, endpoint.clone());
            }
        }

        Ok(endpoint)
    }

    fn container_spec(&self, ctx: &StartContext, env: BTreeMap<String, String>) -> Result<ContainerSpec> {
        let image = self.profile.image.clone()
            .ok_or_else(|| FlotillaError::InvalidConfig(format!("Node {} has no image", self.name)))?;

        let mut spec = ContainerSpec::new(&format!("{}-{}", ctx.session, self.name), image)
            .label(LABEL_SESSION, &ctx.session)
            .label(LABEL_NODE, &self.name)
            .cmd(self.command.clone());
        spec.env = env;

        if let Some(ref network) = ctx.network_id {
            spec = spec.network(network, self.alias());
        }

        for port in self.profile.ports() {
            spec = spec.port(port);
        }

        Ok(spec)
    }

    async fn resolve_endpoint(&self, runtime: &dyn ContainerRuntime, id: &str) -> Result<ServiceEndpoint> {
        let mut ports = BTreeMap::new();
        for port in self.profile.ports() {
            ports.insert(port, runtime.mapped_port(id, port).await?);
        }

        let external_port = ports.get(&self.profile.published_port).copied().unwrap_or(0);

        Ok(ServiceEndpoint {
            name: self.name.clone(),
            internal: InternalAddress {
                alias: self.alias().to_string(),
                port: self.profile.port,
            },
            external: ExternalAddress {
                host: runtime.host(),
                port: external_port,
            },
            ports,
            ready: true,
            container_id: id.to_string(),
            started_at: Utc::now(),
        })
    }

    /// Terminate the node; stopping a stopped node does nothing
    pub async fn stop(&mut self, runtime: &dyn ContainerRuntime) -> Result<()> {
        match self.state {
            NodeState::Stopped => return Ok(()),
            NodeState::Created => {
                self.state = NodeState::Stopped;
                return Ok(());
            }
            _ => {}
        }

        if self.reused {
            info!("Releasing reused {}", self.name);
        } else if let Some(ref id) = self.container_id {
            match runtime.stop(id).await {
                Ok(()) | Err(FlotillaError::ContainerNotFound(_)) => {
                    info!("Stopped {}", self.name);
                }
                Err(e) => {
                    return Err(FlotillaError::Teardown {
                        node: self.name.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        self.container_id = None;
        self.endpoint = None;
        self.state = NodeState::Stopped;

        Ok(())
    }

    fn ensure_unstarted(&self) -> Result<()> {
        if self.state != NodeState::Created {
            return Err(FlotillaError::AlreadyStarted(self.name.clone()));
        }
        Ok(())
    }

    fn timeout(&self, default: Duration) -> Duration {
        self.startup_timeout.unwrap_or(default)
    }

    fn image_label(&self) -> String {
        self.profile.image.as_ref()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "no image".to_string())
    }

    pub(crate) fn set_dependencies(&mut self, dependencies: Vec<String>) {
        self.dependencies = dependencies;
    }

    pub(crate) fn push_dependency(&mut self, dependency: &str) {
        if !self.dependencies.iter().any(|d| d == dependency) {
            self.dependencies.push(dependency.to_string());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProfileKind {
        self.profile.kind
    }

    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }

    pub fn image(&self) -> Option<&ImageRef> {
        self.profile.image.as_ref()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn endpoint(&self) -> Option<&ServiceEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn probe_state(&self) -> &ProbeState {
        &self.probe_state
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }
}

/// Ask the OS for a free host port
///
/// The listener is closed before returning, so another process could still
/// take the port before the container binds it.
async fn reserve_host_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::reuse::ReuseRegistry;
    use crate::container::{ContainerScript, SimulatedRuntime};
    use crate::node::profile::BROKER_INTERNAL_PORT;

    fn context(runtime: &SimulatedRuntime) -> StartContext {
        StartContext {
            runtime: Arc::new(runtime.clone()),
            network_id: None,
            network_name: "test-net".to_string(),
            session: "t1".to_string(),
            dependencies: BTreeMap::new(),
            reuse: None,
            default_timeout: Duration::from_secs(2),
        }
    }

    fn ready_broker(runtime: &SimulatedRuntime) {
        runtime.script("broker", ContainerScript::new()
            .log(Duration::ZERO, "[KafkaRaftServer nodeId=1] Kafka Server started")).unwrap();
    }

    #[test]
    fn test_configure_merges_over_defaults() {
        let mut node = ServiceNode::schema_registry("registry");
        node.configure([("SCHEMA_REGISTRY_DEBUG", "false")]).unwrap();
        node.configure([("SCHEMA_REGISTRY_DEBUG", true)]).unwrap();

        let config = node.effective_config(&BTreeMap::new()).unwrap();
        assert_eq!(config["SCHEMA_REGISTRY_DEBUG"], "true");
        assert_eq!(config["SCHEMA_REGISTRY_HOST_NAME"], "schema-registry");
        assert_eq!(config["SCHEMA_REGISTRY_LISTENERS"], "http://0.0.0.0:8081");
    }

    #[test]
    fn test_dependency_bindings_and_precedence() {
        let mut node = ServiceNode::sql_server("sql");
        node.set_dependencies(vec!["broker".to_string(), "registry".to_string()]);

        let mut deps = BTreeMap::new();
        for (name, kind, alias, port) in [
            ("broker", ProfileKind::Broker, "kafka", BROKER_INTERNAL_PORT),
            ("registry", ProfileKind::SchemaRegistry, "schema-registry", 8081),
        ] {
            deps.insert(name.to_string(), ResolvedDependency {
                kind,
                endpoint: ServiceEndpoint {
                    name: name.to_string(),
                    internal: InternalAddress { alias: alias.to_string(), port },
                    external: ExternalAddress { host: "localhost".to_string(), port: 40000 },
                    ports: BTreeMap::new(),
                    ready: true,
                    container_id: "c".to_string(),
                    started_at: Utc::now(),
                },
            });
        }

        let config = node.effective_config(&deps).unwrap();
        assert_eq!(config["KSQL_BOOTSTRAP_SERVERS"], "PLAINTEXT://kafka:9092");
        assert_eq!(config["KSQL_KSQL_SCHEMA_REGISTRY_URL"], "http://schema-registry:8081");

        node.configure([("KSQL_BOOTSTRAP_SERVERS", "PLAINTEXT://elsewhere:9092")]).unwrap();
        let config = node.effective_config(&deps).unwrap();
        assert_eq!(config["KSQL_BOOTSTRAP_SERVERS"], "PLAINTEXT://elsewhere:9092");
    }

    #[test]
    fn test_incompatible_image_rejected() {
        assert!(ServiceNode::schema_registry("r").with_image("confluentinc/cp-kafka:7.4.0").is_err());
        let node = ServiceNode::sql_server("sql").with_image("confluentinc/ksqldb-server:0.17.0").unwrap();
        assert_eq!(node.image().unwrap().tag, "0.17.0");
    }

    #[test]
    fn test_validate_rejects_binding_to_non_dependency() {
        let node = ServiceNode::generic("app", "alpine:3.5", 0)
            .unwrap()
            .with_binding("db", "DB_URL", "{alias}:{port}");
        assert!(node.validate().is_err());

        assert!(ServiceNode::of_kind("bare", ProfileKind::Generic).validate().is_err());
    }

    #[test]
    fn test_attach_to_single_fabric() {
        let one = NetworkFabric::new("one");
        let two = NetworkFabric::new("two");
        let mut node = ServiceNode::broker("broker");

        assert!(node.attach_to(&one, "kafka").unwrap());
        assert!(!node.attach_to(&one, "kafka").unwrap());
        assert_eq!(node.alias(), "kafka");
        assert!(node.attach_to(&two, "kafka").is_err());

        // an alias registered by someone else is not ours to release
        let mut twin = ServiceNode::broker("broker");
        assert!(!twin.attach_to(&one, "kafka").unwrap());

        assert!(node.attach_to(&one, "kafka-1").unwrap());
        assert_eq!(one.member("kafka").unwrap(), None);
        assert_eq!(one.member("kafka-1").unwrap(), Some("broker".to_string()));

        node.detach_from(&one).unwrap();
        assert!(one.members().unwrap().is_empty());
        assert!(node.attachment().is_none());
    }

    #[tokio::test]
    async fn test_start_and_idempotent_stop() {
        let runtime = SimulatedRuntime::new();
        ready_broker(&runtime);
        let ctx = context(&runtime);

        let mut node = ServiceNode::broker("broker");
        let endpoint = node.start(&ctx).await.unwrap();

        assert_eq!(node.state(), NodeState::Running);
        assert_eq!(node.probe_state(), &ProbeState::Ready);
        assert_eq!(endpoint.internal.to_string(), "kafka:9092");
        assert_eq!(endpoint.external.host, "127.0.0.1");
        assert_ne!(endpoint.external.port, 0);
        assert!(matches!(
            node.configure([("X", "1")]),
            Err(FlotillaError::AlreadyStarted(_))
        ));
        assert!(matches!(node.start(&ctx).await, Err(FlotillaError::AlreadyStarted(_))));

        node.stop(ctx.runtime.as_ref()).await.unwrap();
        node.stop(ctx.runtime.as_ref()).await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.endpoint().is_none());

        let stops = runtime.journal().unwrap().iter()
            .filter(|e| matches!(e, crate::container::RuntimeEvent::Stopped(_)))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_broker_advertises_its_published_host_port() {
        let runtime = SimulatedRuntime::new();
        ready_broker(&runtime);
        let ctx = context(&runtime);

        let mut node = ServiceNode::broker("broker");
        let endpoint = node.start(&ctx).await.unwrap();

        let spec = runtime.launched_spec("broker").unwrap().unwrap();
        assert_eq!(spec.host_ports.get(&9093), Some(&endpoint.external.port));
        assert_eq!(
            spec.env["KAFKA_ADVERTISED_LISTENERS"],
            format!("BROKER://kafka:9092,PLAINTEXT://127.0.0.1:{}", endpoint.external.port)
        );

        // the unpinned preview leaves the host listener unresolved
        let preview = node.effective_config(&BTreeMap::new()).unwrap();
        assert!(preview["KAFKA_ADVERTISED_LISTENERS"].ends_with("PLAINTEXT://{host}:{external_port}"));
    }

    #[tokio::test]
    async fn test_failed_start_keeps_container_for_cleanup() {
        let runtime = SimulatedRuntime::new();
        runtime.script("broker", ContainerScript::new().exit(Duration::from_millis(20), 1)).unwrap();
        let ctx = context(&runtime);

        let mut node = ServiceNode::broker("broker");
        let err = node.start(&ctx).await.unwrap_err();

        assert!(matches!(err, FlotillaError::ProcessExit { code: Some(1), .. }));
        assert_eq!(node.state(), NodeState::Failed);
        assert!(node.container_id().is_some());

        node.stop(ctx.runtime.as_ref()).await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_reuse_attaches_to_running_node() {
        let runtime = SimulatedRuntime::new();
        ready_broker(&runtime);
        let registry = Arc::new(ReuseRegistry::new());

        let mut ctx = context(&runtime);
        ctx.reuse = Some(registry.clone());

        let mut first = ServiceNode::broker("broker").with_reuse(true);
        let endpoint = first.start(&ctx).await.unwrap();
        assert_eq!(registry.len(), 1);

        let mut second = ServiceNode::broker("broker").with_reuse(true);
        let reused = second.start(&ctx).await.unwrap();
        assert!(second.is_reused());
        assert_eq!(reused.container_id, endpoint.container_id);

        // releasing a reused node leaves the container running
        second.stop(ctx.runtime.as_ref()).await.unwrap();
        assert_eq!(runtime.running().unwrap(), vec!["broker".to_string()]);
    }
}
