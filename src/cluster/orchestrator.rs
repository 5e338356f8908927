//! Cluster orchestrator

use super::graph::ClusterGraph;
use super::reuse::{ReuseLookup, ReuseRegistry};
use crate::container::ContainerRuntime;
use crate::error::{FlotillaError, Result};
use crate::network::{NetworkFabric, ServiceEndpoint};
use crate::node::service::DEFAULT_STARTUP_TIMEOUT;
use crate::node::{ResolvedDependency, ServiceNode, StartContext};
use crate::settings::Settings;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cluster lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Unstarted => write!(f, "unstarted"),
            ClusterState::Starting => write!(f, "starting"),
            ClusterState::Running => write!(f, "running"),
            ClusterState::Stopping => write!(f, "stopping"),
            ClusterState::Stopped => write!(f, "stopped"),
            ClusterState::Failed => write!(f, "failed"),
        }
    }
}

/// How nodes are launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// One node at a time in start order
    #[default]
    Sequential,
    /// Every node whose dependencies are running, concurrently
    Parallel,
}

impl std::fmt::Display for StartMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartMode::Sequential => write!(f, "sequential"),
            StartMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for StartMode {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(StartMode::Sequential),
            "parallel" => Ok(StartMode::Parallel),
            other => Err(FlotillaError::InvalidConfig(format!(
                "Unknown start mode: {} (expected sequential or parallel)",
                other
            ))),
        }
    }
}

/// Drives the lifecycle of a whole cluster
pub struct ClusterOrchestrator {
    graph: ClusterGraph,
    fabric: Arc<NetworkFabric>,
    runtime: Arc<dyn ContainerRuntime>,
    reuse: Option<Arc<dyn ReuseLookup>>,
    mode: StartMode,
    state: ClusterState,
    /// Endpoints of running nodes
    endpoints: BTreeMap<String, ServiceEndpoint>,
    /// Nodes whose start was attempted, in attempt order
    attempted: Vec<String>,
    session: String,
    /// Whether this orchestrator created the fabric's network
    owns_network: bool,
    /// Nodes whose fabric alias this orchestrator registered
    owned_aliases: HashSet<String>,
    default_timeout: Duration,
}

impl ClusterOrchestrator {
    /// Create an orchestrator for `graph` on `fabric`
    pub fn new(graph: ClusterGraph, fabric: Arc<NetworkFabric>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            graph,
            fabric,
            runtime,
            reuse: None,
            mode: StartMode::Sequential,
            state: ClusterState::Unstarted,
            endpoints: BTreeMap::new(),
            attempted: Vec::new(),
            session: Uuid::new_v4().to_string()[..8].to_string(),
            owns_network: false,
            owned_aliases: HashSet::new(),
            default_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Create an orchestrator on a fresh fabric configured from settings
    pub fn from_settings(graph: ClusterGraph, settings: &Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let fabric = Arc::new(NetworkFabric::generated(&settings.network_prefix));
        let orchestrator = Self::new(graph, fabric, runtime)
            .with_start_mode(settings.start_mode)
            .with_default_timeout(settings.startup_timeout());

        if settings.reuse_enabled {
            orchestrator.with_reuse(ReuseRegistry::shared())
        } else {
            orchestrator
        }
    }

    /// Let nodes that opt in attach to running identical nodes
    pub fn with_reuse(mut self, lookup: Arc<dyn ReuseLookup>) -> Self {
        self.reuse = Some(lookup);
        self
    }

    /// Use another fabric; only meaningful before start
    pub fn with_fabric(mut self, fabric: Arc<NetworkFabric>) -> Self {
        self.fabric = fabric;
        self
    }

    pub fn with_start_mode(mut self, mode: StartMode) -> Self {
        self.mode = mode;
        self
    }

    /// Readiness timeout for nodes without their own
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Start every node in dependency order
    pub async fn start(&mut self) -> Result<()> {
        self.start_until(std::future::pending()).await
    }

    /// Start every node, giving up when `cancel` completes first
    ///
    /// Cancellation is handled like any other startup failure: whatever was
    /// launched is stopped in reverse order and `StartupFailed` wrapping
    /// `Cancelled` is returned.
    pub async fn start_until<F>(&mut self, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        match self.state {
            ClusterState::Unstarted => {}
            ClusterState::Running => {
                return Err(FlotillaError::AlreadyStarted(format!("cluster {}", self.session)))
            }
            other => {
                return Err(FlotillaError::InvalidConfig(format!(
                    "Cannot start a cluster that is {}",
                    other
                )))
            }
        }

        if let Err(e) = self.prepare() {
            self.release_aliases();
            return Err(e);
        }

        self.transition(ClusterState::Starting);

        let outcome = {
            let launch = self.launch();
            tokio::pin!(launch);
            tokio::pin!(cancel);

            tokio::select! {
                result = &mut launch => result,
                _ = &mut cancel => Err(FlotillaError::Cancelled),
            }
        };

        match outcome {
            Ok(()) => {
                self.transition(ClusterState::Running);
                Ok(())
            }
            Err(e) => {
                warn!("Cluster {} failed to start: {}", self.session, e);
                self.transition(ClusterState::Failed);
                let teardown = self.teardown(true).await;
                Err(FlotillaError::StartupFailed {
                    source: Box::new(e),
                    teardown,
                })
            }
        }
    }

    /// Attach and validate every node before anything is launched
    fn prepare(&mut self) -> Result<()> {
        if self.graph.is_empty() {
            return Err(FlotillaError::InvalidConfig("Cluster has no nodes".to_string()));
        }

        self.graph.topological_start_order()?;

        for node in self.graph.nodes_mut() {
            let alias = node.alias().to_string();
            if node.attach_to(&self.fabric, &alias)? {
                self.owned_aliases.insert(node.name().to_string());
            }
        }

        for node in self.graph.nodes() {
            node.validate()?;
        }

        Ok(())
    }

    async fn launch(&mut self) -> Result<()> {
        let (network_id, created) = self
            .fabric
            .ensure_created(self.runtime.as_ref(), &self.session)
            .await?;
        self.owns_network |= created;

        match self.mode {
            StartMode::Sequential => {
                for name in self.graph.topological_start_order()? {
                    self.start_node(&name, &network_id).await?;
                }
            }
            StartMode::Parallel => {
                for (i, wave) in self.graph.start_waves()?.into_iter().enumerate() {
                    debug!("Starting wave {}: {:?}", i, wave);
                    self.start_wave(wave, &network_id).await?;
                }
            }
        }

        Ok(())
    }

    async fn start_node(&mut self, name: &str, network_id: &str) -> Result<()> {
        let node = self.graph.node(name)
            .ok_or_else(|| FlotillaError::NodeNotFound(name.to_string()))?;
        let ctx = self.context(node, network_id)?;

        self.attempted.push(name.to_string());
        let node = self.graph.node_mut(name)
            .ok_or_else(|| FlotillaError::NodeNotFound(name.to_string()))?;
        let endpoint = node.start(&ctx).await?;

        self.endpoints.insert(name.to_string(), endpoint);
        Ok(())
    }

    /// Start independent nodes concurrently; the whole wave settles before
    /// the first failure is returned
    async fn start_wave(&mut self, wave: Vec<String>, network_id: &str) -> Result<()> {
        let mut contexts = Vec::with_capacity(wave.len());
        for name in &wave {
            let node = self.graph.node(name)
                .ok_or_else(|| FlotillaError::NodeNotFound(name.clone()))?;
            contexts.push((name.clone(), self.context(node, network_id)?));
        }

        self.attempted.extend(wave);

        let mut pending = FuturesUnordered::new();
        for node in self.graph.nodes_mut().iter_mut() {
            let Some(pos) = contexts.iter().position(|(name, _)| name == node.name()) else {
                continue;
            };
            let (name, ctx) = contexts.swap_remove(pos);
            pending.push(async move { (name, node.start(&ctx).await) });
        }

        let mut failure = None;
        while let Some((name, result)) = pending.next().await {
            match result {
                Ok(endpoint) => {
                    self.endpoints.insert(name, endpoint);
                }
                Err(e) if failure.is_none() => failure = Some(e),
                Err(e) => warn!("{} also failed to start: {}", name, e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start context for `node`; every dependency must already be running
    fn context(&self, node: &ServiceNode, network_id: &str) -> Result<StartContext> {
        let mut dependencies = BTreeMap::new();

        for name in node.dependencies() {
            let endpoint = self.endpoints.get(name).cloned().ok_or_else(|| {
                FlotillaError::NotRunning(format!("dependency {} of {}", name, node.name()))
            })?;
            let kind = self.graph.node(name).map(|n| n.kind()).unwrap_or_default();
            dependencies.insert(name.clone(), ResolvedDependency { kind, endpoint });
        }

        Ok(StartContext {
            runtime: self.runtime.clone(),
            network_id: Some(network_id.to_string()),
            network_name: self.fabric.name().to_string(),
            session: self.session.clone(),
            dependencies,
            reuse: self.reuse.clone(),
            default_timeout: self.default_timeout,
        })
    }

    /// Stop every node in reverse start order
    ///
    /// A stop failure does not stop the sequence; all failures are returned
    /// together as `TeardownFailed`. Stopping a stopped cluster does nothing.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            ClusterState::Unstarted | ClusterState::Stopped => return Ok(()),
            _ => {}
        }

        self.transition(ClusterState::Stopping);
        let errors = self.teardown(false).await;

        if errors.is_empty() {
            self.transition(ClusterState::Stopped);
            Ok(())
        } else {
            self.transition(ClusterState::Failed);
            Err(FlotillaError::TeardownFailed(errors))
        }
    }

    /// Best-effort reverse teardown, returning every error met on the way
    async fn teardown(&mut self, attempted_only: bool) -> Vec<FlotillaError> {
        let mut errors = Vec::new();

        let order = match self.graph.reverse_stop_order() {
            Ok(order) => order,
            Err(e) => {
                errors.push(e);
                self.attempted.iter().rev().cloned().collect()
            }
        };

        for name in order {
            if attempted_only && !self.attempted.contains(&name) {
                continue;
            }

            let Some(node) = self.graph.node_mut(&name) else {
                continue;
            };

            match node.stop(self.runtime.as_ref()).await {
                Ok(()) => {
                    if let (Some(reuse), Some(fingerprint)) = (&self.reuse, node.fingerprint()) {
                        if !node.is_reused() {
                            reuse.forget(fingerprint);
                        }
                    }
                }
                Err(e) => {
                    warn!("Teardown of {} failed: {}", name, e);
                    errors.push(e);
                }
            }

            self.endpoints.remove(&name);
        }

        // Containers whose launch call never returned are only known by label
        let retained: Vec<String> = self.graph.nodes()
            .iter()
            .filter_map(|node| node.container_id().map(str::to_string))
            .collect();
        match self.runtime.remove_session(&self.session, &retained).await {
            Ok(removed) if !removed.is_empty() => {
                warn!("Removed {} untracked container(s) of cluster {}", removed.len(), self.session);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to sweep containers of cluster {}: {}", self.session, e);
                errors.push(FlotillaError::Teardown {
                    node: format!("session {}", self.session),
                    reason: e.to_string(),
                });
            }
        }

        self.release_aliases();

        if self.owns_network {
            match self.fabric.remove(self.runtime.as_ref()).await {
                Ok(()) => self.owns_network = false,
                Err(e) => {
                    warn!("Failed to remove network {}: {}", self.fabric.name(), e);
                    errors.push(FlotillaError::Teardown {
                        node: self.fabric.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        errors
    }

    /// Release the aliases this orchestrator registered
    ///
    /// An alias another cluster registered on a shared fabric stays.
    fn release_aliases(&mut self) {
        for node in self.graph.nodes_mut() {
            if !self.owned_aliases.remove(node.name()) {
                continue;
            }
            if let Err(e) = node.detach_from(&self.fabric) {
                warn!("Failed to detach {}: {}", node.name(), e);
            }
        }
    }

    fn transition(&mut self, state: ClusterState) {
        info!("Cluster {}: {} -> {}", self.session, self.state, state);
        self.state = state;
    }

    /// Endpoint of a node of a running cluster
    pub fn endpoint(&self, name: &str) -> Result<&ServiceEndpoint> {
        if self.state != ClusterState::Running {
            return Err(FlotillaError::NotRunning(format!("cluster is {}", self.state)));
        }

        self.endpoints.get(name)
            .ok_or_else(|| FlotillaError::NotRunning(format!("no node named {}", name)))
    }

    /// Every endpoint of a running cluster by node name
    pub fn endpoints(&self) -> Result<&BTreeMap<String, ServiceEndpoint>> {
        if self.state != ClusterState::Running {
            return Err(FlotillaError::NotRunning(format!("cluster is {}", self.state)));
        }

        Ok(&self.endpoints)
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn start_mode(&self) -> StartMode {
        self.mode
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn graph(&self) -> &ClusterGraph {
        &self.graph
    }

    pub fn fabric(&self) -> &NetworkFabric {
        &self.fabric
    }

    pub fn node(&self, name: &str) -> Option<&ServiceNode> {
        self.graph.node(name)
    }
}

impl Drop for ClusterOrchestrator {
    fn drop(&mut self) {
        if matches!(
            self.state,
            ClusterState::Starting | ClusterState::Running | ClusterState::Stopping
        ) {
            warn!(
                "Cluster {} dropped while {}; its containers may still be running",
                self.session, self.state
            );
        }
    }
}
