//! In-memory container runtime
//!
//! `SimulatedRuntime` behaves like a container engine without launching
//! anything. Each logical node can be given a [`ContainerScript`] describing
//! the output it produces and when it exits, and every call is recorded in an
//! ordered journal so lifecycle ordering can be asserted.

use super::config::{ContainerSpec, ContainerState, LABEL_SESSION};
use super::runtime::ContainerRuntime;
use crate::error::{FlotillaError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// First host port handed out for published container ports
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Scripted behaviour of a simulated container
#[derive(Debug, Clone, Default)]
pub struct ContainerScript {
    /// Output lines and the delay after launch at which each appears
    pub log_lines: Vec<(Duration, String)>,
    /// Exit after a delay with the given code
    pub exit_after: Option<(Duration, i32)>,
    /// Fail the launch with this message
    pub launch_error: Option<String>,
    /// Fail every stop with this message
    pub stop_error: Option<String>,
    /// Fixed host ports for container ports
    pub ports: HashMap<u16, u16>,
    /// Time the launch call takes after the container exists
    pub launch_delay: Duration,
}

impl ContainerScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a line `delay` after launch
    pub fn log(mut self, delay: Duration, line: &str) -> Self {
        self.log_lines.push((delay, line.to_string()));
        self
    }

    /// Exit `delay` after launch
    pub fn exit(mut self, delay: Duration, code: i32) -> Self {
        self.exit_after = Some((delay, code));
        self
    }

    pub fn fail_launch(mut self, message: &str) -> Self {
        self.launch_error = Some(message.to_string());
        self
    }

    pub fn fail_stop(mut self, message: &str) -> Self {
        self.stop_error = Some(message.to_string());
        self
    }

    /// Publish `container_port` on a fixed host port
    pub fn publish(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.insert(container_port, host_port);
        self
    }

    /// Keep the launch call pending for `delay` after the container is created
    pub fn launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }
}

/// Journal entry recorded by the simulated runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    NetworkCreated(String),
    NetworkRemoved(String),
    Launched(String),
    Stopped(String),
}

#[derive(Debug)]
struct SimulatedContainer {
    spec: ContainerSpec,
    script: ContainerScript,
    launched_at: Instant,
    stopped_at: Option<Instant>,
    ports: HashMap<u16, u16>,
}

impl SimulatedContainer {
    /// Key used for scripts and the journal
    fn key(&self) -> String {
        script_key(&self.spec)
    }

    /// Instant output stops, if it has stopped
    fn end(&self) -> Option<Instant> {
        let exited = self
            .script
            .exit_after
            .map(|(delay, _)| self.launched_at + delay);

        match (exited, self.stopped_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn state(&self, now: Instant) -> ContainerState {
        if let Some((delay, code)) = self.script.exit_after {
            if now >= self.launched_at + delay
                && self.stopped_at.map_or(true, |s| s >= self.launched_at + delay)
            {
                return ContainerState::exited(Some(code));
            }
        }

        if self.stopped_at.is_some() {
            return ContainerState::exited(Some(137));
        }

        ContainerState::running()
    }

    fn logs(&self, now: Instant) -> String {
        let horizon = self.end().map_or(now, |end| end.min(now));
        let mut logs = String::new();

        for (delay, line) in &self.script.log_lines {
            if self.launched_at + *delay <= horizon {
                logs.push_str(line);
                logs.push('\n');
            }
        }

        logs
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    containers: HashMap<String, SimulatedContainer>,
    networks: HashMap<String, String>,
    network_sessions: HashMap<String, String>,
    scripts: HashMap<String, ContainerScript>,
    journal: Vec<RuntimeEvent>,
    next_id: u64,
    next_port: u16,
}

/// Container runtime that keeps everything in memory
#[derive(Debug, Clone)]
pub struct SimulatedRuntime {
    state: Arc<RwLock<SimulatedState>>,
    host: String,
}

impl SimulatedRuntime {
    /// Create a new simulated runtime reachable on `127.0.0.1`
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(SimulatedState {
                next_port: FIRST_EPHEMERAL_PORT,
                ..Default::default()
            })),
            host: "127.0.0.1".to_string(),
        }
    }

    /// Script the container launched for `node`
    pub fn script(&self, node: &str, script: ContainerScript) -> Result<()> {
        let mut state = self.state.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        state.scripts.insert(node.to_string(), script);
        Ok(())
    }

    /// Ordered record of every launch, stop and network change
    pub fn journal(&self) -> Result<Vec<RuntimeEvent>> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(state.journal.clone())
    }

    /// Nodes whose containers are still running
    pub fn running(&self) -> Result<Vec<String>> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        let now = Instant::now();
        let mut running: Vec<String> = state.containers.values()
            .filter(|c| c.state(now).is_running())
            .map(|c| c.key())
            .collect();
        running.sort();

        Ok(running)
    }

    /// Spec the most recent container for `node` was launched with
    pub fn launched_spec(&self, node: &str) -> Result<Option<ContainerSpec>> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(state.containers.values()
            .filter(|c| c.key() == node)
            .max_by_key(|c| c.launched_at)
            .map(|c| c.spec.clone()))
    }

    /// Number of networks currently present
    pub fn network_count(&self) -> Result<usize> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(state.networks.len())
    }

    /// Register a container for `spec` and return its id and scripted launch delay
    fn create_container(&self, spec: &ContainerSpec) -> Result<(String, Duration)> {
        let mut state = self.state.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        if let Some(ref network) = spec.network {
            if !state.networks.contains_key(network) {
                return Err(FlotillaError::Runtime(format!("Network {} not found", network)));
            }
        }

        let key = script_key(spec);
        let script = state.scripts.get(&key).cloned().unwrap_or_default();
        if let Some(ref message) = script.launch_error {
            return Err(FlotillaError::Runtime(message.clone()));
        }

        let mut ports = HashMap::new();
        for port in &spec.exposed_ports {
            let host_port = match spec.host_ports.get(port).or_else(|| script.ports.get(port)) {
                Some(fixed) => *fixed,
                None => {
                    let next = state.next_port;
                    state.next_port = state.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
                    next
                }
            };
            ports.insert(*port, host_port);
        }

        let delay = script.launch_delay;
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.containers.insert(id.clone(), SimulatedContainer {
            spec: spec.clone(),
            script,
            launched_at: Instant::now(),
            stopped_at: None,
            ports,
        });
        state.journal.push(RuntimeEvent::Launched(key));

        Ok((id, delay))
    }

    /// Session label of the network called `name`
    pub fn network_session(&self, name: &str) -> Result<Option<String>> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(state.network_sessions.get(name).cloned())
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn script_key(spec: &ContainerSpec) -> String {
    spec.node_name().unwrap_or(&spec.name).to_string()
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn create_network(&self, name: &str, session: &str) -> Result<String> {
        let mut state = self.state.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        if state.networks.values().any(|n| n == name) {
            return Err(FlotillaError::Runtime(format!("Network {} already exists", name)));
        }

        state.next_id += 1;
        let id = format!("net{:08x}", state.next_id);
        state.networks.insert(id.clone(), name.to_string());
        state.network_sessions.insert(name.to_string(), session.to_string());
        state.journal.push(RuntimeEvent::NetworkCreated(name.to_string()));

        Ok(id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        let mut state = self.state.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        let name = state.networks.remove(network_id)
            .ok_or_else(|| FlotillaError::Runtime(format!("Network {} not found", network_id)))?;
        state.network_sessions.remove(&name);
        state.journal.push(RuntimeEvent::NetworkRemoved(name));

        Ok(())
    }

    async fn launch(&self, spec: &ContainerSpec) -> Result<String> {
        let (id, delay) = self.create_container(spec)?;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(id)
    }


    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        state.containers.get(id)
            .map(|c| c.state(Instant::now()))
            .ok_or_else(|| FlotillaError::ContainerNotFound(id.to_string()))
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        state.containers.get(id)
            .map(|c| c.logs(Instant::now()))
            .ok_or_else(|| FlotillaError::ContainerNotFound(id.to_string()))
    }

    async fn mapped_port(&self, id: &str, container_port: u16) -> Result<u16> {
        let state = self.state.read()
            .map_err(|_| FlotillaError::Lock("Failed to acquire read lock".to_string()))?;

        let container = state.containers.get(id)
            .ok_or_else(|| FlotillaError::ContainerNotFound(id.to_string()))?;

        container.ports.get(&container_port).copied().ok_or_else(|| {
            FlotillaError::Runtime(format!(
                "Port {} of container {} is not published",
                container_port, id
            ))
        })
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut state = self.state.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        let container = state.containers.get_mut(id)
            .ok_or_else(|| FlotillaError::ContainerNotFound(id.to_string()))?;

        if let Some(ref message) = container.script.stop_error {
            return Err(FlotillaError::Runtime(message.clone()));
        }

        if container.stopped_at.is_some() {
            return Err(FlotillaError::ContainerNotFound(id.to_string()));
        }

        container.stopped_at = Some(Instant::now());
        let key = container.key();
        state.journal.push(RuntimeEvent::Stopped(key));

        Ok(())
    }

    async fn remove_session(&self, session: &str, keep: &[String]) -> Result<Vec<String>> {
        let mut state = self.state.write()
            .map_err(|_| FlotillaError::Lock("Failed to acquire write lock".to_string()))?;

        let mut leftover: Vec<(Instant, String)> = state.containers.iter()
            .filter(|(id, c)| {
                c.stopped_at.is_none()
                    && c.spec.labels.get(LABEL_SESSION).map(String::as_str) == Some(session)
                    && !keep.contains(*id)
            })
            .map(|(id, c)| (c.launched_at, id.clone()))
            .collect();
        leftover.sort();

        let now = Instant::now();
        let mut removed = Vec::with_capacity(leftover.len());
        for (_, id) in leftover {
            if let Some(container) = state.containers.get_mut(&id) {
                container.stopped_at = Some(now);
                let key = container.key();
                state.journal.push(RuntimeEvent::Stopped(key));
                removed.push(id);
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{ImageRef, LABEL_NODE};

    fn spec(node: &str) -> ContainerSpec {
        ContainerSpec::new(&format!("test-{}", node), ImageRef::new("alpine", "3.5"))
            .label(LABEL_NODE, node)
            .port(8080)
    }

    #[tokio::test]
    async fn test_launch_and_stop_are_journaled() {
        let runtime = SimulatedRuntime::new();
        let id = runtime.launch(&spec("web")).await.unwrap();

        assert!(runtime.inspect(&id).await.unwrap().is_running());
        assert_eq!(runtime.running().unwrap(), vec!["web".to_string()]);

        runtime.stop(&id).await.unwrap();
        assert!(runtime.inspect(&id).await.unwrap().has_exited());
        assert!(matches!(
            runtime.stop(&id).await,
            Err(FlotillaError::ContainerNotFound(_))
        ));

        assert_eq!(
            runtime.journal().unwrap(),
            vec![
                RuntimeEvent::Launched("web".to_string()),
                RuntimeEvent::Stopped("web".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_scripted_logs_and_exit() {
        let runtime = SimulatedRuntime::new();
        runtime.script("job", ContainerScript::new()
            .log(Duration::ZERO, "booting")
            .log(Duration::from_secs(3600), "never seen")
            .exit(Duration::ZERO, 3)).unwrap();

        let id = runtime.launch(&spec("job")).await.unwrap();
        let state = runtime.inspect(&id).await.unwrap();

        assert!(state.has_exited());
        assert_eq!(state.exit_code, Some(3));
        assert_eq!(runtime.logs(&id).await.unwrap(), "booting\n");
    }

    #[tokio::test]
    async fn test_ports_are_mapped() {
        let runtime = SimulatedRuntime::new();
        runtime.script("fixed", ContainerScript::new().publish(8080, 18080)).unwrap();

        let fixed = runtime.launch(&spec("fixed")).await.unwrap();
        let random = runtime.launch(&spec("random")).await.unwrap();

        assert_eq!(runtime.mapped_port(&fixed, 8080).await.unwrap(), 18080);
        assert_eq!(runtime.mapped_port(&random, 8080).await.unwrap(), FIRST_EPHEMERAL_PORT);
        assert!(runtime.mapped_port(&random, 9999).await.is_err());
    }

    #[tokio::test]
    async fn test_launch_requires_known_network() {
        let runtime = SimulatedRuntime::new();
        let result = runtime.launch(&spec("web").network("missing", "web")).await;
        assert!(result.is_err());

        let net = runtime.create_network("fabric", "s1").await.unwrap();
        runtime.launch(&spec("web").network(&net, "web")).await.unwrap();
        assert_eq!(runtime.network_count().unwrap(), 1);
        assert_eq!(runtime.network_session("fabric").unwrap().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_spec_host_ports_win_over_script() {
        let runtime = SimulatedRuntime::new();
        runtime.script("broker", ContainerScript::new().publish(9093, 18093)).unwrap();

        let id = runtime.launch(&spec("broker").publish(9093, 40123)).await.unwrap();
        assert_eq!(runtime.mapped_port(&id, 9093).await.unwrap(), 40123);
    }

    #[tokio::test]
    async fn test_remove_session_spares_kept_and_foreign() {
        let runtime = SimulatedRuntime::new();
        let kept = runtime.launch(&spec("kept").label(LABEL_SESSION, "s1")).await.unwrap();
        let lost = runtime.launch(&spec("lost").label(LABEL_SESSION, "s1")).await.unwrap();
        runtime.launch(&spec("other").label(LABEL_SESSION, "s2")).await.unwrap();

        let removed = runtime.remove_session("s1", &[kept]).await.unwrap();
        assert_eq!(removed, vec![lost]);
        assert_eq!(runtime.running().unwrap(), vec!["kept".to_string(), "other".to_string()]);

        assert_eq!(runtime.remove_session("s1", &[]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_launch_delay_registers_container_first() {
        let runtime = SimulatedRuntime::new();
        runtime.script("slow", ContainerScript::new().launch_delay(Duration::from_secs(5))).unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), runtime.launch(&spec("slow"))).await;
        assert!(pending.is_err());
        assert_eq!(runtime.running().unwrap(), vec!["slow".to_string()]);
    }
}
