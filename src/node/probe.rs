//! Readiness probes
//!
//! A started container is not necessarily usable. A [`ReadinessProbe`] polls
//! a launched container through a [`ReadinessCheck`] until the check is
//! satisfied, the container exits, or the startup timeout elapses, and
//! resolves exactly once to `Ready` or `Failed`.

use crate::container::ContainerRuntime;
use crate::error::{FlotillaError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Poll interval for HTTP probes
pub const DEFAULT_HTTP_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval for log and process probes
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_millis(100);

/// How readiness of a node is judged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReadinessPolicy {
    /// Output matches a regular expression `times` times
    LogPattern {
        pattern: String,
        #[serde(default = "default_times")]
        times: usize,
    },
    /// `GET path` returns `status`
    HttpStatus {
        path: String,
        /// Container port, the node's published port when unset
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
    },
    /// The process is running
    Running,
}

fn default_times() -> usize {
    1
}

fn default_status() -> u16 {
    200
}

fn default_interval_ms() -> u64 {
    DEFAULT_HTTP_INTERVAL.as_millis() as u64
}

impl ReadinessPolicy {
    pub fn log_pattern(pattern: &str) -> Self {
        ReadinessPolicy::LogPattern {
            pattern: pattern.to_string(),
            times: 1,
        }
    }

    pub fn http_status(path: &str, status: u16) -> Self {
        ReadinessPolicy::HttpStatus {
            path: path.to_string(),
            port: None,
            status,
            interval_ms: default_interval_ms(),
        }
    }

    /// Same policy polled at a different interval (HTTP only)
    pub fn with_interval(self, interval: Duration) -> Self {
        match self {
            ReadinessPolicy::HttpStatus { path, port, status, .. } => ReadinessPolicy::HttpStatus {
                path,
                port,
                status,
                interval_ms: interval.as_millis() as u64,
            },
            other => other,
        }
    }
}

impl std::fmt::Display for ReadinessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessPolicy::LogPattern { pattern, times: 1 } => write!(f, "log /{}/", pattern),
            ReadinessPolicy::LogPattern { pattern, times } => write!(f, "log /{}/ x{}", pattern, times),
            ReadinessPolicy::HttpStatus { path, status, .. } => write!(f, "GET {} -> {}", path, status),
            ReadinessPolicy::Running => write!(f, "running"),
        }
    }
}

/// Probe state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    Pending,
    Probing,
    Ready,
    Failed(String),
}

impl ProbeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProbeState::Ready | ProbeState::Failed(_))
    }
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeState::Pending => write!(f, "pending"),
            ProbeState::Probing => write!(f, "probing"),
            ProbeState::Ready => write!(f, "ready"),
            ProbeState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Result of one readiness observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Ready
    Satisfied,
    /// Not ready yet, with what was seen
    Waiting(String),
    /// The process is gone
    Exited(Option<i32>),
}

/// Container being probed
pub struct ProbeTarget<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub container_id: &'a str,
}

/// Single readiness observation strategy
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Human readable description for logs
    fn describe(&self) -> String;

    /// Delay between observations
    fn interval(&self) -> Duration;

    /// Observe the target once
    async fn observe(&mut self, target: &ProbeTarget<'_>) -> Result<Observation>;
}

/// Matches container output against a regular expression
pub struct LogPatternProbe {
    pattern: Regex,
    times: usize,
    /// Output already scanned, up to the last complete line
    scanned: String,
    matches: usize,
}

impl LogPatternProbe {
    pub fn new(pattern: &str, times: usize) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            times: times.max(1),
            scanned: String::new(),
            matches: 0,
        })
    }

    /// Scan complete lines not seen before; returns whether enough matched.
    ///
    /// When `closed` is set the trailing partial line is scanned too.
    fn scan(&mut self, logs: &str, closed: bool) -> bool {
        // Output that no longer extends what was scanned is rescanned whole
        let fresh = match logs.strip_prefix(self.scanned.as_str()) {
            Some(fresh) => fresh,
            None => {
                self.scanned.clear();
                self.matches = 0;
                logs
            }
        };

        let complete = if closed {
            fresh.len()
        } else {
            fresh.rfind('\n').map_or(0, |i| i + 1)
        };

        self.matches += fresh[..complete]
            .lines()
            .filter(|line| self.pattern.is_match(line))
            .count();
        self.scanned.push_str(&fresh[..complete]);

        self.matches >= self.times
    }
}

#[async_trait]
impl ReadinessCheck for LogPatternProbe {
    fn describe(&self) -> String {
        format!("log pattern /{}/ x{}", self.pattern, self.times)
    }

    fn interval(&self) -> Duration {
        DEFAULT_LOG_INTERVAL
    }

    async fn observe(&mut self, target: &ProbeTarget<'_>) -> Result<Observation> {
        let state = target.runtime.inspect(target.container_id).await?;
        let logs = target.runtime.logs(target.container_id).await?;

        if self.scan(&logs, state.has_exited()) {
            return Ok(Observation::Satisfied);
        }

        if state.has_exited() {
            return Ok(Observation::Exited(state.exit_code));
        }

        Ok(Observation::Waiting(format!(
            "{} of {} matching lines",
            self.matches, self.times
        )))
    }
}

/// Polls an HTTP path until it answers with the expected status
pub struct HttpStatusProbe {
    client: reqwest::Client,
    path: String,
    port: u16,
    status: u16,
    interval: Duration,
}

impl HttpStatusProbe {
    pub fn new(path: &str, port: u16, status: u16, interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .build()?;

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Ok(Self {
            client,
            path,
            port,
            status,
            interval,
        })
    }
}

#[async_trait]
impl ReadinessCheck for HttpStatusProbe {
    fn describe(&self) -> String {
        format!("HTTP {} on port {} -> {}", self.path, self.port, self.status)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn observe(&mut self, target: &ProbeTarget<'_>) -> Result<Observation> {
        let state = target.runtime.inspect(target.container_id).await?;
        if state.has_exited() {
            return Ok(Observation::Exited(state.exit_code));
        }

        let mapped = match target.runtime.mapped_port(target.container_id, self.port).await {
            Ok(port) => port,
            Err(FlotillaError::ContainerNotFound(id)) => {
                return Err(FlotillaError::ContainerNotFound(id))
            }
            Err(e) => return Ok(Observation::Waiting(e.to_string())),
        };

        let url = format!("http://{}:{}{}", target.runtime.host(), mapped, self.path);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().as_u16() == self.status => Ok(Observation::Satisfied),
            Ok(response) => Ok(Observation::Waiting(format!(
                "{} returned {}",
                url,
                response.status().as_u16()
            ))),
            Err(e) => Ok(Observation::Waiting(format!("{}: {}", url, e))),
        }
    }
}

/// Ready as soon as the process is running
pub struct RunningProbe;

#[async_trait]
impl ReadinessCheck for RunningProbe {
    fn describe(&self) -> String {
        "process running".to_string()
    }

    fn interval(&self) -> Duration {
        DEFAULT_LOG_INTERVAL
    }

    async fn observe(&mut self, target: &ProbeTarget<'_>) -> Result<Observation> {
        let state = target.runtime.inspect(target.container_id).await?;
        if state.is_running() {
            Ok(Observation::Satisfied)
        } else if state.has_exited() {
            Ok(Observation::Exited(state.exit_code))
        } else {
            Ok(Observation::Waiting(format!("container is {}", state.status)))
        }
    }
}

/// Drives a readiness check to a terminal state under a hard timeout
pub struct ReadinessProbe {
    check: Box<dyn ReadinessCheck>,
    state: ProbeState,
    timeout: Duration,
    /// Most recent non-terminal observation
    last: Option<String>,
}

impl ReadinessProbe {
    pub fn new(check: Box<dyn ReadinessCheck>, timeout: Duration) -> Self {
        Self {
            check,
            state: ProbeState::Pending,
            timeout,
            last: None,
        }
    }

    /// Build the probe for a policy; `default_port` serves HTTP policies without a port
    pub fn from_policy(policy: &ReadinessPolicy, default_port: u16, timeout: Duration) -> Result<Self> {
        let check: Box<dyn ReadinessCheck> = match policy {
            ReadinessPolicy::LogPattern { pattern, times } => {
                Box::new(LogPatternProbe::new(pattern, *times)?)
            }
            ReadinessPolicy::HttpStatus { path, port, status, interval_ms } => {
                let port = port.unwrap_or(default_port);
                if port == 0 {
                    return Err(FlotillaError::InvalidConfig(format!(
                        "HTTP readiness on {} needs a port",
                        path
                    )));
                }
                Box::new(HttpStatusProbe::new(
                    path,
                    port,
                    *status,
                    Duration::from_millis(*interval_ms),
                )?)
            }
            ReadinessPolicy::Running => Box::new(RunningProbe),
        };

        Ok(Self::new(check, timeout))
    }

    pub fn state(&self) -> &ProbeState {
        &self.state
    }

    pub fn describe(&self) -> String {
        self.check.describe()
    }

    /// Wait until the target is ready
    ///
    /// Fails with `StartupTimeout` when the timeout elapses first and with
    /// `ProcessExit` when the container goes away before becoming ready.
    pub async fn wait(&mut self, node: &str, target: &ProbeTarget<'_>) -> Result<()> {
        if self.state.is_terminal() {
            return match &self.state {
                ProbeState::Ready => Ok(()),
                _ => Err(FlotillaError::InvalidConfig(format!(
                    "Readiness probe for {} already resolved",
                    node
                ))),
            };
        }

        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.poll(node, target)).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.state = ProbeState::Failed(format!("timed out after {:?}", timeout));
                Err(FlotillaError::StartupTimeout {
                    node: node.to_string(),
                    timeout,
                    last: self.last.clone(),
                })
            }
        }
    }

    async fn poll(&mut self, node: &str, target: &ProbeTarget<'_>) -> Result<()> {
        loop {
            if self.state == ProbeState::Pending {
                match target.runtime.inspect(target.container_id).await {
                    Ok(state) if state.is_running() => {
                        debug!("Probing {} with {}", node, self.check.describe());
                        self.state = ProbeState::Probing;
                    }
                    Ok(state) if state.has_exited() => {
                        return Err(self.exited(node, state.exit_code));
                    }
                    Ok(state) => self.last = Some(format!("container is {}", state.status)),
                    Err(FlotillaError::ContainerNotFound(_)) => return Err(self.exited(node, None)),
                    Err(e) => self.last = Some(e.to_string()),
                }
            }

            if self.state == ProbeState::Probing {
                match self.check.observe(target).await {
                    Ok(Observation::Satisfied) => {
                        info!("{} is ready", node);
                        self.state = ProbeState::Ready;
                        return Ok(());
                    }
                    Ok(Observation::Waiting(detail)) => {
                        debug!("{} not ready: {}", node, detail);
                        self.last = Some(detail);
                    }
                    Ok(Observation::Exited(code)) => return Err(self.exited(node, code)),
                    Err(FlotillaError::ContainerNotFound(_)) => return Err(self.exited(node, None)),
                    Err(e) => self.last = Some(e.to_string()),
                }
            }

            tokio::time::sleep(self.check.interval()).await;
        }
    }

    fn exited(&mut self, node: &str, code: Option<i32>) -> FlotillaError {
        self.state = ProbeState::Failed("process exited".to_string());
        FlotillaError::ProcessExit {
            node: node.to_string(),
            code,
        }
    }
}
