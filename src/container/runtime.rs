//! Container runtime seam and the Docker CLI backend

use super::config::{ContainerSpec, ContainerState, ContainerStatus, LABEL_SESSION};
use crate::error::{FlotillaError, Result};
use crate::settings::Settings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Engine that can launch and observe containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a network labelled with `session` and return its identifier
    async fn create_network(&self, name: &str, session: &str) -> Result<String>;

    /// Remove a network created by `create_network`
    async fn remove_network(&self, network_id: &str) -> Result<()>;

    /// Launch a container in the background and return its identifier
    async fn launch(&self, spec: &ContainerSpec) -> Result<String>;

    /// Observe the current state of a container
    async fn inspect(&self, id: &str) -> Result<ContainerState>;

    /// Combined stdout/stderr output produced so far
    ///
    /// Output only ever grows: an earlier result is a prefix of every later
    /// one for the same container.
    async fn logs(&self, id: &str) -> Result<String>;

    /// Host port a published container port is reachable on
    async fn mapped_port(&self, id: &str, container_port: u16) -> Result<u16>;

    /// Host name published ports are reachable on
    fn host(&self) -> String;

    /// Terminate and remove a container
    async fn stop(&self, id: &str) -> Result<()>;

    /// Remove every container labelled with `session` except those in `keep`
    ///
    /// Returns the identifiers of the removed containers.
    async fn remove_session(&self, session: &str, keep: &[String]) -> Result<Vec<String>>;
}

/// Runtime backed by the `docker` command line client
pub struct DockerRuntime {
    /// Path to the docker binary
    binary: PathBuf,
    /// Host published ports are reachable on
    host: String,
}

impl DockerRuntime {
    /// Create a new runtime using the given binary and host
    pub fn new(binary: impl Into<PathBuf>, host: &str) -> Self {
        Self {
            binary: binary.into(),
            host: host.to_string(),
        }
    }

    /// Create a runtime from loaded settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.docker_binary.clone(), &settings.host)
    }

    /// Run a docker command and return its trimmed stdout
    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!("{} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                FlotillaError::Runtime(format!(
                    "Failed to run {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such container") {
                return Err(FlotillaError::ContainerNotFound(stderr));
            }
            return Err(FlotillaError::Runtime(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(&self, name: &str, session: &str) -> Result<String> {
        self.docker(&[
            "network".to_string(),
            "create".to_string(),
            "--label".to_string(),
            format!("{}={}", LABEL_SESSION, session),
            name.to_string(),
        ])
        .await
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.docker(&["network".to_string(), "rm".to_string(), network_id.to_string()])
            .await?;
        Ok(())
    }

    async fn launch(&self, spec: &ContainerSpec) -> Result<String> {
        self.docker(&run_args(spec)).await
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let output = self
            .docker(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}} {{.State.ExitCode}}".to_string(),
                id.to_string(),
            ])
            .await?;

        parse_inspect_output(&output)
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(["logs", "--timestamps", id])
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(FlotillaError::ContainerNotFound(id.to_string()));
        }

        Ok(merge_timestamped(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn mapped_port(&self, id: &str, container_port: u16) -> Result<u16> {
        let output = self
            .docker(&[
                "port".to_string(),
                id.to_string(),
                format!("{}/tcp", container_port),
            ])
            .await?;

        parse_port_output(&output).ok_or_else(|| {
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
        self.docker(&["rm".to_string(), "-f".to_string(), "-v".to_string(), id.to_string()])
            .await?;
        Ok(())
    }

    async fn remove_session(&self, session: &str, keep: &[String]) -> Result<Vec<String>> {
        let listed = self
            .docker(&[
                "ps".to_string(),
                "-aq".to_string(),
                "--no-trunc".to_string(),
                "--filter".to_string(),
                format!("label={}={}", LABEL_SESSION, session),
            ])
            .await?;

        let leftover = leftover_ids(&listed, keep);
        if leftover.is_empty() {
            return Ok(leftover);
        }

        let mut args = vec!["rm".to_string(), "-f".to_string(), "-v".to_string()];
        args.extend(leftover.iter().cloned());
        self.docker(&args).await?;

        Ok(leftover)
    }
}

/// Arguments for `docker run` that launch `spec` detached
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if let Some(ref network) = spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
        for alias in &spec.aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for port in &spec.exposed_ports {
        args.push("-p".to_string());
        match spec.host_ports.get(port) {
            Some(host_port) => args.push(format!("{}:{}", host_port, port)),
            None => args.push(port.to_string()),
        }
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.to_string());
    args.extend(spec.cmd.iter().cloned());
    args
}

/// Interleave the stdout and stderr of `docker logs --timestamps` by time
///
/// The timestamps are stripped. A line without one keeps the time of the
/// line before it in the same stream, and ties go to stdout.
fn merge_timestamped(stdout: &str, stderr: &str) -> String {
    let out = timestamped_lines(stdout);
    let err = timestamped_lines(stderr);
    let (mut i, mut j) = (0, 0);
    let mut merged = String::with_capacity(stdout.len() + stderr.len());

    while i < out.len() || j < err.len() {
        let line = if j >= err.len() || (i < out.len() && out[i].0 <= err[j].0) {
            i += 1;
            out[i - 1].1
        } else {
            j += 1;
            err[j - 1].1
        };
        merged.push_str(line);
        merged.push('\n');
    }

    merged
}

fn timestamped_lines(output: &str) -> Vec<(Option<DateTime<Utc>>, &str)> {
    let mut last = None;

    output
        .lines()
        .map(|line| {
            let parsed = line.split_once(' ').and_then(|(stamp, rest)| {
                DateTime::parse_from_rfc3339(stamp)
                    .ok()
                    .map(|t| (t.with_timezone(&Utc), rest))
            });

            match parsed {
                Some((time, rest)) => {
                    last = Some(time);
                    (last, rest)
                }
                None => (last, line),
            }
        })
        .collect()
}

/// Container ids listed by `docker ps -q` that are not in `keep`
fn leftover_ids(listed: &str, keep: &[String]) -> Vec<String> {
    listed
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty() && !keep.iter().any(|k| k == id))
        .map(str::to_string)
        .collect()
}

/// Parse `docker port` output such as `0.0.0.0:49153\n[::]:49153`
fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse().ok())
}

/// Parse `{{.State.Status}} {{.State.ExitCode}}`
fn parse_inspect_output(output: &str) -> Result<ContainerState> {
    let mut parts = output.split_whitespace();
    let status = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|c| c.parse().ok());

    let status = match status {
        "created" => ContainerStatus::Created,
        "running" | "restarting" | "paused" => ContainerStatus::Running,
        "exited" | "dead" | "removing" => ContainerStatus::Exited,
        other => {
            return Err(FlotillaError::Runtime(format!(
                "Unknown container status: {}",
                other
            )))
        }
    };

    Ok(ContainerState {
        status,
        exit_code: if status == ContainerStatus::Exited { code } else { None },
    })
}
