//! Error types for Flotilla

use std::time::Duration;
use thiserror::Error;

/// Result type for Flotilla operations
pub type Result<T> = std::result::Result<T, FlotillaError>;

/// Flotilla error types
#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Alias {alias} is already taken on network {fabric}")]
    AliasConflict { alias: String, fabric: String },

    #[error("Node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: String, dependency: String },

    #[error("Node already registered: {0}")]
    NodeExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("{0} has already been started")]
    AlreadyStarted(String),

    #[error("Node {node} did not become ready within {timeout:?}{}", last_observation(.last))]
    StartupTimeout {
        node: String,
        timeout: Duration,
        last: Option<String>,
    },

    #[error("Node {node} exited before becoming ready (exit code {})", exit_code(.code))]
    ProcessExit { node: String, code: Option<i32> },

    #[error("Cluster startup was cancelled")]
    Cancelled,

    #[error("Cluster startup failed: {source} ({} teardown error(s))", .teardown.len())]
    StartupFailed {
        #[source]
        source: Box<FlotillaError>,
        teardown: Vec<FlotillaError>,
    },

    #[error("Failed to stop {node}: {reason}")]
    Teardown { node: String, reason: String },

    #[error("Cluster teardown finished with {} error(s)", .0.len())]
    TeardownFailed(Vec<FlotillaError>),

    #[error("Cluster is not running: {0}")]
    NotRunning(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl FlotillaError {
    /// The failure that triggered a startup abort, or `self` otherwise.
    pub fn root(&self) -> &FlotillaError {
        match self {
            FlotillaError::StartupFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Secondary errors collected while cleaning up after a failed start.
    pub fn teardown_errors(&self) -> &[FlotillaError] {
        match self {
            FlotillaError::StartupFailed { teardown, .. } => teardown,
            FlotillaError::TeardownFailed(errors) => errors,
            _ => &[],
        }
    }

    /// Whether this error was raised before anything was launched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlotillaError::InvalidConfig(_)
                | FlotillaError::AliasConflict { .. }
                | FlotillaError::UnknownDependency { .. }
                | FlotillaError::NodeExists(_)
                | FlotillaError::Cycle(_)
                | FlotillaError::Regex(_)
        )
    }
}

impl From<serde_yaml::Error> for FlotillaError {
    fn from(err: serde_yaml::Error) -> Self {
        FlotillaError::Yaml(err.to_string())
    }
}

fn last_observation(last: &Option<String>) -> String {
    match last {
        Some(detail) => format!(" (last observation: {})", detail),
        None => String::new(),
    }
}

fn exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_startup_failure() {
        let err = FlotillaError::StartupFailed {
            source: Box::new(FlotillaError::ProcessExit {
                node: "broker".to_string(),
                code: Some(1),
            }),
            teardown: vec![FlotillaError::Teardown {
                node: "broker".to_string(),
                reason: "gone".to_string(),
            }],
        };

        assert!(matches!(err.root(), FlotillaError::ProcessExit { .. }));
        assert_eq!(err.teardown_errors().len(), 1);
        assert!(err.to_string().contains("1 teardown error"));
    }

    #[test]
    fn test_timeout_message_includes_last_observation() {
        let err = FlotillaError::StartupTimeout {
            node: "schema-registry".to_string(),
            timeout: Duration::from_secs(30),
            last: Some("status 503".to_string()),
        };

        let message = err.to_string();
        assert!(message.contains("schema-registry"));
        assert!(message.contains("status 503"));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(FlotillaError::Cycle(vec!["a".into(), "a".into()]).is_configuration());
        assert!(!FlotillaError::Cancelled.is_configuration());
    }
}
