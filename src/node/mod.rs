//! Cluster nodes: profiles, readiness probes and the service node lifecycle

pub mod probe;
pub mod profile;
pub mod service;

pub use probe::{ProbeState, ReadinessPolicy, ReadinessProbe};
pub use profile::{BindingSource, ConfigValue, DependencyBinding, ProfileKind, ServiceProfile};
pub use service::{NodeState, ResolvedDependency, ServiceNode, StartContext};
