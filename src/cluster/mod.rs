//! Cluster composition: dependency graph, orchestration, reuse and manifests

pub mod graph;
pub mod manifest;
pub mod orchestrator;
pub mod reuse;

pub use graph::ClusterGraph;
pub use manifest::{ClusterManifest, ManifestParser, ServiceManifest};
pub use orchestrator::{ClusterOrchestrator, ClusterState, StartMode};
pub use reuse::{Fingerprint, ReuseLookup, ReuseRegistry};
