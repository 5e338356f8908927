//! Flotilla - ephemeral multi-container clusters for integration tests
//!
//! Flotilla composes dependent service containers (a message broker, a
//! schema registry, a SQL-on-streams server, or any other image) into a
//! cluster on a private network and drives its lifecycle:
//!
//! - Dependency graph with deterministic start and stop order
//! - Profiles carrying per-service defaults and dependency wiring
//! - Log pattern and HTTP readiness probes with hard timeouts
//! - Sequential or parallel startup with reverse teardown on failure
//! - Optional reuse of identical running nodes
//! - YAML cluster manifests

pub mod cluster;
pub mod container;
pub mod error;
pub mod network;
pub mod node;
pub mod settings;

pub use cluster::{ClusterGraph, ClusterOrchestrator, ClusterState, StartMode};
pub use error::{FlotillaError, Result};
pub use network::{NetworkFabric, ServiceEndpoint};
pub use node::{ProfileKind, ReadinessPolicy, ServiceNode};
pub use settings::Settings;
