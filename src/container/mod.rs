//! Container runtime module
//!
//! This module describes the containers a cluster is made of and the
//! runtimes that launch them: the Docker command line client for real
//! clusters and an in-memory engine for exercising orchestration logic.

pub mod config;
pub mod lifecycle;
pub mod runtime;

pub use config::{ContainerSpec, ContainerState, ContainerStatus, ImageRef};
pub use lifecycle::{ContainerScript, RuntimeEvent, SimulatedRuntime};
pub use runtime::{ContainerRuntime, DockerRuntime};
