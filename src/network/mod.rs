//! Network fabric module
//!
//! This module provides the virtual network joining cluster nodes and the
//! address types used to reach them from inside or outside that network.

pub mod config;
pub mod fabric;

pub use config::{ExternalAddress, InternalAddress, ServiceEndpoint, Vantage};
pub use fabric::NetworkFabric;
