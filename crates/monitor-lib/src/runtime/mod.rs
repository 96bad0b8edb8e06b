//! Container runtime access
//!
//! The pipeline reads containers through the `ContainerRuntime` trait so the
//! pollers and tests stay independent of any one engine. The shipped
//! implementation talks to the Docker Engine HTTP API.

mod docker;

pub use docker::{DockerConfig, DockerRuntime};

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::ContainerLifecycle;

pub use async_trait::async_trait;

/// A container as listed by the runtime, before name matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
}

/// Cumulative CPU counters from one reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub total_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
}

/// Memory usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub usage: u64,
    pub limit: u64,
}

/// Per-interface network byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One stats reading
///
/// The runtime reports the current and the previous CPU counters together
/// in a single response, so CPU rate math needs no cross-cycle cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub cpu: CpuCounters,
    pub precpu: CpuCounters,
    pub memory: MemoryCounters,
    pub networks: HashMap<String, NetworkCounters>,
}

/// Trait for container runtime implementations
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List currently running containers
    async fn list_running(&self) -> Result<Vec<RuntimeContainer>>;

    /// Sample resource counters for one container
    async fn sample_stats(&self, container_id: &str) -> Result<StatsSample>;

    /// Subscribe to container start/stop/die events
    ///
    /// The backing stream task keeps the channel fed (reconnecting as
    /// needed) until the receiver is dropped.
    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<ContainerLifecycle>>;
}
