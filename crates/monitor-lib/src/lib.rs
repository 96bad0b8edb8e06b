//! Core library for the platform monitoring agent
//!
//! This crate provides the observability pipeline for tenant containers:
//! - Container discovery and name-based tenant/service matching
//! - Scheduled health polling with a per-container state machine
//! - Scheduled metrics sampling into bounded ring buffers
//! - Rule-based alerting with duration gating and cooldowns
//! - Webhook notification delivery with destination vetting
//! - An authenticated realtime WebSocket gateway

pub mod alert;
pub mod bus;
pub mod collector;
pub mod gateway;
pub mod health;
pub mod healthcheck;
pub mod matcher;
pub mod models;
pub mod notify;
pub mod observability;
pub mod runtime;

pub use bus::{Event, EventBus};
pub use health::{AgentHealth, HealthSnapshot, ReadinessSnapshot, TaskHealth, TaskStatus};
pub use matcher::{ContainerIdentity, ContainerMatcher};
pub use models::*;
pub use observability::AgentMetrics;
