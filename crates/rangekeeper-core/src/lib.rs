//! rangekeeper-core — container pool orchestration and command gating
//!
//! Core library for the cyber-range sandbox: a whitelist-first command
//! validator, a security monitor with rate limiting and breakout detection,
//! a tiered container pool over a pluggable engine, isolated network
//! segments, and the execution gateway that ties them together.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod network;
pub mod pool;
pub mod security;
pub mod validator;

pub use config::OrchestratorConfig;
pub use engine::{ContainerEngine, DockerEngine, ExecOutput};
pub use error::SandboxError;
pub use gateway::{CommandRequest, ExecutionGateway, ExecutionResult};
pub use lifecycle::{ContainerInstance, ContainerStatus, PoolTier};
pub use network::NetworkManager;
pub use pool::{Lease, PoolManager, ReadinessReport};
pub use security::{SecurityMonitor, SecurityReport};
pub use validator::{CommandValidator, ValidationVerdict};
