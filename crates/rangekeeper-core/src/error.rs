//! Error taxonomy for the sandbox subsystem

use thiserror::Error;

use crate::validator::RejectReason;

/// Every way a sandbox request can fail, with its HTTP mapping.
///
/// `ValidationRejected` is safe to retry with corrected input but is never
/// retried automatically. `RateLimited` is transient. `SecurityBlocked` is
/// terminal until an explicit unblock. Startup failures are retried
/// internally by the pool before surfacing here.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("command rejected ({reason}): {detail}")]
    ValidationRejected { reason: RejectReason, detail: String },

    #[error("rate limit exceeded for user '{user}'")]
    RateLimited { user: String },

    #[error("user '{user}' is blocked: {cause}")]
    SecurityBlocked { user: String, cause: String },

    #[error("container '{container}' is unhealthy")]
    ContainerUnhealthy { container: String },

    #[error("failed to start container from template '{template}' after {attempts} attempts: {detail}")]
    StartupFailed {
        template: String,
        attempts: u32,
        detail: String,
    },

    #[error("execution timed out after {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64 },

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("container '{container}' is mid-execution")]
    Busy { container: String },

    #[error("no such resource: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// HTTP status the gateway maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationRejected { .. } => 400,
            Self::RateLimited { .. } | Self::SecurityBlocked { .. } => 403,
            Self::NotFound(_) => 404,
            Self::Busy { .. } => 409,
            Self::ExecutionTimeout { .. } => 504,
            Self::ContainerUnhealthy { .. }
            | Self::StartupFailed { .. }
            | Self::EngineUnavailable(_) => 503,
            Self::Config(_) => 500,
        }
    }

    /// Stable machine-readable code for API clients and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::RateLimited { .. } => "rate_limited",
            Self::SecurityBlocked { .. } => "security_blocked",
            Self::ContainerUnhealthy { .. } => "container_unhealthy",
            Self::StartupFailed { .. } => "startup_failed",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::EngineUnavailable(_) => "engine_unavailable",
            Self::Busy { .. } => "busy",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config_error",
        }
    }
}
