//! Execution gateway — the single path a command takes into a container
//!
//! Checks run strictly in order: active block, breakout screening, command
//! validation, rate limiting, pool acquisition, execution. Breakout
//! screening runs before validation so an escape attempt is recorded as
//! such rather than as an unknown tool. Every request is audited exactly
//! once, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::engine::ContainerEngine;
use crate::error::SandboxError;
use crate::pool::PoolManager;
use crate::security::{EventCategory, SecurityEvent, SecurityMonitor};
use crate::validator::{CommandValidator, RejectReason, ValidationContext, ValidationVerdict};

/// One command submission.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Scenario profile; falls back to the configured default.
    #[serde(default)]
    pub profile: Option<String>,
    /// Per-request timeout override, capped by the configured limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Outcome of an allowed, executed command.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub container: String,
    pub template: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub verdict: ValidationVerdict,
}

/// Front door for command execution. Owns the validator, the security
/// monitor, and the pool, and wires configuration reloads through all
/// three.
pub struct ExecutionGateway {
    pool: Arc<PoolManager>,
    monitor: Arc<SecurityMonitor>,
    validator: RwLock<Arc<CommandValidator>>,
    config: RwLock<Arc<OrchestratorConfig>>,
    engine: Arc<dyn ContainerEngine>,
}

impl ExecutionGateway {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        pool: Arc<PoolManager>,
        config: OrchestratorConfig,
    ) -> Self {
        let monitor = Arc::new(SecurityMonitor::new(
            config.security.clone(),
            &config.rules.breakout,
        ));
        let validator = RwLock::new(Arc::new(CommandValidator::new(&config.rules)));
        Self {
            pool,
            monitor,
            validator,
            config: RwLock::new(Arc::new(config)),
            engine,
        }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<SecurityMonitor> {
        &self.monitor
    }

    pub async fn config(&self) -> Arc<OrchestratorConfig> {
        self.config.read().await.clone()
    }

    /// Swap in a new configuration: rule tables, security settings, and
    /// pool policy all reload; running containers are untouched.
    pub async fn reload_config(&self, config: OrchestratorConfig) {
        *self.validator.write().await = Arc::new(CommandValidator::new(&config.rules));
        self.monitor
            .reload(config.security.clone(), &config.rules.breakout)
            .await;
        self.pool.reload(&config).await;
        *self.config.write().await = Arc::new(config);
        info!("Gateway configuration reloaded");
    }

    /// Validate a command without executing it. Blocked users are rejected
    /// and breakout signatures produce a rejecting verdict, but a dry run
    /// never blocks the user and is not audited.
    pub async fn validate_only(
        &self,
        request: &CommandRequest,
    ) -> Result<ValidationVerdict, SandboxError> {
        if let Some(cause) = self.monitor.check_blocked(&request.user_id) {
            return Err(SandboxError::SecurityBlocked {
                user: request.user_id.clone(),
                cause,
            });
        }
        if let Some(signature) = self.monitor.match_breakout(&request.command).await {
            return Ok(ValidationVerdict::reject(
                RejectReason::BlockedPattern,
                signature.clone(),
                format!("container breakout signature '{}'", signature),
            ));
        }
        let ctx = ValidationContext {
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
        };
        let validator = self.validator.read().await.clone();
        Ok(validator.validate(&request.command, &ctx))
    }

    /// Run one command through the full gate sequence.
    pub async fn execute(
        &self,
        request: &CommandRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        if let Some(cause) = self.monitor.check_blocked(&request.user_id) {
            warn!(
                "Rejected command from blocked user '{}' ({})",
                request.user_id, cause
            );
            self.audit(
                request,
                false,
                EventCategory::Normal,
                Some(format!("user blocked: {}", cause)),
            )
            .await;
            return Err(SandboxError::SecurityBlocked {
                user: request.user_id.clone(),
                cause,
            });
        }

        if let Some(signature) = self
            .monitor
            .screen_breakout(&request.user_id, &request.command)
            .await
        {
            self.audit(
                request,
                false,
                EventCategory::BreakoutAttempt,
                Some(format!("matched signature '{}'", signature)),
            )
            .await;
            return Err(SandboxError::SecurityBlocked {
                user: request.user_id.clone(),
                cause: format!("container breakout attempt ({})", signature),
            });
        }

        let ctx = ValidationContext {
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
        };
        let validator = self.validator.read().await.clone();
        let verdict = validator.validate(&request.command, &ctx);
        if !verdict.allowed {
            let reason = verdict.reason.unwrap_or(RejectReason::UnknownTool);
            let detail = verdict.detail.unwrap_or_default();
            self.audit(
                request,
                false,
                EventCategory::Normal,
                Some(format!("{}: {}", reason, detail)),
            )
            .await;
            return Err(SandboxError::ValidationRejected { reason, detail });
        }

        if !self.monitor.check_rate(&request.user_id).await {
            self.audit(
                request,
                false,
                EventCategory::RateLimited,
                Some("sliding-window rate limit exceeded".to_string()),
            )
            .await;
            return Err(SandboxError::RateLimited {
                user: request.user_id.clone(),
            });
        }

        let (profile, timeout, max_output_bytes) = {
            let config = self.config.read().await;
            let profile = request
                .profile
                .clone()
                .unwrap_or_else(|| config.default_profile.clone());
            let cap = config.limits.exec_timeout_secs;
            let timeout_secs = request.timeout_secs.unwrap_or(cap).min(cap);
            (
                profile,
                Duration::from_secs(timeout_secs),
                config.limits.max_output_bytes,
            )
        };

        let lease = match self
            .pool
            .acquire(&profile, request.session_id.as_deref())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                self.audit(
                    request,
                    false,
                    EventCategory::Normal,
                    Some(format!("container acquisition failed: {}", e)),
                )
                .await;
                return Err(e);
            }
        };

        let parsed = verdict
            .command
            .as_ref()
            .ok_or_else(|| SandboxError::Config("allowed verdict without parsed command".into()))?;
        let argv = parsed.argv();
        info!(
            "Executing '{}' for user '{}' in container '{}'",
            parsed.tool, request.user_id, lease.container_name
        );

        let output = self
            .engine
            .exec(&lease.container_name, &argv, timeout, max_output_bytes)
            .await;
        self.pool.release(&lease).await;

        match output {
            Ok(output) if output.timed_out => {
                self.audit(
                    request,
                    true,
                    EventCategory::Normal,
                    Some(format!("timed out after {}s", timeout.as_secs())),
                )
                .await;
                Err(SandboxError::ExecutionTimeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
            Ok(output) => {
                self.audit(
                    request,
                    true,
                    EventCategory::Normal,
                    Some(format!("exit code {}", output.exit_code)),
                )
                .await;
                Ok(ExecutionResult {
                    container: lease.container_name.clone(),
                    template: lease.template.clone(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                    duration_ms: output.duration_ms,
                    verdict,
                })
            }
            Err(e) => {
                self.audit(
                    request,
                    false,
                    EventCategory::Normal,
                    Some(format!("execution failed: {}", e)),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn audit(
        &self,
        request: &CommandRequest,
        allowed: bool,
        category: EventCategory,
        detail: Option<String>,
    ) {
        self.monitor
            .record(SecurityEvent::new(
                request.user_id.clone(),
                request.session_id.clone(),
                request.command.clone(),
                allowed,
                category,
                detail,
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerTemplate, ProfileConfig};
    use crate::engine::testing::MockEngine;
    use crate::lifecycle::PoolTier;
    use crate::network::{NetworkManager, SegmentClass, SegmentConfig};
    use crate::validator::RejectReason;

    fn test_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.default_profile = "recon".to_string();
        config.containers = vec![ContainerTemplate {
            name: "kali".to_string(),
            image: "rangekeeper/kali:latest".to_string(),
            tier: PoolTier::Hot,
            network: "training".to_string(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            limits: None,
        }];
        config.profiles.insert(
            "recon".to_string(),
            ProfileConfig {
                containers: vec!["kali".to_string()],
            },
        );
        config
    }

    async fn gateway() -> (Arc<MockEngine>, ExecutionGateway) {
        let engine = Arc::new(MockEngine::new());
        let network = Arc::new(NetworkManager::new(engine.clone() as Arc<dyn ContainerEngine>));
        network
            .ensure_segment(&SegmentConfig {
                name: "training".to_string(),
                cidr: "172.25.0.0/24".to_string(),
                class: SegmentClass::Training,
                rules: Vec::new(),
            })
            .await
            .unwrap();
        let config = test_config();
        let pool = Arc::new(PoolManager::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            network,
            &config,
        ));
        pool.start_hot().await.unwrap();
        let gateway =
            ExecutionGateway::new(engine.clone() as Arc<dyn ContainerEngine>, pool, config);
        (engine, gateway)
    }

    fn request(command: &str) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            user_id: "analyst-1".to_string(),
            session_id: None,
            profile: None,
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_allowed_command_executes() {
        let (engine, gateway) = gateway().await;
        let result = gateway
            .execute(&request("nmap -sV 172.25.0.10"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.template, "kali");

        let execs = gateway.monitor().audit_log(10).await;
        assert_eq!(execs.len(), 1);
        assert!(execs[0].allowed);

        let calls = engine.execs();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1[0], "nmap");
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected_and_audited() {
        let (engine, gateway) = gateway().await;
        let err = gateway.execute(&request("python3 exploit.py")).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ValidationRejected {
                reason: RejectReason::UnknownTool,
                ..
            }
        ));
        assert!(engine.execs().is_empty());

        let log = gateway.monitor().audit_log(10).await;
        assert_eq!(log.len(), 1);
        assert!(!log[0].allowed);
    }

    #[tokio::test]
    async fn test_breakout_screened_before_validation() {
        let (_engine, gateway) = gateway().await;
        let err = gateway
            .execute(&request("nsenter -t 1 -m bash"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SecurityBlocked { .. }));

        // Recorded as a breakout attempt, not an unknown tool
        let log = gateway.monitor().audit_log(10).await;
        assert_eq!(log[0].category, EventCategory::BreakoutAttempt);

        // User is now blocked outright
        let err = gateway
            .execute(&request("nmap -sV 172.25.0.10"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SecurityBlocked { .. }));
    }

    #[tokio::test]
    async fn test_blocked_user_short_circuits() {
        let (engine, gateway) = gateway().await;
        gateway.monitor().block("analyst-1", "manual block").await;
        let err = gateway
            .execute(&request("nmap -sV 172.25.0.10"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SecurityBlocked { .. }));
        assert!(engine.execs().is_empty());

        // The rejection still lands in the audit trail
        let log = gateway.monitor().audit_log(10).await;
        assert_eq!(log.len(), 1);
        assert!(!log[0].allowed);
        assert!(log[0].detail.as_deref().unwrap().contains("user blocked"));
    }

    #[tokio::test]
    async fn test_validate_only_does_not_execute_or_audit() {
        let (engine, gateway) = gateway().await;
        let verdict = gateway
            .validate_only(&request("nmap -sV 172.25.0.10"))
            .await
            .unwrap();
        assert!(verdict.allowed);
        assert!(engine.execs().is_empty());
        assert!(gateway.monitor().audit_log(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_validate_only_rejects_breakout_without_blocking() {
        let (engine, gateway) = gateway().await;
        let verdict = gateway
            .validate_only(&request(
                "curl --unix-socket /var/run/docker.sock http://127.0.0.1/containers/json",
            ))
            .await
            .unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(RejectReason::BlockedPattern));
        assert_eq!(verdict.matched_rule.as_deref(), Some("docker_socket"));

        // Dry run: no block, no audit entry, nothing executed
        assert!(gateway.monitor().check_blocked("analyst-1").is_none());
        assert!(gateway.monitor().audit_log(10).await.is_empty());
        assert!(engine.execs().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_enforced() {
        let (_engine, gateway) = gateway().await;
        let mut config = test_config();
        config.security.rate_limit_max = 2;
        gateway.reload_config(config).await;

        for _ in 0..2 {
            gateway
                .execute(&request("nmap -sV 172.25.0.10"))
                .await
                .unwrap();
        }
        let err = gateway
            .execute(&request("nmap -sV 172.25.0.10"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_gateway_error() {
        let engine = Arc::new(MockEngine {
            exec_delay: Some(Duration::from_secs(60)),
            ..MockEngine::new()
        });
        let network = Arc::new(NetworkManager::new(engine.clone() as Arc<dyn ContainerEngine>));
        network
            .ensure_segment(&SegmentConfig {
                name: "training".to_string(),
                cidr: "172.25.0.0/24".to_string(),
                class: SegmentClass::Training,
                rules: Vec::new(),
            })
            .await
            .unwrap();
        let mut config = test_config();
        config.limits.exec_timeout_secs = 1;
        let pool = Arc::new(PoolManager::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            network,
            &config,
        ));
        pool.start_hot().await.unwrap();
        let gateway = ExecutionGateway::new(engine as Arc<dyn ContainerEngine>, pool, config);

        let err = gateway
            .execute(&request("nmap -sV 172.25.0.10"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ExecutionTimeout { timeout_secs: 1 }
        ));
        // Lease released despite the timeout
        assert_eq!(gateway.pool().status().await.leased, 0);
    }

    #[tokio::test]
    async fn test_reload_swaps_rule_tables() {
        let (_engine, gateway) = gateway().await;
        gateway
            .execute(&request("nikto -h http://172.25.0.10/"))
            .await
            .unwrap();

        let mut config = test_config();
        config.rules.tools.retain(|t| t.name != "nikto");
        gateway.reload_config(config).await;

        let err = gateway
            .execute(&request("nikto -h http://172.25.0.10/"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ValidationRejected { .. }));
    }

    #[tokio::test]
    async fn test_timeout_override_is_capped() {
        let (engine, gateway) = gateway().await;
        let mut req = request("nmap -sV 172.25.0.10");
        req.timeout_secs = Some(86_400);
        gateway.execute(&req).await.unwrap();
        // Command still went through; the cap applies silently
        assert_eq!(engine.execs().len(), 1);
    }
}
