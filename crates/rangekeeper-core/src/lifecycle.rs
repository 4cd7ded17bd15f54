//! Container lifecycle — instance state machine and per-container control
//!
//! The controller is the only component that mutates container state, and it
//! does so under pool-manager direction. Startup durations feed an EMA used
//! for readiness estimates.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ContainerTemplate, ResourceLimits};
use crate::engine::{ContainerEngine, ResourceUsage, StartSpec};
use crate::error::SandboxError;

/// Pool tier a container belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolTier {
    /// Started at boot, kept running, never TTL-evicted.
    Hot,
    /// Started on demand, evicted after idling past the TTL.
    Warm,
    /// Started per request, torn down immediately after.
    Cold,
}

/// Runtime status of a container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Cold,
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
    Unhealthy,
}

impl ContainerStatus {
    /// A command may only be exec'd into a running or idle container.
    pub fn can_exec(self) -> bool {
        matches!(self, Self::Running | Self::Idle)
    }
}

/// One pooled container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub id: String,
    /// Engine-side container name.
    pub name: String,
    pub template: String,
    pub image: String,
    pub tier: PoolTier,
    pub status: ContainerStatus,
    pub healthy: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
    pub restarts: u32,
}

const EMA_ALPHA: f64 = 0.3;

/// Starts, stops, health-checks, snapshots, and restores single containers.
pub struct LifecycleController {
    engine: Arc<dyn ContainerEngine>,
    /// Per-template EMA of observed startup milliseconds.
    startup_ema: Mutex<HashMap<String, f64>>,
}

impl LifecycleController {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            startup_ema: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Start one container from a template. Single attempt; the pool owns
    /// the retry policy.
    pub async fn start_instance(
        &self,
        template: &ContainerTemplate,
        limits: ResourceLimits,
        profile: Option<String>,
        engine_network: Option<String>,
    ) -> Result<ContainerInstance, SandboxError> {
        let id = uuid::Uuid::new_v4().to_string();
        let name = format!("rk-{}-{}", template.name, &id[..8]);
        let spec = StartSpec {
            name: name.clone(),
            image: template.image.clone(),
            network: engine_network,
            command: template.command.clone(),
            limits,
        };

        let started = std::time::Instant::now();
        self.engine.start(&spec).await?;
        if !self.engine.is_running(&name).await? {
            let _ = self.engine.remove(&name).await;
            return Err(SandboxError::EngineUnavailable(format!(
                "container '{}' exited immediately after start",
                name
            )));
        }
        let elapsed_ms = started.elapsed().as_millis() as f64;
        self.record_startup(&template.name, elapsed_ms).await;

        info!(
            "Started container '{}' (template '{}', tier {:?}, {:.0}ms)",
            name, template.name, template.tier, elapsed_ms
        );
        let now = Utc::now();
        Ok(ContainerInstance {
            id,
            name,
            template: template.name.clone(),
            image: template.image.clone(),
            tier: template.tier,
            status: ContainerStatus::Running,
            healthy: true,
            created_at: now,
            last_used: now,
            profile,
            network: template.network.clone(),
            usage: None,
            restarts: 0,
        })
    }

    /// Stop and remove a container, walking it through `stopping → stopped`.
    pub async fn stop_instance(
        &self,
        instance: &mut ContainerInstance,
    ) -> Result<(), SandboxError> {
        instance.status = ContainerStatus::Stopping;
        if let Err(e) = self.engine.stop(&instance.name).await {
            warn!("Stop of '{}' failed, forcing removal: {}", instance.name, e);
        }
        self.engine.remove(&instance.name).await?;
        instance.status = ContainerStatus::Stopped;
        instance.healthy = false;
        info!("Stopped container '{}'", instance.name);
        Ok(())
    }

    /// Probe liveness; a failed probe marks the instance unhealthy.
    pub async fn health_check(&self, instance: &mut ContainerInstance) -> bool {
        let alive = match self.engine.is_running(&instance.name).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!("Health check of '{}' errored: {}", instance.name, e);
                false
            }
        };
        if !alive && instance.status.can_exec() {
            warn!("Container '{}' failed its health check", instance.name);
            instance.status = ContainerStatus::Unhealthy;
        }
        instance.healthy = alive;
        alive
    }

    /// Refresh the resource-metrics snapshot.
    pub async fn refresh_usage(
        &self,
        instance: &mut ContainerInstance,
    ) -> Result<ResourceUsage, SandboxError> {
        let usage = self.engine.stats(&instance.name).await?;
        instance.usage = Some(usage.clone());
        Ok(usage)
    }

    /// Checkpoint the container filesystem to a named snapshot image.
    pub async fn snapshot(
        &self,
        instance: &ContainerInstance,
        label: &str,
    ) -> Result<String, SandboxError> {
        let image = format!(
            "rk-snapshot/{}:{}",
            label,
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        self.engine.commit(&instance.name, &image).await?;
        info!("Snapshot of '{}' saved as '{}'", instance.name, image);
        Ok(image)
    }

    /// Start a fresh container from a snapshot image, keeping the original
    /// template's tier, limits, and network.
    pub async fn restore(
        &self,
        snapshot_image: &str,
        template: &ContainerTemplate,
        limits: ResourceLimits,
        profile: Option<String>,
        engine_network: Option<String>,
    ) -> Result<ContainerInstance, SandboxError> {
        let restored_template = ContainerTemplate {
            image: snapshot_image.to_string(),
            ..template.clone()
        };
        self.start_instance(&restored_template, limits, profile, engine_network)
            .await
    }

    async fn record_startup(&self, template: &str, elapsed_ms: f64) {
        let mut ema = self.startup_ema.lock().await;
        let entry = ema.entry(template.to_string()).or_insert(elapsed_ms);
        *entry = EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * *entry;
        debug!("Startup EMA for '{}' now {:.0}ms", template, *entry);
    }

    /// Estimated startup time for a template, if ever observed.
    pub async fn estimate_startup_ms(&self, template: &str) -> Option<u64> {
        self.startup_ema.lock().await.get(template).map(|&ms| ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;

    fn template(name: &str, tier: PoolTier) -> ContainerTemplate {
        ContainerTemplate {
            name: name.to_string(),
            image: format!("rangekeeper/{}:latest", name),
            tier,
            network: "training".to_string(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            limits: None,
        }
    }

    fn controller() -> (Arc<MockEngine>, LifecycleController) {
        let engine = Arc::new(MockEngine::new());
        let controller = LifecycleController::new(engine.clone() as Arc<dyn ContainerEngine>);
        (engine, controller)
    }

    #[tokio::test]
    async fn test_start_and_stop_instance() {
        let (engine, controller) = controller();
        let mut instance = controller
            .start_instance(
                &template("kali", PoolTier::Hot),
                ResourceLimits::default(),
                Some("recon".to_string()),
                Some("training".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(instance.status, ContainerStatus::Running);
        assert!(instance.healthy);
        assert!(instance.name.starts_with("rk-kali-"));
        assert!(engine.is_running(&instance.name).await.unwrap());

        controller.stop_instance(&mut instance).await.unwrap();
        assert_eq!(instance.status, ContainerStatus::Stopped);
        assert!(!engine.is_running(&instance.name).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check_marks_unhealthy() {
        let (engine, controller) = controller();
        let mut instance = controller
            .start_instance(
                &template("kali", PoolTier::Warm),
                ResourceLimits::default(),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(controller.health_check(&mut instance).await);

        // Kill behind the controller's back
        engine.stop(&instance.name).await.unwrap();
        assert!(!controller.health_check(&mut instance).await);
        assert_eq!(instance.status, ContainerStatus::Unhealthy);
        assert!(!instance.healthy);
    }

    #[tokio::test]
    async fn test_snapshot_commits_named_image() {
        let (engine, controller) = controller();
        let instance = controller
            .start_instance(
                &template("target", PoolTier::Warm),
                ResourceLimits::default(),
                None,
                None,
            )
            .await
            .unwrap();
        let image = controller.snapshot(&instance, "round-1").await.unwrap();
        assert!(image.starts_with("rk-snapshot/round-1:"));

        let commits = engine.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, instance.name);
    }

    #[tokio::test]
    async fn test_restore_starts_from_snapshot_image() {
        let (_engine, controller) = controller();
        let restored = controller
            .restore(
                "rk-snapshot/round-1:abcd1234",
                &template("target", PoolTier::Warm),
                ResourceLimits::default(),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(restored.image, "rk-snapshot/round-1:abcd1234");
        assert_eq!(restored.template, "target");
        assert_eq!(restored.tier, PoolTier::Warm);
    }

    #[tokio::test]
    async fn test_startup_estimate_recorded() {
        let (_engine, controller) = controller();
        assert!(controller.estimate_startup_ms("kali").await.is_none());
        controller
            .start_instance(
                &template("kali", PoolTier::Hot),
                ResourceLimits::default(),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(controller.estimate_startup_ms("kali").await.is_some());
    }

    #[tokio::test]
    async fn test_start_failure_surfaces() {
        let (engine, controller) = controller();
        engine
            .fail_starts
            .store(1, std::sync::atomic::Ordering::SeqCst);
        let result = controller
            .start_instance(
                &template("kali", PoolTier::Hot),
                ResourceLimits::default(),
                None,
                None,
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_can_exec() {
        assert!(ContainerStatus::Running.can_exec());
        assert!(ContainerStatus::Idle.can_exec());
        assert!(!ContainerStatus::Starting.can_exec());
        assert!(!ContainerStatus::Unhealthy.can_exec());
        assert!(!ContainerStatus::Stopped.can_exec());
    }
}
