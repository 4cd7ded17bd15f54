//! Pool manager — container registry, tier policy, TTL eviction, leases
//!
//! Owns the registry of containers by pool tier. Hot containers are started
//! at boot and never evicted; warm containers start on first demand and are
//! swept once idle past the TTL; cold containers live for a single request.
//! Concurrent demands for the same template are deduplicated: the first
//! caller starts, later callers await the in-flight start. Executions hold
//! a lease the sweep checks before evicting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ContainerTemplate, OrchestratorConfig, PoolSettings, ResourceLimits};
use crate::engine::{ContainerEngine, ResourceUsage};
use crate::error::SandboxError;
use crate::lifecycle::{ContainerInstance, ContainerStatus, LifecycleController, PoolTier};
use crate::network::NetworkManager;

/// Give up on an instance after this many failed restart cycles.
const MAX_RESTARTS: u32 = 3;

/// Fallback readiness estimate before any startup has been observed.
const DEFAULT_ESTIMATE_MS: u64 = 5_000;

/// Readiness of a profile's required container set. Callers get an estimate
/// when not yet ready, never an unbounded wait.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub profile: String,
    pub all_ready: bool,
    pub ready: Vec<String>,
    pub pending: Vec<String>,
    /// Containers actually started by this call.
    pub started: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_ms: Option<u64>,
}

/// Held for the duration of one execution; the eviction sweep respects it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub instance_id: String,
    pub container_name: String,
    pub template: String,
    /// Cold-tier container torn down on release.
    pub ephemeral: bool,
}

/// Counts surfaced by `GET /sandbox/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub ready: usize,
    pub unhealthy: usize,
    pub leased: usize,
    pub sessions: usize,
}

enum StartRole {
    Lead(watch::Sender<bool>),
    Follow(watch::Receiver<bool>),
}

pub struct PoolManager {
    lifecycle: LifecycleController,
    network: Arc<NetworkManager>,
    /// Primary shared resource: instances keyed by id, locked per entry.
    registry: DashMap<String, Arc<RwLock<ContainerInstance>>>,
    leases: DashMap<String, u32>,
    sessions: DashMap<String, String>,
    /// Snapshot image → source template.
    snapshots: DashMap<String, String>,
    /// Template name → in-flight start signal.
    in_flight: Mutex<HashMap<String, watch::Receiver<bool>>>,
    settings: RwLock<PoolSettings>,
    templates: RwLock<HashMap<String, ContainerTemplate>>,
    profiles: RwLock<HashMap<String, Vec<String>>>,
    default_limits: RwLock<ResourceLimits>,
}

impl PoolManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        network: Arc<NetworkManager>,
        config: &OrchestratorConfig,
    ) -> Self {
        let templates = config
            .containers
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        let profiles = config
            .profiles
            .iter()
            .map(|(name, p)| (name.clone(), p.containers.clone()))
            .collect();
        Self {
            lifecycle: LifecycleController::new(engine),
            network,
            registry: DashMap::new(),
            leases: DashMap::new(),
            sessions: DashMap::new(),
            snapshots: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            settings: RwLock::new(config.pool.clone()),
            templates: RwLock::new(templates),
            profiles: RwLock::new(profiles),
            default_limits: RwLock::new(config.limits.clone()),
        }
    }

    /// Swap in new pool settings, templates, and profile mappings without
    /// touching running containers.
    pub async fn reload(&self, config: &OrchestratorConfig) {
        *self.settings.write().await = config.pool.clone();
        *self.templates.write().await = config
            .containers
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        *self.profiles.write().await = config
            .profiles
            .iter()
            .map(|(name, p)| (name.clone(), p.containers.clone()))
            .collect();
        *self.default_limits.write().await = config.limits.clone();
        info!("Pool configuration reloaded");
    }

    fn lease_count(&self, instance_id: &str) -> u32 {
        self.leases.get(instance_id).map(|e| *e).unwrap_or(0)
    }

    fn registry_entries(&self) -> Vec<(String, Arc<RwLock<ContainerInstance>>)> {
        self.registry
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// A usable (running/idle + healthy) instance of a template, if any.
    async fn find_ready(&self, template: &str) -> Option<(String, Arc<RwLock<ContainerInstance>>)> {
        for (id, arc) in self.registry_entries() {
            let instance = arc.read().await;
            if instance.template == template && instance.status.can_exec() && instance.healthy {
                drop(instance);
                return Some((id, arc));
            }
        }
        None
    }

    async fn template_ready(&self, template: &str) -> bool {
        self.find_ready(template).await.is_some()
    }

    async fn tier_count(&self, tier: PoolTier) -> usize {
        let mut count = 0;
        for (_, arc) in self.registry_entries() {
            let instance = arc.read().await;
            if instance.tier == tier && instance.status != ContainerStatus::Stopped {
                count += 1;
            }
        }
        count
    }

    /// Start a container from a template and register it. The pool owns the
    /// retry policy; a segment that failed to attach refuses the start
    /// outright, so a container never reaches `running` on a broken network.
    async fn start_and_register(
        &self,
        template: &ContainerTemplate,
        profile: Option<String>,
        restarts: u32,
    ) -> Result<Arc<RwLock<ContainerInstance>>, SandboxError> {
        if !self.network.is_attached(&template.network).await {
            return Err(SandboxError::StartupFailed {
                template: template.name.clone(),
                attempts: 0,
                detail: format!("network segment '{}' is not attached", template.network),
            });
        }
        let (retries, max_per_tier) = {
            let settings = self.settings.read().await;
            (settings.startup_retries.max(1), settings.max_per_tier)
        };
        if self.tier_count(template.tier).await >= max_per_tier {
            return Err(SandboxError::StartupFailed {
                template: template.name.clone(),
                attempts: 0,
                detail: format!("{:?}-tier capacity ({}) reached", template.tier, max_per_tier),
            });
        }
        let limits = match &template.limits {
            Some(limits) => limits.clone(),
            None => self.default_limits.read().await.clone(),
        };

        let mut last_error = String::new();
        for attempt in 1..=retries {
            match self
                .lifecycle
                .start_instance(
                    template,
                    limits.clone(),
                    profile.clone(),
                    Some(template.network.clone()),
                )
                .await
            {
                Ok(mut instance) => {
                    instance.restarts = restarts;
                    if instance.tier == PoolTier::Warm {
                        instance.status = ContainerStatus::Idle;
                    }
                    let id = instance.id.clone();
                    let arc = Arc::new(RwLock::new(instance));
                    self.registry.insert(id, arc.clone());
                    return Ok(arc);
                }
                Err(e) => {
                    warn!(
                        "Start attempt {}/{} for template '{}' failed: {}",
                        attempt, retries, template.name, e
                    );
                    last_error = e.to_string();
                    if attempt < retries {
                        tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(SandboxError::StartupFailed {
            template: template.name.clone(),
            attempts: retries,
            detail: last_error,
        })
    }

    /// Ensure one template has a usable instance, deduplicating concurrent
    /// starts. Returns whether this call actually started a container.
    pub async fn start_template(
        &self,
        name: &str,
        profile: Option<String>,
    ) -> Result<bool, SandboxError> {
        if self.template_ready(name).await {
            return Ok(false);
        }
        let role = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(name) {
                Some(rx) => StartRole::Follow(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    in_flight.insert(name.to_string(), rx);
                    StartRole::Lead(tx)
                }
            }
        };
        match role {
            StartRole::Follow(mut rx) => {
                debug!("Awaiting in-flight start of template '{}'", name);
                if !*rx.borrow() {
                    let _ = rx.changed().await;
                }
                if self.template_ready(name).await {
                    Ok(false)
                } else {
                    Err(SandboxError::StartupFailed {
                        template: name.to_string(),
                        attempts: 0,
                        detail: "awaited start did not produce a usable container".to_string(),
                    })
                }
            }
            StartRole::Lead(tx) => {
                let template = {
                    let templates = self.templates.read().await;
                    templates.get(name).cloned()
                };
                let result = match template {
                    Some(template) => self
                        .start_and_register(&template, profile, 0)
                        .await
                        .map(|_| true),
                    None => Err(SandboxError::NotFound(format!("container template '{}'", name))),
                };
                self.in_flight.lock().await.remove(name);
                let _ = tx.send(true);
                result
            }
        }
    }

    /// Resolve a profile's required containers and bring them up, waiting at
    /// most the configured startup timeout. Not-yet-ready members come back
    /// in `pending` with a wait estimate instead of blocking forever.
    pub async fn ensure_ready(&self, profile: &str) -> Result<ReadinessReport, SandboxError> {
        let members = {
            let profiles = self.profiles.read().await;
            profiles
                .get(profile)
                .cloned()
                .ok_or_else(|| SandboxError::NotFound(format!("profile '{}'", profile)))?
        };
        let timeout_secs = self.settings.read().await.startup_timeout_secs;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        let mut ready = Vec::new();
        let mut pending = Vec::new();
        let mut started = 0u32;

        for name in &members {
            let tier = {
                let templates = self.templates.read().await;
                templates.get(name).map(|t| t.tier)
            };
            // Cold members are per-request by definition; nothing to prewarm.
            if tier == Some(PoolTier::Cold) {
                ready.push(name.clone());
                continue;
            }
            if self.template_ready(name).await {
                ready.push(name.clone());
                continue;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                pending.push(name.clone());
                continue;
            }
            match tokio::time::timeout(
                remaining,
                self.start_template(name, Some(profile.to_string())),
            )
            .await
            {
                Ok(Ok(did_start)) => {
                    if did_start {
                        started += 1;
                    }
                    ready.push(name.clone());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => pending.push(name.clone()),
            }
        }

        let estimated_wait_ms = if pending.is_empty() {
            None
        } else {
            let mut estimate = 0u64;
            for name in &pending {
                let ms = self
                    .lifecycle
                    .estimate_startup_ms(name)
                    .await
                    .unwrap_or(DEFAULT_ESTIMATE_MS);
                estimate = estimate.max(ms);
            }
            Some(estimate)
        };

        Ok(ReadinessReport {
            profile: profile.to_string(),
            all_ready: pending.is_empty(),
            ready,
            pending,
            started,
            estimated_wait_ms,
        })
    }

    /// Idempotent readiness: when everything is already up this is a no-op
    /// returning immediate success. `force_restart` recycles unleased
    /// members first.
    pub async fn prepare(
        &self,
        profile: &str,
        force_restart: bool,
    ) -> Result<ReadinessReport, SandboxError> {
        if force_restart {
            let members = {
                let profiles = self.profiles.read().await;
                profiles
                    .get(profile)
                    .cloned()
                    .ok_or_else(|| SandboxError::NotFound(format!("profile '{}'", profile)))?
            };
            for (id, arc) in self.registry_entries() {
                let mut instance = arc.write().await;
                if !members.contains(&instance.template) {
                    continue;
                }
                if self.lease_count(&id) > 0 {
                    warn!(
                        "Skipping forced restart of leased container '{}'",
                        instance.name
                    );
                    continue;
                }
                let _ = self.lifecycle.stop_instance(&mut instance).await;
                drop(instance);
                self.registry.remove(&id);
            }
        }
        self.ensure_ready(profile).await
    }

    async fn lease_instance(&self, instance_id: &str) -> Result<Lease, SandboxError> {
        let arc = self
            .registry
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SandboxError::NotFound(format!("container '{}'", instance_id)))?;
        let mut instance = arc.write().await;
        if !instance.status.can_exec() || !instance.healthy {
            return Err(SandboxError::ContainerUnhealthy {
                container: instance.name.clone(),
            });
        }
        instance.status = ContainerStatus::Running;
        instance.last_used = Utc::now();
        *self.leases.entry(instance_id.to_string()).or_insert(0) += 1;
        Ok(Lease {
            instance_id: instance_id.to_string(),
            container_name: instance.name.clone(),
            template: instance.template.clone(),
            ephemeral: false,
        })
    }

    /// Obtain a container for one execution. Session containers take
    /// precedence; otherwise the profile's members are tried hot-first,
    /// warm started on demand, cold spun up ephemerally.
    pub async fn acquire(
        &self,
        profile: &str,
        session: Option<&str>,
    ) -> Result<Lease, SandboxError> {
        if let Some(session_id) = session {
            let instance_id = self.sessions.get(session_id).map(|e| e.value().clone());
            if let Some(instance_id) = instance_id {
                return self.lease_instance(&instance_id).await;
            }
        }

        let members = {
            let profiles = self.profiles.read().await;
            profiles
                .get(profile)
                .cloned()
                .ok_or_else(|| SandboxError::NotFound(format!("profile '{}'", profile)))?
        };

        // Prefer an instance that is already up, hot tier first.
        let mut candidates: Vec<(PoolTier, String)> = Vec::new();
        for (id, arc) in self.registry_entries() {
            let instance = arc.read().await;
            if members.contains(&instance.template)
                && instance.status.can_exec()
                && instance.healthy
                && instance.tier != PoolTier::Cold
            {
                candidates.push((instance.tier, id.clone()));
            }
        }
        candidates.sort_by_key(|(tier, _)| tier_rank(*tier));
        if let Some((_, id)) = candidates.first() {
            return self.lease_instance(id).await;
        }

        // Nothing up yet: start on demand.
        for name in &members {
            let template = {
                let templates = self.templates.read().await;
                templates.get(name).cloned()
            };
            let Some(template) = template else { continue };
            if template.tier == PoolTier::Cold {
                let arc = self
                    .start_and_register(&template, Some(profile.to_string()), 0)
                    .await?;
                let instance = arc.read().await;
                *self.leases.entry(instance.id.clone()).or_insert(0) += 1;
                return Ok(Lease {
                    instance_id: instance.id.clone(),
                    container_name: instance.name.clone(),
                    template: instance.template.clone(),
                    ephemeral: true,
                });
            }
            self.start_template(name, Some(profile.to_string())).await?;
            if let Some((id, _)) = self.find_ready(name).await {
                return self.lease_instance(&id).await;
            }
        }
        Err(SandboxError::NotFound(format!(
            "no usable container for profile '{}'",
            profile
        )))
    }

    /// Release a lease. Warm containers return to `idle`; ephemeral cold
    /// containers are torn down immediately.
    pub async fn release(&self, lease: &Lease) {
        let remaining = {
            let mut entry = self.leases.entry(lease.instance_id.clone()).or_insert(0);
            if *entry > 0 {
                *entry -= 1;
            }
            *entry
        };
        if remaining == 0 {
            self.leases.remove(&lease.instance_id);
        }
        let Some(arc) = self.registry.get(&lease.instance_id).map(|e| e.value().clone()) else {
            return;
        };
        let mut instance = arc.write().await;
        instance.last_used = Utc::now();
        if remaining > 0 {
            return;
        }
        match instance.tier {
            PoolTier::Warm => instance.status = ContainerStatus::Idle,
            PoolTier::Cold if lease.ephemeral => {
                let _ = self.lifecycle.stop_instance(&mut instance).await;
                drop(instance);
                self.registry.remove(&lease.instance_id);
            }
            _ => {}
        }
    }

    /// One pass of the TTL eviction sweep. Only idle, unleased warm
    /// containers past the TTL are stopped; hot containers are exempt.
    pub async fn sweep_once(&self) {
        let ttl_ms = {
            let settings = self.settings.read().await;
            settings.warm_ttl_secs as i64 * 1000
        };
        for (id, arc) in self.registry_entries() {
            let overdue = {
                let instance = arc.read().await;
                instance.tier == PoolTier::Warm
                    && instance.status == ContainerStatus::Idle
                    && self.lease_count(&id) == 0
                    && (Utc::now() - instance.last_used).num_milliseconds() > ttl_ms
            };
            if !overdue {
                continue;
            }
            // Check-before-evict: re-verify under the write lock so a lease
            // taken between the check and here wins.
            let mut instance = arc.write().await;
            if instance.status != ContainerStatus::Idle || self.lease_count(&id) > 0 {
                continue;
            }
            info!(
                "TTL eviction: stopping idle warm container '{}'",
                instance.name
            );
            let _ = self.lifecycle.stop_instance(&mut instance).await;
            drop(instance);
            self.registry.remove(&id);
        }
    }

    /// One pass of interval health checks, with bounded restart recovery.
    pub async fn health_sweep_once(&self) {
        for (id, arc) in self.registry_entries() {
            let mut instance = arc.write().await;
            if !instance.status.can_exec() {
                continue;
            }
            if self.lifecycle.health_check(&mut instance).await {
                continue;
            }
            if instance.restarts >= MAX_RESTARTS {
                warn!(
                    "Container '{}' unhealthy and out of restart budget",
                    instance.name
                );
                continue;
            }
            let template_name = instance.template.clone();
            let profile = instance.profile.clone();
            let restarts = instance.restarts + 1;
            let _ = self.lifecycle.stop_instance(&mut instance).await;
            drop(instance);
            self.registry.remove(&id);

            let template = {
                let templates = self.templates.read().await;
                templates.get(&template_name).cloned()
            };
            let Some(template) = template else { continue };
            match self.start_and_register(&template, profile, restarts).await {
                Ok(_) => info!(
                    "Restarted unhealthy container from template '{}' (attempt {})",
                    template_name, restarts
                ),
                Err(e) => warn!(
                    "Restart of unhealthy template '{}' failed: {}",
                    template_name, e
                ),
            }
        }
    }

    /// Eagerly start every hot-tier template. Called once at boot.
    pub async fn start_hot(&self) -> Result<(), SandboxError> {
        let hot: Vec<String> = {
            let templates = self.templates.read().await;
            templates
                .values()
                .filter(|t| t.tier == PoolTier::Hot)
                .map(|t| t.name.clone())
                .collect()
        };
        for name in hot {
            self.start_template(&name, None).await?;
        }
        Ok(())
    }

    /// Background loop: TTL sweep and health checks on their own intervals.
    pub fn spawn_background(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            let (sweep_secs, health_secs) = {
                let settings = pool.settings.read().await;
                (
                    settings.sweep_interval_secs.max(1),
                    settings.health_check_interval_secs.max(1),
                )
            };
            let mut sweep = tokio::time::interval(Duration::from_secs(sweep_secs));
            let mut health = tokio::time::interval(Duration::from_secs(health_secs));
            // Skip the immediate first ticks
            sweep.tick().await;
            health.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Pool background loop stopped");
                        break;
                    }
                    _ = sweep.tick() => pool.sweep_once().await,
                    _ = health.tick() => pool.health_sweep_once().await,
                }
            }
        })
    }

    /// Drain in-flight executions up to the grace period, then stop
    /// everything.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.leases.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.leases.is_empty() {
            warn!(
                "Grace period elapsed with {} active leases, forcing termination",
                self.leases.len()
            );
        }
        for (id, arc) in self.registry_entries() {
            let mut instance = arc.write().await;
            let _ = self.lifecycle.stop_instance(&mut instance).await;
            drop(instance);
            self.registry.remove(&id);
        }
        self.sessions.clear();
        self.leases.clear();
        info!("Pool drained and stopped");
    }

    pub async fn list(&self) -> Vec<ContainerInstance> {
        let mut instances = Vec::new();
        for (_, arc) in self.registry_entries() {
            instances.push(arc.read().await.clone());
        }
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        instances
    }

    /// Find one instance by id or engine name.
    pub async fn get(&self, key: &str) -> Option<ContainerInstance> {
        if let Some(arc) = self.registry.get(key).map(|e| e.value().clone()) {
            return Some(arc.read().await.clone());
        }
        for (_, arc) in self.registry_entries() {
            let instance = arc.read().await;
            if instance.name == key {
                return Some(instance.clone());
            }
        }
        None
    }

    /// Refresh and return resource metrics for one container.
    pub async fn metrics(&self, key: &str) -> Result<ResourceUsage, SandboxError> {
        for (_, arc) in self.registry_entries() {
            let mut instance = arc.write().await;
            if instance.id == key || instance.name == key {
                return self.lifecycle.refresh_usage(&mut instance).await;
            }
        }
        Err(SandboxError::NotFound(format!("container '{}'", key)))
    }

    pub async fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            total: 0,
            hot: 0,
            warm: 0,
            cold: 0,
            ready: 0,
            unhealthy: 0,
            leased: self.leases.len(),
            sessions: self.sessions.len(),
        };
        for (_, arc) in self.registry_entries() {
            let instance = arc.read().await;
            status.total += 1;
            match instance.tier {
                PoolTier::Hot => status.hot += 1,
                PoolTier::Warm => status.warm += 1,
                PoolTier::Cold => status.cold += 1,
            }
            if instance.status.can_exec() && instance.healthy {
                status.ready += 1;
            }
            if instance.status == ContainerStatus::Unhealthy {
                status.unhealthy += 1;
            }
        }
        status
    }

    /// Checkpoint a container to a named snapshot image. Refused while the
    /// container is mid-execution.
    pub async fn snapshot(&self, key: &str, label: &str) -> Result<String, SandboxError> {
        for (id, arc) in self.registry_entries() {
            let instance = arc.read().await;
            if instance.id != key && instance.name != key {
                continue;
            }
            if self.lease_count(&id) > 0 {
                return Err(SandboxError::Busy {
                    container: instance.name.clone(),
                });
            }
            let image = self.lifecycle.snapshot(&instance, label).await?;
            self.snapshots.insert(image.clone(), instance.template.clone());
            return Ok(image);
        }
        Err(SandboxError::NotFound(format!("container '{}'", key)))
    }

    /// Start a fresh container from a snapshot image, used to reset a
    /// sandbox between training rounds without full teardown.
    pub async fn restore(&self, snapshot_image: &str) -> Result<ContainerInstance, SandboxError> {
        let template_name = self
            .snapshots
            .get(snapshot_image)
            .map(|e| e.value().clone())
            .ok_or_else(|| SandboxError::NotFound(format!("snapshot '{}'", snapshot_image)))?;
        let template = {
            let templates = self.templates.read().await;
            templates.get(&template_name).cloned().ok_or_else(|| {
                SandboxError::NotFound(format!("container template '{}'", template_name))
            })?
        };
        if !self.network.is_attached(&template.network).await {
            return Err(SandboxError::StartupFailed {
                template: template.name.clone(),
                attempts: 0,
                detail: format!("network segment '{}' is not attached", template.network),
            });
        }
        let limits = match &template.limits {
            Some(limits) => limits.clone(),
            None => self.default_limits.read().await.clone(),
        };
        let mut instance = self
            .lifecycle
            .restore(
                snapshot_image,
                &template,
                limits,
                None,
                Some(template.network.clone()),
            )
            .await?;
        if instance.tier == PoolTier::Warm {
            instance.status = ContainerStatus::Idle;
        }
        let id = instance.id.clone();
        let snapshot = instance.clone();
        self.registry.insert(id, Arc::new(RwLock::new(instance)));
        Ok(snapshot)
    }

    /// Create (or return) the dedicated container behind an ephemeral
    /// sandbox session.
    pub async fn create_session(
        &self,
        session_id: &str,
        template_name: Option<&str>,
    ) -> Result<ContainerInstance, SandboxError> {
        if let Some(existing) = self.sessions.get(session_id).map(|e| e.value().clone()) {
            if let Some(instance) = self.get(&existing).await {
                return Ok(instance);
            }
            self.sessions.remove(session_id);
        }
        let template = {
            let templates = self.templates.read().await;
            match template_name {
                Some(name) => templates.get(name).cloned(),
                None => templates
                    .values()
                    .find(|t| t.tier == PoolTier::Cold)
                    .or_else(|| templates.values().next())
                    .cloned(),
            }
        }
        .ok_or_else(|| SandboxError::NotFound("no container template for session".to_string()))?;

        let arc = self
            .start_and_register(&template, Some(format!("session:{}", session_id)), 0)
            .await?;
        let instance = arc.read().await.clone();
        self.sessions.insert(session_id.to_string(), instance.id.clone());
        info!(
            "Session '{}' bound to container '{}'",
            session_id, instance.name
        );
        Ok(instance)
    }

    pub async fn destroy_session(&self, session_id: &str) -> Result<(), SandboxError> {
        let instance_id = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SandboxError::NotFound(format!("session '{}'", session_id)))?;
        if self.lease_count(&instance_id) > 0 {
            return Err(SandboxError::Busy {
                container: instance_id,
            });
        }
        self.sessions.remove(session_id);
        if let Some(arc) = self.registry.get(&instance_id).map(|e| e.value().clone()) {
            let mut instance = arc.write().await;
            let _ = self.lifecycle.stop_instance(&mut instance).await;
            drop(instance);
            self.registry.remove(&instance_id);
        }
        info!("Session '{}' destroyed", session_id);
        Ok(())
    }
}

fn tier_rank(tier: PoolTier) -> u8 {
    match tier {
        PoolTier::Hot => 0,
        PoolTier::Warm => 1,
        PoolTier::Cold => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConfig;
    use crate::engine::testing::MockEngine;
    use crate::network::{SegmentClass, SegmentConfig};

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

    fn test_config(settings: PoolSettings) -> OrchestratorConfig {
        let mut config = OrchestratorConfig {
            pool: settings,
            containers: vec![
                template("kali", PoolTier::Hot),
                template("target-web", PoolTier::Warm),
                template("scratch", PoolTier::Cold),
            ],
            ..OrchestratorConfig::default()
        };
        config.profiles.insert(
            "recon".to_string(),
            ProfileConfig {
                containers: vec!["kali".to_string(), "target-web".to_string()],
            },
        );
        config.profiles.insert(
            "warm-only".to_string(),
            ProfileConfig {
                containers: vec!["target-web".to_string()],
            },
        );
        config.profiles.insert(
            "cold-only".to_string(),
            ProfileConfig {
                containers: vec!["scratch".to_string()],
            },
        );
        config
    }

    async fn setup(settings: PoolSettings) -> (Arc<MockEngine>, Arc<PoolManager>) {
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
        let pool = Arc::new(PoolManager::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            network,
            &test_config(settings),
        ));
        (engine, pool)
    }

    #[tokio::test]
    async fn test_start_hot_only_starts_hot_tier() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        pool.start_hot().await.unwrap();
        assert_eq!(engine.starts(), 1);
        let list = pool.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].template, "kali");
        assert_eq!(list[0].status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_ensure_ready_starts_warm_member() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        pool.start_hot().await.unwrap();
        let report = pool.ensure_ready("recon").await.unwrap();
        assert!(report.all_ready);
        assert_eq!(report.started, 1); // only the warm member
        assert_eq!(engine.starts(), 2);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        let first = pool.prepare("recon", false).await.unwrap();
        assert!(first.all_ready);
        let starts_after_first = engine.starts();

        let second = pool.prepare("recon", false).await.unwrap();
        assert!(second.all_ready);
        assert_eq!(second.started, 0);
        assert_eq!(engine.starts(), starts_after_first);
    }

    #[tokio::test]
    async fn test_ensure_ready_unknown_profile() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        let err = pool.ensure_ready("ghost").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_deduplicates_starts() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        let (a, b) = tokio::join!(
            pool.ensure_ready("warm-only"),
            pool.ensure_ready("warm-only")
        );
        assert!(a.unwrap().all_ready);
        assert!(b.unwrap().all_ready);
        assert_eq!(engine.starts(), 1);
    }

    #[tokio::test]
    async fn test_acquire_release_warm_cycle() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        let lease = pool.acquire("warm-only", None).await.unwrap();
        assert!(!lease.ephemeral);
        assert_eq!(
            pool.get(&lease.instance_id).await.unwrap().status,
            ContainerStatus::Running
        );

        pool.release(&lease).await;
        assert_eq!(
            pool.get(&lease.instance_id).await.unwrap().status,
            ContainerStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_acquire_prefers_hot() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        pool.prepare("recon", false).await.unwrap();
        let lease = pool.acquire("recon", None).await.unwrap();
        assert_eq!(lease.template, "kali");
        pool.release(&lease).await;
    }

    #[tokio::test]
    async fn test_ttl_evicts_idle_warm_but_never_hot() {
        let settings = PoolSettings {
            warm_ttl_secs: 0,
            ..PoolSettings::default()
        };
        let (_engine, pool) = setup(settings).await;
        pool.start_hot().await.unwrap();
        let lease = pool.acquire("warm-only", None).await.unwrap();
        pool.release(&lease).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.sweep_once().await;

        let list = pool.list().await;
        assert_eq!(list.len(), 1, "warm container should be evicted");
        assert_eq!(list[0].template, "kali"); // hot survives any idle time
    }

    #[tokio::test]
    async fn test_lease_blocks_eviction() {
        let settings = PoolSettings {
            warm_ttl_secs: 0,
            ..PoolSettings::default()
        };
        let (_engine, pool) = setup(settings).await;
        let lease = pool.acquire("warm-only", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.sweep_once().await;
        assert!(pool.get(&lease.instance_id).await.is_some());

        pool.release(&lease).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.sweep_once().await;
        assert!(pool.get(&lease.instance_id).await.is_none());
    }

    #[tokio::test]
    async fn test_cold_tier_is_ephemeral() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        let lease = pool.acquire("cold-only", None).await.unwrap();
        assert!(lease.ephemeral);
        assert!(pool.get(&lease.instance_id).await.is_some());

        pool.release(&lease).await;
        assert!(pool.get(&lease.instance_id).await.is_none());
        assert!(!engine.containers.contains_key(&lease.container_name));
    }

    #[tokio::test]
    async fn test_unhealthy_container_restarted() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        pool.start_hot().await.unwrap();
        let name = pool.list().await[0].name.clone();

        // Kill behind the pool's back
        engine.stop(&name).await.unwrap();
        pool.health_sweep_once().await;

        let list = pool.list().await;
        assert_eq!(list.len(), 1);
        assert_ne!(list[0].name, name);
        assert!(list[0].healthy);
        assert_eq!(list[0].restarts, 1);
        assert_eq!(engine.starts(), 2);
    }

    #[tokio::test]
    async fn test_startup_retries_then_success() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        engine
            .fail_starts
            .store(2, std::sync::atomic::Ordering::SeqCst);
        let report = pool.ensure_ready("warm-only").await.unwrap();
        assert!(report.all_ready);
        assert_eq!(engine.starts(), 1);
    }

    #[tokio::test]
    async fn test_startup_failure_surfaces_after_bounded_attempts() {
        let settings = PoolSettings {
            startup_retries: 2,
            ..PoolSettings::default()
        };
        let (engine, pool) = setup(settings).await;
        engine
            .fail_starts
            .store(10, std::sync::atomic::Ordering::SeqCst);
        let err = pool.ensure_ready("warm-only").await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::StartupFailed { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_detached_network_refuses_start() {
        let engine = Arc::new(MockEngine::new());
        let network = Arc::new(NetworkManager::new(engine.clone() as Arc<dyn ContainerEngine>));
        // No segments ensured
        let pool = PoolManager::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            network,
            &test_config(PoolSettings::default()),
        );
        let err = pool.start_hot().await.unwrap_err();
        assert!(matches!(err, SandboxError::StartupFailed { .. }));
        assert_eq!(engine.starts(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_and_restore() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        let lease = pool.acquire("warm-only", None).await.unwrap();

        // Mid-execution snapshots are refused
        let err = pool.snapshot(&lease.instance_id, "round-1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Busy { .. }));

        pool.release(&lease).await;
        let image = pool.snapshot(&lease.instance_id, "round-1").await.unwrap();
        assert!(image.starts_with("rk-snapshot/round-1:"));

        let restored = pool.restore(&image).await.unwrap();
        assert_eq!(restored.image, image);
        assert_eq!(restored.template, "target-web");
        assert_eq!(pool.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_unknown_snapshot() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        let err = pool.restore("rk-snapshot/ghost:00000000").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        let first = pool.create_session("s1", None).await.unwrap();
        assert_eq!(first.template, "scratch");

        // Idempotent create
        let again = pool.create_session("s1", None).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(engine.starts(), 1);

        // Session containers are preferred by acquire
        let lease = pool.acquire("recon", Some("s1")).await.unwrap();
        assert_eq!(lease.instance_id, first.id);

        let err = pool.destroy_session("s1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Busy { .. }));
        pool.release(&lease).await;
        pool.destroy_session("s1").await.unwrap();
        assert!(pool.get(&first.id).await.is_none());
    }

    #[tokio::test]
    async fn test_tier_capacity_enforced() {
        let settings = PoolSettings {
            max_per_tier: 1,
            ..PoolSettings::default()
        };
        let (_engine, pool) = setup(settings).await;
        pool.start_template("target-web", None).await.unwrap();
        // A second warm instance would exceed the cap; sessions use the
        // cold tier so only a direct duplicate start trips it.
        let err = pool
            .start_and_register(&template("target-web", PoolTier::Warm), None, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::StartupFailed { .. }));
    }

    #[tokio::test]
    async fn test_status_summary() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        pool.prepare("recon", false).await.unwrap();
        let status = pool.status().await;
        assert_eq!(status.total, 2);
        assert_eq!(status.hot, 1);
        assert_eq!(status.warm, 1);
        assert_eq!(status.ready, 2);
        assert_eq!(status.leased, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_leases() {
        let (engine, pool) = setup(PoolSettings::default()).await;
        let lease = pool.acquire("warm-only", None).await.unwrap();

        let pool_clone = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pool_clone.release(&lease).await;
        });

        pool.shutdown(Duration::from_secs(2)).await;
        assert!(pool.list().await.is_empty());
        assert!(engine.containers.iter().all(|e| !*e.value()));
    }

    #[tokio::test]
    async fn test_metrics_refresh() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        pool.start_hot().await.unwrap();
        let list = pool.list().await;
        let instance = &list[0];
        let usage = pool.metrics(&instance.name).await.unwrap();
        assert!(usage.memory_bytes > 0);
        assert!(pool.get(&instance.id).await.unwrap().usage.is_some());
    }

    #[tokio::test]
    async fn test_reload_updates_ttl_without_touching_containers() {
        let (_engine, pool) = setup(PoolSettings::default()).await;
        pool.prepare("recon", false).await.unwrap();

        let mut config = test_config(PoolSettings {
            warm_ttl_secs: 3600,
            ..PoolSettings::default()
        });
        config.profiles.remove("cold-only");
        pool.reload(&config).await;

        assert_eq!(pool.list().await.len(), 2);
        assert_eq!(pool.settings.read().await.warm_ttl_secs, 3600);
        assert!(pool.ensure_ready("cold-only").await.is_err());
    }
}
