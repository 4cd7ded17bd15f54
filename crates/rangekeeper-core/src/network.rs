//! Network isolation — segments and declarative firewall rules
//!
//! Two segment classes: `training` (default egress drop with an explicit
//! allow-list for the training CIDR and loopback) and `airgapped` (no
//! external connectivity at all, realized as an internal engine network).
//! Rule application is declarative and idempotent: reapplying an identical
//! rule set produces no observable change.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::engine::ContainerEngine;
use crate::error::SandboxError;

/// Isolation class of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentClass {
    Training,
    Airgapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Drop,
}

/// One declarative firewall rule. `destination` is a CIDR or `"any"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub action: RuleAction,
    pub destination: String,
}

impl FirewallRule {
    fn new(name: &str, action: RuleAction, destination: &str) -> Self {
        Self {
            name: name.to_string(),
            action,
            destination: destination.to_string(),
        }
    }
}

/// Segment definition from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub name: String,
    pub cidr: String,
    pub class: SegmentClass,
    /// Extra rules inserted before the class defaults.
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

impl SegmentConfig {
    /// The full rule set for this segment: custom rules first, then the
    /// class defaults ending in a drop-everything rule.
    pub fn effective_rules(&self) -> Vec<FirewallRule> {
        let mut rules = self.rules.clone();
        match self.class {
            SegmentClass::Training => {
                rules.push(FirewallRule::new(
                    "allow_loopback",
                    RuleAction::Allow,
                    "127.0.0.0/8",
                ));
                rules.push(FirewallRule::new(
                    "allow_training_cidr",
                    RuleAction::Allow,
                    &self.cidr,
                ));
                rules.push(FirewallRule::new("default_drop", RuleAction::Drop, "any"));
            }
            SegmentClass::Airgapped => {
                rules.push(FirewallRule::new("drop_all", RuleAction::Drop, "any"));
            }
        }
        rules
    }
}

/// Externally visible state of one segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    pub name: String,
    pub cidr: String,
    pub class: SegmentClass,
    pub attached: bool,
    pub rules: Vec<FirewallRule>,
}

struct SegmentState {
    config: SegmentConfig,
    attached: bool,
    applied_rules: Vec<FirewallRule>,
}

/// Creates and maintains isolated network segments. Independent of
/// container state; containers declare a segment at creation time and the
/// pool refuses readiness when that segment is not attached.
pub struct NetworkManager {
    engine: Arc<dyn ContainerEngine>,
    segments: RwLock<HashMap<String, SegmentState>>,
}

impl NetworkManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            segments: RwLock::new(HashMap::new()),
        }
    }

    pub async fn ensure_all(&self, configs: &[SegmentConfig]) -> Result<(), SandboxError> {
        for config in configs {
            self.ensure_segment(config).await?;
        }
        Ok(())
    }

    /// Create the segment if missing and converge its rule set. Idempotent.
    pub async fn ensure_segment(&self, config: &SegmentConfig) -> Result<(), SandboxError> {
        if !self.engine.network_exists(&config.name).await? {
            let internal = config.class == SegmentClass::Airgapped;
            self.engine
                .network_create(&config.name, &config.cidr, internal)
                .await?;
            info!(
                "Created network segment '{}' ({:?}, {})",
                config.name, config.class, config.cidr
            );
        }

        let desired = config.effective_rules();
        let mut segments = self.segments.write().await;
        let state = segments
            .entry(config.name.clone())
            .or_insert_with(|| SegmentState {
                config: config.clone(),
                attached: false,
                applied_rules: Vec::new(),
            });
        state.config = config.clone();

        if state.applied_rules == desired {
            debug!("Segment '{}' rules already converged", config.name);
        } else {
            for rule in &desired {
                if !state.applied_rules.contains(rule) {
                    info!(
                        "Segment '{}': applying rule '{}' ({:?} → {})",
                        config.name, rule.name, rule.action, rule.destination
                    );
                }
            }
            state.applied_rules = desired;
        }
        state.attached = true;
        Ok(())
    }

    /// Whether containers may join this segment right now.
    pub async fn is_attached(&self, name: &str) -> bool {
        self.segments
            .read()
            .await
            .get(name)
            .map(|s| s.attached)
            .unwrap_or(false)
    }

    pub async fn info(&self, name: &str) -> Option<SegmentInfo> {
        let segments = self.segments.read().await;
        segments.get(name).map(|state| SegmentInfo {
            name: state.config.name.clone(),
            cidr: state.config.cidr.clone(),
            class: state.config.class,
            attached: state.attached,
            rules: state.applied_rules.clone(),
        })
    }

    pub async fn list(&self) -> Vec<SegmentInfo> {
        let segments = self.segments.read().await;
        let mut infos: Vec<SegmentInfo> = segments
            .values()
            .map(|state| SegmentInfo {
                name: state.config.name.clone(),
                cidr: state.config.cidr.clone(),
                class: state.config.class,
                attached: state.attached,
                rules: state.applied_rules.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
