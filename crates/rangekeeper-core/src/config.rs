//! Declarative orchestrator configuration — pool tiers, profiles, security limits
//!
//! Loaded from TOML at startup and hot-reloadable through the gateway without
//! dropping running containers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::lifecycle::PoolTier;
use crate::network::SegmentConfig;
use crate::validator::RuleSet;

/// Top-level configuration for the sandbox subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub rules: RuleSet,
    /// Container templates, assigned to a tier each.
    #[serde(default)]
    pub containers: Vec<ContainerTemplate>,
    /// Profile name → required container templates.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
    /// Network segments containers may join.
    #[serde(default)]
    pub networks: Vec<SegmentConfig>,
    /// Profile used when an execution request names none.
    #[serde(default = "default_profile")]
    pub default_profile: String,
}

fn default_profile() -> String {
    "default".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            server: ServerConfig::default(),
            pool: PoolSettings::default(),
            security: SecuritySettings::default(),
            limits: ResourceLimits::default(),
            rules: RuleSet::default(),
            containers: Vec::new(),
            profiles: HashMap::new(),
            networks: Vec::new(),
            default_profile: default_profile(),
        }
    }
}

/// How to reach the container engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_binary")]
    pub binary: String,
    /// Timeout for a single engine CLI call (not command execution).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Transient-failure retries per engine call.
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,
}

fn default_engine_binary() -> String {
    "docker".to_string()
}

fn default_call_timeout() -> u64 {
    30
}

fn default_call_retries() -> u32 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            call_timeout_secs: default_call_timeout(),
            call_retries: default_call_retries(),
        }
    }
}

/// HTTP listener settings for the gateway crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8750".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Tier policy knobs shared by the pool manager and its background sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Idle time after which a warm container is evicted. Hot containers
    /// are never TTL-evicted.
    #[serde(default = "default_warm_ttl")]
    pub warm_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_max_per_tier")]
    pub max_per_tier: usize,
    /// How long `ensure_ready` waits before reporting a readiness estimate.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
    /// Grace period for draining in-flight executions at shutdown.
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,
}

fn default_warm_ttl() -> u64 {
    900
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    60
}

fn default_max_per_tier() -> usize {
    16
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_startup_retries() -> u32 {
    3
}

fn default_drain_grace() -> u64 {
    20
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            warm_ttl_secs: default_warm_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            health_check_interval_secs: default_health_interval(),
            max_per_tier: default_max_per_tier(),
            startup_timeout_secs: default_startup_timeout(),
            startup_retries: default_startup_retries(),
            drain_grace_secs: default_drain_grace(),
        }
    }
}

/// Rate limiting, blocking, and audit settings for the security monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default = "default_rate_max")]
    pub rate_limit_max: usize,
    #[serde(default = "default_rate_window")]
    pub rate_limit_window_secs: u64,
    /// Consecutive rate-limit rejections before the user is blocked.
    #[serde(default = "default_block_after")]
    pub block_after_rejections: u32,
    /// Block duration in seconds; 0 means blocked until explicit unblock.
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,
    /// Optional JSONL mirror of the audit trail (append-only).
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
    #[serde(default = "default_max_audit")]
    pub max_audit_entries: usize,
}

fn default_rate_max() -> usize {
    100
}

fn default_rate_window() -> u64 {
    300
}

fn default_block_after() -> u32 {
    3
}

fn default_block_duration() -> u64 {
    900
}

fn default_max_audit() -> usize {
    10_000
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            rate_limit_max: default_rate_max(),
            rate_limit_window_secs: default_rate_window(),
            block_after_rejections: default_block_after(),
            block_duration_secs: default_block_duration(),
            audit_log_path: None,
            max_audit_entries: default_max_audit(),
        }
    }
}

/// Resource limits applied to a sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub max_pids: u64,
    pub max_output_bytes: usize,
    /// Default exec timeout when the caller supplies none.
    pub exec_timeout_secs: u64,
    pub read_only_root: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_shares: 512,
            max_pids: 128,
            max_output_bytes: 1024 * 1024, // 1MB
            exec_timeout_secs: 30,
            read_only_root: false,
        }
    }
}

/// A container template a pool tier instantiates from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerTemplate {
    pub name: String,
    pub image: String,
    pub tier: PoolTier,
    /// Network segment joined at creation time.
    #[serde(default = "default_segment")]
    pub network: String,
    /// Long-running entry command keeping the container alive for exec.
    #[serde(default = "default_entry_command")]
    pub command: Vec<String>,
    /// Per-template override of the global limits.
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_segment() -> String {
    "training".to_string()
}

fn default_entry_command() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

/// Containers a training profile requires before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub containers: Vec<String>,
}

impl OrchestratorConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-reference checks the TOML schema cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for template in &self.containers {
            if !seen.insert(template.name.as_str()) {
                anyhow::bail!("duplicate container template '{}'", template.name);
            }
            if !self.networks.is_empty()
                && !self.networks.iter().any(|n| n.name == template.network)
            {
                anyhow::bail!(
                    "template '{}' references unknown network segment '{}'",
                    template.name,
                    template.network
                );
            }
        }
        for (profile, members) in &self.profiles {
            for name in &members.containers {
                if !self.containers.iter().any(|t| &t.name == name) {
                    anyhow::bail!(
                        "profile '{}' references unknown container template '{}'",
                        profile,
                        name
                    );
                }
            }
        }
        for segment in &self.networks {
            segment
                .cidr
                .parse::<ipnetwork::IpNetwork>()
                .with_context(|| {
                    format!("segment '{}' has invalid CIDR '{}'", segment.name, segment.cidr)
                })?;
        }
        Ok(())
    }

    pub fn template(&self, name: &str) -> Option<&ContainerTemplate> {
        self.containers.iter().find(|t| t.name == name)
    }

    /// Resolve a profile to its required templates.
    pub fn profile_templates(&self, profile: &str) -> Option<Vec<ContainerTemplate>> {
        let members = self.profiles.get(profile)?;
        let templates: Vec<ContainerTemplate> = members
            .containers
            .iter()
            .filter_map(|name| self.template(name).cloned())
            .collect();
        Some(templates)
    }

    /// Effective limits for a template (template override or global default).
    pub fn limits_for(&self, template: &ContainerTemplate) -> ResourceLimits {
        template.limits.clone().unwrap_or_else(|| self.limits.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
default_profile = "recon"

[pool]
warm_ttl_secs = 120
sweep_interval_secs = 5

[security]
rate_limit_max = 50

[[containers]]
name = "kali"
image = "rangekeeper/kali:latest"
tier = "hot"
network = "training"

[[containers]]
name = "target-web"
image = "rangekeeper/dvwa:latest"
tier = "warm"
network = "training"

[profiles.recon]
containers = ["kali", "target-web"]

[[networks]]
name = "training"
cidr = "172.25.0.0/24"
class = "training"
"#;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.engine.binary, "docker");
        assert_eq!(config.pool.warm_ttl_secs, 900);
        assert_eq!(config.security.rate_limit_max, 100);
        assert_eq!(config.security.rate_limit_window_secs, 300);
        assert_eq!(config.default_profile, "default");
        assert!(config.containers.is_empty());
    }

    #[test]
    fn test_parse_sample() {
        let config = OrchestratorConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.containers.len(), 2);
        assert_eq!(config.pool.warm_ttl_secs, 120);
        assert_eq!(config.security.rate_limit_max, 50);
        assert_eq!(config.template("kali").unwrap().tier, PoolTier::Hot);

        let templates = config.profile_templates("recon").unwrap();
        assert_eq!(templates.len(), 2);
        assert!(config.profile_templates("missing").is_none());
    }

    #[test]
    fn test_unknown_template_in_profile_rejected() {
        let raw = r#"
[[containers]]
name = "kali"
image = "kali:latest"
tier = "hot"

[profiles.bad]
containers = ["ghost"]
"#;
        let err = OrchestratorConfig::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_template_rejected() {
        let raw = r#"
[[containers]]
name = "kali"
image = "a"
tier = "hot"

[[containers]]
name = "kali"
image = "b"
tier = "warm"
"#;
        assert!(OrchestratorConfig::from_toml(raw).is_err());
    }

    #[test]
    fn test_bad_cidr_rejected() {
        let raw = r#"
[[networks]]
name = "training"
cidr = "not-a-cidr"
class = "training"
"#;
        assert!(OrchestratorConfig::from_toml(raw).is_err());
    }

    #[test]
    fn test_unknown_segment_rejected() {
        let raw = r#"
[[containers]]
name = "kali"
image = "kali:latest"
tier = "hot"
network = "ghost-net"

[[networks]]
name = "training"
cidr = "172.25.0.0/24"
class = "training"
"#;
        let err = OrchestratorConfig::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("ghost-net"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.default_profile, "recon");
    }

    #[test]
    fn test_limits_for_override() {
        let mut config = OrchestratorConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.limits_for(config.template("kali").unwrap()).memory_mb,
            512
        );
        config.containers[0].limits = Some(ResourceLimits {
            memory_mb: 2048,
            ..ResourceLimits::default()
        });
        let template = config.template("kali").unwrap();
        assert_eq!(config.limits_for(template).memory_mb, 2048);
    }
}
