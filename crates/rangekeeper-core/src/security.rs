//! Security monitor — per-user rate limiting, breakout detection, audit trail
//!
//! Consulted by the execution gateway before and after every command. Each
//! user gets an independent sliding window of timestamps; unrelated users
//! never contend on a shared lock. The audit trail is append-only, with an
//! optional JSONL mirror on disk.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::SecuritySettings;
use crate::validator::PatternRule;

/// Audit category of a command event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Normal,
    RateLimited,
    BreakoutAttempt,
}

/// One immutable entry in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub command: String,
    pub allowed: bool,
    pub category: EventCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SecurityEvent {
    pub fn new(
        user_id: impl Into<String>,
        session_id: Option<String>,
        command: impl Into<String>,
        allowed: bool,
        category: EventCategory,
        detail: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.into(),
            session_id,
            command: command.into(),
            allowed,
            category,
            detail,
        }
    }
}

/// An active user block.
#[derive(Debug, Clone, Serialize)]
pub struct BlockEntry {
    pub cause: String,
    pub blocked_at: DateTime<Utc>,
    /// None means blocked until explicit unblock.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Summary surfaced by `GET /sandbox/security/report`. Breakout attempts are
/// reported separately from ordinary rejections since they imply intent.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityReport {
    pub generated_at: DateTime<Utc>,
    pub total_commands: usize,
    pub allowed: usize,
    pub rejected: usize,
    pub rate_limited: usize,
    pub breakout_attempts: usize,
    pub blocked_users: Vec<BlockedUser>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedUser {
    pub user_id: String,
    #[serde(flatten)]
    pub block: BlockEntry,
}

struct CompiledSignature {
    name: String,
    regex: regex::Regex,
}

fn compile_signatures(rules: &[PatternRule]) -> Vec<CompiledSignature> {
    rules
        .iter()
        .filter_map(|rule| match regex::Regex::new(&rule.pattern) {
            Ok(regex) => Some(CompiledSignature {
                name: rule.name.clone(),
                regex,
            }),
            Err(e) => {
                warn!("Failed to compile breakout signature '{}': {}", rule.name, e);
                None
            }
        })
        .collect()
}

/// Lifetime totals, kept separately from the capped audit vector so the
/// report stays accurate after old entries roll off.
#[derive(Default)]
struct AuditCounters {
    total: AtomicUsize,
    allowed: AtomicUsize,
    rate_limited: AtomicUsize,
    breakout_attempts: AtomicUsize,
}

/// The security monitor. Cheap to share behind an `Arc`.
pub struct SecurityMonitor {
    /// Per-user sliding windows of command timestamps.
    windows: DashMap<String, VecDeque<Instant>>,
    /// Consecutive rate-limit rejections per user.
    strikes: DashMap<String, u32>,
    blocks: DashMap<String, BlockEntry>,
    signatures: RwLock<Vec<CompiledSignature>>,
    settings: RwLock<SecuritySettings>,
    audit: RwLock<Vec<SecurityEvent>>,
    audit_path: RwLock<Option<PathBuf>>,
    counters: AuditCounters,
}

impl SecurityMonitor {
    pub fn new(settings: SecuritySettings, breakout_rules: &[PatternRule]) -> Self {
        let audit_path = settings.audit_log_path.clone();
        Self {
            windows: DashMap::new(),
            strikes: DashMap::new(),
            blocks: DashMap::new(),
            signatures: RwLock::new(compile_signatures(breakout_rules)),
            settings: RwLock::new(settings),
            audit: RwLock::new(Vec::new()),
            audit_path: RwLock::new(audit_path),
            counters: AuditCounters::default(),
        }
    }

    /// Swap in new settings and breakout signatures without losing the
    /// audit trail, windows, or active blocks.
    pub async fn reload(&self, settings: SecuritySettings, breakout_rules: &[PatternRule]) {
        *self.audit_path.write().await = settings.audit_log_path.clone();
        *self.signatures.write().await = compile_signatures(breakout_rules);
        *self.settings.write().await = settings;
        info!("Security monitor settings reloaded");
    }

    /// Active block for a user, if any. Expired blocks are cleared here.
    pub fn check_blocked(&self, user: &str) -> Option<String> {
        let entry = self.blocks.get(user)?;
        if let Some(expires) = entry.expires_at {
            if expires <= Utc::now() {
                drop(entry);
                self.blocks.remove(user);
                info!("Block on user '{}' expired", user);
                return None;
            }
        }
        Some(entry.cause.clone())
    }

    /// Sliding-window rate check. Expired timestamps are pruned, then the
    /// new command is either recorded or rejected. Consecutive rejections
    /// escalate to a block.
    pub async fn check_rate(&self, user: &str) -> bool {
        let (max, window, block_after) = {
            let s = self.settings.read().await;
            (
                s.rate_limit_max,
                Duration::from_secs(s.rate_limit_window_secs),
                s.block_after_rejections,
            )
        };
        let now = Instant::now();
        let cutoff = now.checked_sub(window);

        let rejected = {
            let mut entry = self.windows.entry(user.to_string()).or_default();
            let timestamps = entry.value_mut();
            if let Some(cutoff) = cutoff {
                while timestamps.front().is_some_and(|&t| t < cutoff) {
                    timestamps.pop_front();
                }
            }
            if timestamps.len() >= max {
                true
            } else {
                timestamps.push_back(now);
                false
            }
        };

        if !rejected {
            self.strikes.remove(user);
            return true;
        }

        let strikes = {
            let mut entry = self.strikes.entry(user.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        warn!(
            "Rate limit exceeded for user '{}' ({} consecutive rejections)",
            user, strikes
        );
        if strikes >= block_after {
            self.block(user, "repeated rate-limit violations").await;
        }
        false
    }

    /// Match a raw command against the breakout signature set. No side
    /// effects; dry-run checks use this directly.
    pub async fn match_breakout(&self, raw: &str) -> Option<String> {
        let signatures = self.signatures.read().await;
        signatures
            .iter()
            .find(|sig| sig.regex.is_match(raw))
            .map(|sig| sig.name.clone())
    }

    /// Match a raw command against the breakout signature set. A hit blocks
    /// the user immediately.
    pub async fn screen_breakout(&self, user: &str, raw: &str) -> Option<String> {
        let matched = self.match_breakout(raw).await;
        if let Some(name) = &matched {
            warn!(
                "Breakout attempt by user '{}': signature '{}' matched",
                user, name
            );
            self.block(user, &format!("breakout attempt ({})", name)).await;
        }
        matched
    }

    /// Block a user. Duration comes from settings; 0 means permanent.
    pub async fn block(&self, user: &str, cause: &str) {
        let duration = self.settings.read().await.block_duration_secs;
        let expires_at = if duration == 0 {
            None
        } else {
            Some(Utc::now() + chrono::Duration::seconds(duration as i64))
        };
        info!("Blocking user '{}': {}", user, cause);
        self.blocks.insert(
            user.to_string(),
            BlockEntry {
                cause: cause.to_string(),
                blocked_at: Utc::now(),
                expires_at,
            },
        );
    }

    /// Explicitly lift a block. Returns false if the user was not blocked.
    pub fn unblock(&self, user: &str) -> bool {
        self.strikes.remove(user);
        if self.blocks.remove(user).is_some() {
            info!("User '{}' unblocked", user);
            true
        } else {
            false
        }
    }

    /// Append an event to the audit trail. Entries are never mutated; when
    /// the in-memory cap is hit the oldest entries roll off (the JSONL
    /// mirror keeps everything, retention is a deployment concern).
    pub async fn record(&self, event: SecurityEvent) {
        let path = self.audit_path.read().await.clone();
        if let Some(path) = path {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    let result = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await;
                    match result {
                        Ok(mut file) => {
                            if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                                warn!("Failed to append audit log {}: {}", path.display(), e);
                            } else if let Err(e) = file.flush().await {
                                warn!("Failed to flush audit log {}: {}", path.display(), e);
                            }
                        }
                        Err(e) => warn!("Failed to open audit log {}: {}", path.display(), e),
                    }
                }
                Err(e) => warn!("Failed to serialize audit event: {}", e),
            }
        }

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if event.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        }
        match event.category {
            EventCategory::RateLimited => {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            EventCategory::BreakoutAttempt => {
                self.counters.breakout_attempts.fetch_add(1, Ordering::Relaxed);
            }
            EventCategory::Normal => {}
        }

        let max = self.settings.read().await.max_audit_entries;
        let mut audit = self.audit.write().await;
        audit.push(event);
        if audit.len() > max {
            let overflow = audit.len() - max;
            audit.drain(..overflow);
        }
        debug!("Audit trail now holds {} events", audit.len());
    }

    /// Most recent `limit` audit events, oldest first.
    pub async fn audit_log(&self, limit: usize) -> Vec<SecurityEvent> {
        let audit = self.audit.read().await;
        let start = audit.len().saturating_sub(limit);
        audit[start..].to_vec()
    }

    pub fn blocked_users(&self) -> Vec<BlockedUser> {
        self.blocks
            .iter()
            .map(|entry| BlockedUser {
                user_id: entry.key().clone(),
                block: entry.value().clone(),
            })
            .collect()
    }

    /// Lifetime totals; unaffected by the in-memory audit cap.
    pub async fn report(&self) -> SecurityReport {
        let total_commands = self.counters.total.load(Ordering::Relaxed);
        let allowed = self.counters.allowed.load(Ordering::Relaxed);
        SecurityReport {
            generated_at: Utc::now(),
            total_commands,
            allowed,
            rejected: total_commands.saturating_sub(allowed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            breakout_attempts: self.counters.breakout_attempts.load(Ordering::Relaxed),
            blocked_users: self.blocked_users(),
        }
    }
}
