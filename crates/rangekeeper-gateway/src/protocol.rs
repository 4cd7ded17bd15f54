//! HTTP API types — request and response bodies for the sandbox endpoints

use serde::{Deserialize, Serialize};

/// Body of `POST /sandbox/prepare`.
#[derive(Debug, Clone, Deserialize)]
pub struct PrepareRequest {
    #[serde(default)]
    pub profile: Option<String>,
    /// Recycle unleased containers before bringing the profile up.
    #[serde(default)]
    pub force_restart: bool,
}

/// Optional body of `POST /sandbox/session/{id}/create`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionCreateRequest {
    /// Template to bind; defaults to a cold-tier template.
    #[serde(default)]
    pub template: Option<String>,
}

/// Optional body of `POST /sandbox/snapshot/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default = "default_snapshot_label")]
    pub label: String,
}

fn default_snapshot_label() -> String {
    "manual".to_string()
}

impl Default for SnapshotRequest {
    fn default() -> Self {
        Self {
            label: default_snapshot_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResponse {
    pub image: String,
}

/// Query string of `GET /sandbox/security/audit-log`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }
}

/// Uniform error body; `error` is the stable machine-readable code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
