use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Metadata key holding the sandbox initialization status.
pub const SANDBOX_STATUS_KEY: &str = "sandbox_status";
/// Metadata key holding the sandbox diagnostic message.
pub const SANDBOX_ERROR_KEY: &str = "sandbox_error";
pub const SANDBOX_STATUS_INITIALIZED: &str = "initialized";
pub const SANDBOX_STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_pid: Option<u32>,
    pub status: ProjectStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, description: Option<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            port,
            server_pid: None,
            status: ProjectStatus::Active,
            metadata: Map::new(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Minimal per-run view of a project used to scope file-tool access and
/// prompt context. Built fresh for every agent run; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    pub id: String,
    pub name: String,
    pub port: u16,
}

impl ProjectContext {
    pub fn from_project(project: &Project) -> Self {
        Self {
            id: project.id.clone(),
            name: project.name.clone(),
            port: project.port,
        }
    }
}

/// Result of one sandbox setup attempt. Exactly one variant is produced per
/// attempt; setup never raises past its boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SandboxOutcome {
    Started { pid: u32, message: String },
    Failed { message: String },
}

impl SandboxOutcome {
    pub fn pid(&self) -> Option<u32> {
        match self {
            SandboxOutcome::Started { pid, .. } => Some(*pid),
            SandboxOutcome::Failed { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SandboxOutcome::Started { message, .. } => message,
            SandboxOutcome::Failed { message } => message,
        }
    }
}

/// Result of a termination request. All variants are non-fatal to the
/// caller; `NotFound` means the process was already gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotFound,
    Failed { message: String },
}
