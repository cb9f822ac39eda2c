//! Data model shared between the manager and the HTTP surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Paused,
    Stopped,
}

/// A provisioned microVM workspace. Serialized verbatim (modulo `status`,
/// which reload forces to `Stopped`) as the per-sandbox state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub sandbox_id: String,
    pub workspace_id: String,
    pub template: String,
    pub memory_mb: u32,
    pub vcpu_count: u32,
    pub status: SandboxStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub vsock_cid: u32,
    pub firecracker_pid: Option<u32>,
    pub guest_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    pub template: String,
    pub memory_mb: Option<u32>,
    pub vcpu_count: Option<u32>,
    pub workspace_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DestroyResponse {
    pub status: &'static str,
    pub sandbox_id: String,
}

#[derive(Debug, Serialize)]
pub struct PauseResponse {
    pub status: &'static str,
    pub sandbox_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sandboxes: usize,
    pub max_sandboxes: usize,
    pub memory_used_mb: u32,
    pub memory_available_mb: u32,
    pub memory_budget_mb: u32,
}

#[derive(Debug, Serialize)]
pub struct CapacityReport {
    #[serde(flatten)]
    pub health: HealthReport,
    pub can_create_default: bool,
    pub default_memory_mb: u32,
    pub default_vcpu_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    pub timeout_seconds: Option<u64>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecResponse {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub is_base64: bool,
}

#[derive(Debug, Serialize)]
pub struct WriteFileResponse {
    pub success: bool,
    pub path: Option<String>,
    pub size: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadFileResponse {
    pub success: bool,
    pub content: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadFileQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct ListFilesResponse {
    pub success: bool,
    pub entries: Option<Vec<ListEntry>>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub path: String,
}
