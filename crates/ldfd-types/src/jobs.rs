//! Download and build job state machines, plus the artifact cache entry
//! and append-only build log row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::distribution::{DistributionConfig, ImageFormat, TargetArch};
use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: Id,
    pub distribution: Id,
    pub owner: String,
    pub component: Id,
    pub source: Id,
    pub resolved_url: String,
    pub version: String,
    pub expected_checksum: Option<String>,
    pub status: DownloadJobStatus,
    pub progress_bytes: u64,
    pub total_bytes: Option<u64>,
    pub artifact_path: Option<String>,
    pub checksum: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i64,
    pub cache_hit: bool,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    /// The dedup key described by invariant 3: re-submission of the same
    /// `(distribution, component, source, version)` returns the existing
    /// job unless `clear_cache` is set.
    pub fn dedup_key(&self) -> (&Id, &Id, &Id, &str) {
        (&self.distribution, &self.component, &self.source, &self.version)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DownloadJobStatus::Completed | DownloadJobStatus::Failed | DownloadJobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCacheEntry {
    pub source_id: Id,
    pub version: String,
    pub checksum: String,
    pub cache_path: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub resolved_url: String,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildJobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The eight fixed stages of an image build, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStageName {
    Prepare,
    Downloads,
    Workspace,
    Toolchain,
    Kernel,
    Userspace,
    Image,
    Publish,
}

impl BuildStageName {
    pub const ORDER: [BuildStageName; 8] = [
        BuildStageName::Prepare,
        BuildStageName::Downloads,
        BuildStageName::Workspace,
        BuildStageName::Toolchain,
        BuildStageName::Kernel,
        BuildStageName::Userspace,
        BuildStageName::Image,
        BuildStageName::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStageName::Prepare => "prepare",
            BuildStageName::Downloads => "downloads",
            BuildStageName::Workspace => "workspace",
            BuildStageName::Toolchain => "toolchain",
            BuildStageName::Kernel => "kernel",
            BuildStageName::Userspace => "userspace",
            BuildStageName::Image => "image",
            BuildStageName::Publish => "publish",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStage {
    pub build_id: Id,
    pub name: BuildStageName,
    pub status: StageStatus,
    pub progress_percent: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub log_path: Option<String>,
}

impl BuildStage {
    pub fn pending(build_id: Id, name: BuildStageName) -> Self {
        Self {
            build_id,
            name,
            status: StageStatus::Pending,
            progress_percent: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Coarse classification of a line of container stdout/stderr.
    pub fn classify(line: &str) -> Self {
        let trimmed = line.trim_start();
        if trimmed.starts_with("ERROR") || trimmed.starts_with("error:") {
            LogLevel::Error
        } else if trimmed.starts_with("WARN") || trimmed.starts_with("warning:") {
            LogLevel::Warn
        } else {
            LogLevel::Info
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLog {
    /// Strictly increasing per build; see `GetLogsSince`.
    pub id: u64,
    pub build_id: Id,
    pub stage: BuildStageName,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: Id,
    pub distribution: Id,
    pub owner: String,
    pub status: BuildJobStatus,
    pub current_stage: Option<BuildStageName>,
    pub target_arch: TargetArch,
    pub image_format: ImageFormat,
    pub progress_percent: u8,
    pub workspace_path: Option<String>,
    pub artifact_path: Option<String>,
    pub artifact_checksum: Option<String>,
    pub artifact_size: Option<u64>,
    pub error_stage: Option<BuildStageName>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub clear_cache: bool,
    pub config_snapshot: DistributionConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildJob {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            BuildJobStatus::Completed | BuildJobStatus::Failed | BuildJobStatus::Cancelled
        )
    }
}
