//! Row <-> domain-type mapping and the small string encodings used for
//! enum columns. Kept separate from `lib.rs` so the CRUD methods read as
//! queries, not column bookkeeping.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::Serialize;

use ldfd_types::component::{Component, VersionRule};
use ldfd_types::distribution::{Distribution, DistributionConfig, DistributionStatus, ImageFormat, TargetArch, Visibility};
use ldfd_types::error::LdfdError;
use ldfd_types::ids::Id;
use ldfd_types::jobs::{
    ArtifactCacheEntry, BuildJob, BuildJobStatus, BuildLog, BuildStage, BuildStageName, DownloadJob, DownloadJobStatus,
    LogLevel, StageStatus,
};
use ldfd_types::source::{ForgeType, RetrievalMethod, UpstreamSource, VersionFilter};
use ldfd_types::version::{SourceVersion, VersionType};

pub fn json<T: Serialize>(value: &T) -> super::Result<String> {
    serde_json::to_string(value).map_err(|e| LdfdError::Internal(format!("serialize: {e}")))
}

pub fn map_read_error(err: rusqlite::Error) -> LdfdError {
    LdfdError::Internal(format!("store: {err}"))
}

pub fn map_write_error(err: rusqlite::Error, kind: &str, name: &str) -> LdfdError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            LdfdError::Conflict(format!("{kind} '{name}' already exists"))
        }
        _ => LdfdError::Internal(format!("store: {err}")),
    }
}

fn parse_dt(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_dt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(parse_dt).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

// ---- Small enum <-> TEXT encodings ----------------------------------------

pub fn version_rule_to_str(rule: VersionRule) -> &'static str {
    match rule {
        VersionRule::Pinned => "pinned",
        VersionRule::LatestStable => "latest-stable",
        VersionRule::LatestLts => "latest-lts",
    }
}

fn version_rule_from_str(s: &str) -> rusqlite::Result<VersionRule> {
    match s {
        "pinned" => Ok(VersionRule::Pinned),
        "latest-stable" => Ok(VersionRule::LatestStable),
        "latest-lts" => Ok(VersionRule::LatestLts),
        other => Err(unknown_enum("version_rule", other)),
    }
}

pub fn retrieval_method_to_str(m: RetrievalMethod) -> &'static str {
    match m {
        RetrievalMethod::Release => "release",
        RetrievalMethod::Tag => "tag",
        RetrievalMethod::Branch => "branch",
        RetrievalMethod::Archive => "archive",
    }
}

fn retrieval_method_from_str(s: &str) -> rusqlite::Result<RetrievalMethod> {
    match s {
        "release" => Ok(RetrievalMethod::Release),
        "tag" => Ok(RetrievalMethod::Tag),
        "branch" => Ok(RetrievalMethod::Branch),
        "archive" => Ok(RetrievalMethod::Archive),
        other => Err(unknown_enum("retrieval_method", other)),
    }
}

pub fn forge_type_to_str(f: ForgeType) -> &'static str {
    match f {
        ForgeType::Generic => "generic",
        ForgeType::GitHub => "github",
        ForgeType::GitLab => "gitlab",
        ForgeType::Codeberg => "codeberg",
        ForgeType::KernelOrg => "kernel-org",
    }
}

fn forge_type_from_str(s: &str) -> rusqlite::Result<ForgeType> {
    match s {
        "generic" => Ok(ForgeType::Generic),
        "github" => Ok(ForgeType::GitHub),
        "gitlab" => Ok(ForgeType::GitLab),
        "codeberg" => Ok(ForgeType::Codeberg),
        "kernel-org" => Ok(ForgeType::KernelOrg),
        other => Err(unknown_enum("forge_type", other)),
    }
}

pub fn version_type_to_str(v: VersionType) -> &'static str {
    match v {
        VersionType::Stable => "stable",
        VersionType::Longterm => "longterm",
        VersionType::Mainline => "mainline",
        VersionType::LinuxNext => "linux-next",
    }
}

fn version_type_from_str(s: &str) -> rusqlite::Result<VersionType> {
    match s {
        "stable" => Ok(VersionType::Stable),
        "longterm" => Ok(VersionType::Longterm),
        "mainline" => Ok(VersionType::Mainline),
        "linux-next" => Ok(VersionType::LinuxNext),
        other => Err(unknown_enum("version_type", other)),
    }
}

pub fn visibility_to_str(v: Visibility) -> &'static str {
    match v {
        Visibility::Public => "public",
        Visibility::Private => "private",
    }
}

fn visibility_from_str(s: &str) -> rusqlite::Result<Visibility> {
    match s {
        "public" => Ok(Visibility::Public),
        "private" => Ok(Visibility::Private),
        other => Err(unknown_enum("visibility", other)),
    }
}

pub fn distribution_status_to_str(s: DistributionStatus) -> &'static str {
    match s {
        DistributionStatus::Pending => "pending",
        DistributionStatus::Ready => "ready",
        DistributionStatus::Failed => "failed",
    }
}

fn distribution_status_from_str(s: &str) -> rusqlite::Result<DistributionStatus> {
    match s {
        "pending" => Ok(DistributionStatus::Pending),
        "ready" => Ok(DistributionStatus::Ready),
        "failed" => Ok(DistributionStatus::Failed),
        other => Err(unknown_enum("distribution_status", other)),
    }
}

fn target_arch_from_str(s: &str) -> rusqlite::Result<TargetArch> {
    match s {
        "x86_64" => Ok(TargetArch::X86_64),
        "aarch64" => Ok(TargetArch::Aarch64),
        other => Err(unknown_enum("target_arch", other)),
    }
}

fn image_format_from_str(s: &str) -> rusqlite::Result<ImageFormat> {
    match s {
        "img" => Ok(ImageFormat::Raw),
        "qcow2" => Ok(ImageFormat::Qcow2),
        "iso" => Ok(ImageFormat::Iso),
        other => Err(unknown_enum("image_format", other)),
    }
}

pub fn download_status_to_str(s: DownloadJobStatus) -> &'static str {
    match s {
        DownloadJobStatus::Pending => "pending",
        DownloadJobStatus::Running => "running",
        DownloadJobStatus::Completed => "completed",
        DownloadJobStatus::Failed => "failed",
        DownloadJobStatus::Cancelled => "cancelled",
    }
}

fn download_status_from_str(s: &str) -> rusqlite::Result<DownloadJobStatus> {
    match s {
        "pending" => Ok(DownloadJobStatus::Pending),
        "running" => Ok(DownloadJobStatus::Running),
        "completed" => Ok(DownloadJobStatus::Completed),
        "failed" => Ok(DownloadJobStatus::Failed),
        "cancelled" => Ok(DownloadJobStatus::Cancelled),
        other => Err(unknown_enum("download_job_status", other)),
    }
}

pub fn build_status_to_str(s: BuildJobStatus) -> &'static str {
    match s {
        BuildJobStatus::Pending => "pending",
        BuildJobStatus::Queued => "queued",
        BuildJobStatus::Running => "running",
        BuildJobStatus::Completed => "completed",
        BuildJobStatus::Failed => "failed",
        BuildJobStatus::Cancelled => "cancelled",
    }
}

fn build_status_from_str(s: &str) -> rusqlite::Result<BuildJobStatus> {
    match s {
        "pending" => Ok(BuildJobStatus::Pending),
        "queued" => Ok(BuildJobStatus::Queued),
        "running" => Ok(BuildJobStatus::Running),
        "completed" => Ok(BuildJobStatus::Completed),
        "failed" => Ok(BuildJobStatus::Failed),
        "cancelled" => Ok(BuildJobStatus::Cancelled),
        other => Err(unknown_enum("build_job_status", other)),
    }
}

pub fn stage_status_to_str(s: StageStatus) -> &'static str {
    match s {
        StageStatus::Pending => "pending",
        StageStatus::Running => "running",
        StageStatus::Completed => "completed",
        StageStatus::Failed => "failed",
    }
}

fn stage_status_from_str(s: &str) -> rusqlite::Result<StageStatus> {
    match s {
        "pending" => Ok(StageStatus::Pending),
        "running" => Ok(StageStatus::Running),
        "completed" => Ok(StageStatus::Completed),
        "failed" => Ok(StageStatus::Failed),
        other => Err(unknown_enum("stage_status", other)),
    }
}

fn build_stage_name_from_str(s: &str) -> rusqlite::Result<BuildStageName> {
    BuildStageName::ORDER
        .iter()
        .find(|stage| stage.as_str() == s)
        .copied()
        .ok_or_else(|| unknown_enum("build_stage_name", s))
}

pub fn log_level_to_str(l: LogLevel) -> &'static str {
    match l {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn log_level_from_str(s: &str) -> rusqlite::Result<LogLevel> {
    match s {
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => Err(unknown_enum("log_level", other)),
    }
}

fn unknown_enum(column: &'static str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(format!("unknown {column}: {value}"))),
    )
}

// ---- Row readers -----------------------------------------------------------

pub fn component_from_row(row: &Row<'_>) -> rusqlite::Result<Component> {
    Ok(Component {
        id: Id::from(row.get::<_, String>("id")?),
        name: row.get("name")?,
        category: parse_json(row.get("category_json")?)?,
        is_system: row.get("is_system")?,
        is_kernel_module: row.get("is_kernel_module")?,
        is_userspace: row.get("is_userspace")?,
        artifact_template: row.get("artifact_template")?,
        default_url_template: row.get("default_url_template")?,
        forge_normalized_template: row.get("forge_normalized_template")?,
        supported_architectures: parse_json(row.get("supported_architectures_json")?)?,
        default_version: row.get("default_version")?,
        default_version_rule: version_rule_from_str(&row.get::<_, String>("default_version_rule")?)?,
    })
}

pub fn source_from_row(row: &Row<'_>) -> rusqlite::Result<UpstreamSource> {
    Ok(UpstreamSource {
        id: Id::from(row.get::<_, String>("id")?),
        name: row.get("name")?,
        url: row.get("url")?,
        component_ids: parse_json(row.get("component_ids_json")?)?,
        retrieval_method: retrieval_method_from_str(&row.get::<_, String>("retrieval_method")?)?,
        url_template: row.get("url_template")?,
        forge_type: forge_type_from_str(&row.get::<_, String>("forge_type")?)?,
        version_filter: VersionFilter::new(row.get::<_, String>("version_filter")?),
        priority: row.get("priority")?,
        enabled: row.get("enabled")?,
        is_system: row.get("is_system")?,
        owner: row.get("owner")?,
        default_version: row.get("default_version")?,
    })
}

pub fn source_version_from_row(row: &Row<'_>) -> rusqlite::Result<SourceVersion> {
    Ok(SourceVersion {
        source_id: Id::from(row.get::<_, String>("source_id")?),
        version: row.get("version")?,
        version_type: version_type_from_str(&row.get::<_, String>("version_type")?)?,
        release_date: parse_opt_dt(row.get("release_date")?)?,
        download_url: row.get("download_url")?,
        checksum: row.get("checksum")?,
        checksum_type: row.get("checksum_type")?,
        file_size: row.get("file_size")?,
        is_stable: row.get("is_stable")?,
        discovered_at: parse_dt(row.get("discovered_at")?)?,
    })
}

pub fn distribution_from_row(row: &Row<'_>) -> rusqlite::Result<Distribution> {
    Ok(Distribution {
        id: Id::from(row.get::<_, String>("id")?),
        name: row.get("name")?,
        version: row.get("version")?,
        owner: row.get("owner")?,
        visibility: visibility_from_str(&row.get::<_, String>("visibility")?)?,
        status: distribution_status_from_str(&row.get::<_, String>("status")?)?,
        config: parse_json::<DistributionConfig>(row.get("config_json")?)?,
        source_url: row.get("source_url")?,
        checksum: row.get("checksum")?,
        size_bytes: row.get("size_bytes")?,
        created_at: parse_dt(row.get("created_at")?)?,
        updated_at: parse_dt(row.get("updated_at")?)?,
    })
}

pub fn download_job_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadJob> {
    Ok(DownloadJob {
        id: Id::from(row.get::<_, String>("id")?),
        distribution: Id::from(row.get::<_, String>("distribution")?),
        owner: row.get("owner")?,
        component: Id::from(row.get::<_, String>("component")?),
        source: Id::from(row.get::<_, String>("source")?),
        resolved_url: row.get("resolved_url")?,
        version: row.get("version")?,
        expected_checksum: row.get("expected_checksum")?,
        status: download_status_from_str(&row.get::<_, String>("status")?)?,
        progress_bytes: row.get("progress_bytes")?,
        total_bytes: row.get("total_bytes")?,
        artifact_path: row.get("artifact_path")?,
        checksum: row.get("checksum")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        priority: row.get("priority")?,
        cache_hit: row.get("cache_hit")?,
        error_message: row.get("error_message")?,
        started_at: parse_opt_dt(row.get("started_at")?)?,
        completed_at: parse_opt_dt(row.get("completed_at")?)?,
    })
}

pub fn cache_entry_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactCacheEntry> {
    Ok(ArtifactCacheEntry {
        source_id: Id::from(row.get::<_, String>("source_id")?),
        version: row.get("version")?,
        checksum: row.get("checksum")?,
        cache_path: row.get("cache_path")?,
        size_bytes: row.get("size_bytes")?,
        content_type: row.get("content_type")?,
        resolved_url: row.get("resolved_url")?,
        last_used_at: parse_dt(row.get("last_used_at")?)?,
        use_count: row.get("use_count")?,
    })
}

pub fn build_job_from_row(row: &Row<'_>) -> rusqlite::Result<BuildJob> {
    let current_stage: Option<String> = row.get("current_stage")?;
    let error_stage: Option<String> = row.get("error_stage")?;
    Ok(BuildJob {
        id: Id::from(row.get::<_, String>("id")?),
        distribution: Id::from(row.get::<_, String>("distribution")?),
        owner: row.get("owner")?,
        status: build_status_from_str(&row.get::<_, String>("status")?)?,
        current_stage: current_stage.map(|s| build_stage_name_from_str(&s)).transpose()?,
        target_arch: target_arch_from_str(&row.get::<_, String>("target_arch")?)?,
        image_format: image_format_from_str(&row.get::<_, String>("image_format")?)?,
        progress_percent: row.get("progress_percent")?,
        workspace_path: row.get("workspace_path")?,
        artifact_path: row.get("artifact_path")?,
        artifact_checksum: row.get("artifact_checksum")?,
        artifact_size: row.get("artifact_size")?,
        error_stage: error_stage.map(|s| build_stage_name_from_str(&s)).transpose()?,
        error_message: row.get("error_message")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        clear_cache: row.get("clear_cache")?,
        config_snapshot: parse_json::<DistributionConfig>(row.get("config_snapshot_json")?)?,
        created_at: parse_dt(row.get("created_at")?)?,
        updated_at: parse_dt(row.get("updated_at")?)?,
    })
}

pub fn build_stage_from_row(row: &Row<'_>) -> rusqlite::Result<BuildStage> {
    Ok(BuildStage {
        build_id: Id::from(row.get::<_, String>("build_id")?),
        name: build_stage_name_from_str(&row.get::<_, String>("name")?)?,
        status: stage_status_from_str(&row.get::<_, String>("status")?)?,
        progress_percent: row.get("progress_percent")?,
        started_at: parse_opt_dt(row.get("started_at")?)?,
        completed_at: parse_opt_dt(row.get("completed_at")?)?,
        duration_ms: row.get("duration_ms")?,
        error_message: row.get("error_message")?,
        log_path: row.get("log_path")?,
    })
}

pub fn build_log_from_row(row: &Row<'_>) -> rusqlite::Result<BuildLog> {
    Ok(BuildLog {
        id: row.get::<_, i64>("id")? as u64,
        build_id: Id::from(row.get::<_, String>("build_id")?),
        stage: build_stage_name_from_str(&row.get::<_, String>("stage")?)?,
        level: log_level_from_str(&row.get::<_, String>("level")?)?,
        message: row.get("message")?,
        timestamp: parse_dt(row.get("timestamp")?)?,
    })
}
