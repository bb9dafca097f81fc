//! The durable store: transactional SQLite persistence for distributions,
//! components, upstream sources, discovered versions, and the
//! download/build job pipelines.
//!
//! A single `rusqlite::Connection` behind a `Mutex` serializes writers,
//! the same shared-state idiom the rest of the workspace uses for
//! in-process concurrency (see `ldfd-lock`). SQLite is single-writer
//! regardless of how many connections a pool would hand out, so one
//! guarded connection costs nothing a pool would have bought back.

mod migrations;
mod rows;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use ldfd_types::component::Component;
use ldfd_types::distribution::{Distribution, DistributionStatus};
use ldfd_types::error::LdfdError;
use ldfd_types::ids::Id;
use ldfd_types::jobs::{
    ArtifactCacheEntry, BuildJob, BuildJobStatus, BuildLog, BuildStage, BuildStageName, DownloadJob, DownloadJobStatus,
    LogLevel, StageStatus,
};
use ldfd_types::source::UpstreamSource;
use ldfd_types::version::{SourceVersion, VersionSyncJob, VersionType};

pub type Result<T> = std::result::Result<T, LdfdError>;

/// Everything the caller needs to enqueue a new download, prior to it
/// being assigned an id and timestamps by the store.
#[derive(Debug, Clone)]
pub struct NewDownloadJob {
    pub distribution: Id,
    pub owner: String,
    pub component: Id,
    pub source: Id,
    pub resolved_url: String,
    pub version: String,
    pub expected_checksum: Option<String>,
    pub max_retries: u32,
    pub priority: i64,
}

/// Rows removed by a cascading distribution delete (invariant 6), so the
/// caller can purge the matching Artifact Store keys.
#[derive(Debug, Default)]
pub struct CascadeDeleteOutcome {
    pub removed_artifact_paths: Vec<String>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LdfdError::Internal(format!("create db dir: {e}")))?;
        }
        let mut conn = Connection::open(path).map_err(|e| LdfdError::Internal(format!("open db: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| LdfdError::Internal(format!("set journal_mode: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| LdfdError::Internal(format!("set foreign_keys: {e}")))?;
        migrations::run(&mut conn).map_err(|e| LdfdError::Internal(format!("run migrations: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// An unpersisted store backing an in-memory SQLite connection, for
    /// tests in this crate and in downstream crates that exercise the
    /// store without touching the filesystem.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|e| LdfdError::Internal(format!("open in-memory db: {e}")))?;
        migrations::run(&mut conn).map_err(|e| LdfdError::Internal(format!("run migrations: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ---- Components ----------------------------------------------------

    pub fn create_component(&self, component: &Component) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO components (id, name, category_json, is_system, is_kernel_module, is_userspace,
                artifact_template, default_url_template, forge_normalized_template,
                supported_architectures_json, default_version, default_version_rule)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                component.id.as_str(),
                component.name,
                rows::json(&component.category)?,
                component.is_system,
                component.is_kernel_module,
                component.is_userspace,
                component.artifact_template,
                component.default_url_template,
                component.forge_normalized_template,
                rows::json(&component.supported_architectures)?,
                component.default_version,
                rows::version_rule_to_str(component.default_version_rule),
            ],
        )
        .map_err(|e| rows::map_write_error(e, "component", &component.name))?;
        Ok(())
    }

    pub fn get_component(&self, id: &Id) -> Result<Option<Component>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.query_row("SELECT * FROM components WHERE id = ?1", params![id.as_str()], rows::component_from_row)
            .optional()
            .map_err(rows::map_read_error)
    }

    pub fn list_components(&self) -> Result<Vec<Component>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn.prepare("SELECT * FROM components ORDER BY name ASC").map_err(rows::map_read_error)?;
        let rows = stmt
            .query_map([], rows::component_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)?;
        Ok(rows)
    }

    // ---- Upstream sources ------------------------------------------------

    pub fn create_source(&self, source: &UpstreamSource) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO upstream_sources (id, name, url, component_ids_json, retrieval_method, url_template,
                forge_type, version_filter, priority, enabled, is_system, owner, default_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                source.id.as_str(),
                source.name,
                source.url,
                rows::json(&source.component_ids)?,
                rows::retrieval_method_to_str(source.retrieval_method),
                source.url_template,
                rows::forge_type_to_str(source.forge_type),
                source.version_filter.as_str(),
                source.priority,
                source.enabled,
                source.is_system,
                source.owner,
                source.default_version,
            ],
        )
        .map_err(|e| rows::map_write_error(e, "upstream_source", &source.name))?;
        Ok(())
    }

    pub fn get_source(&self, id: &Id) -> Result<Option<UpstreamSource>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.query_row("SELECT * FROM upstream_sources WHERE id = ?1", params![id.as_str()], rows::source_from_row)
            .optional()
            .map_err(rows::map_read_error)
    }

    /// All configured sources, for the CLI's `source list`; system sources
    /// first (`ORDER BY is_system DESC`, matching their higher trust), then
    /// by name.
    pub fn list_sources(&self) -> Result<Vec<UpstreamSource>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM upstream_sources ORDER BY is_system DESC, name ASC")
            .map_err(rows::map_read_error)?;
        stmt.query_map([], rows::source_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)
    }

    /// Source Resolver step 1-2: enabled system sources plus
    /// the owner's own sources, restricted to those that carry
    /// `component_id`, ordered `(priority desc, is_system asc, name asc)`.
    pub fn candidate_sources_for_component(&self, component_id: &Id, owner: &str) -> Result<Vec<UpstreamSource>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM upstream_sources WHERE enabled = 1 AND (is_system = 1 OR owner = ?1)")
            .map_err(rows::map_read_error)?;
        let mut candidates = stmt
            .query_map(params![owner], rows::source_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)?;
        candidates.retain(|s| s.component_ids.contains(component_id));
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.is_system.cmp(&b.is_system))
                .then(a.name.cmp(&b.name))
        });
        Ok(candidates)
    }

    fn delete_non_system_sources_for_owner(conn: &Connection, owner: &str) -> rusqlite::Result<()> {
        conn.execute("DELETE FROM upstream_sources WHERE owner = ?1 AND is_system = 0", params![owner])?;
        Ok(())
    }

    // ---- Source versions -------------------------------------------------

    /// Upsert per invariant 1: re-discovery updates metadata but never the
    /// original row's `discovered_at`. Returns `true` if this was a new
    /// row (for the sync job's `versions_new` counter).
    pub fn upsert_source_version(&self, version: &SourceVersion) -> Result<bool> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let existing_discovered_at: Option<String> = conn
            .query_row(
                "SELECT discovered_at FROM source_versions WHERE source_id = ?1 AND version = ?2",
                params![version.source_id.as_str(), version.version],
                |row| row.get(0),
            )
            .optional()
            .map_err(rows::map_read_error)?;

        let is_new = existing_discovered_at.is_none();
        let discovered_at = existing_discovered_at.unwrap_or_else(|| version.discovered_at.to_rfc3339());

        conn.execute(
            "INSERT INTO source_versions (source_id, version, version_type, release_date, download_url, checksum,
                checksum_type, file_size, is_stable, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (source_id, version) DO UPDATE SET
                version_type = excluded.version_type,
                release_date = excluded.release_date,
                download_url = excluded.download_url,
                checksum = excluded.checksum,
                checksum_type = excluded.checksum_type,
                file_size = excluded.file_size,
                is_stable = excluded.is_stable",
            params![
                version.source_id.as_str(),
                version.version,
                rows::version_type_to_str(version.version_type),
                version.release_date.map(|d| d.to_rfc3339()),
                version.download_url,
                version.checksum,
                version.checksum_type,
                version.file_size,
                version.is_stable,
                discovered_at,
            ],
        )
        .map_err(rows::map_read_error)?;
        Ok(is_new)
    }

    pub fn list_source_versions(&self, source_id: &Id) -> Result<Vec<SourceVersion>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM source_versions WHERE source_id = ?1")
            .map_err(rows::map_read_error)?;
        let rows = stmt
            .query_map(params![source_id.as_str()], rows::source_version_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)?;
        Ok(rows)
    }

    /// The resolver's `latest-stable`/`latest-lts` lookup: highest-ordered
    /// `SourceVersion` for `source_id` restricted to `version_type`.
    pub fn highest_version_of_type(&self, source_id: &Id, version_type: VersionType) -> Result<Option<SourceVersion>> {
        let versions = self.list_source_versions(source_id)?;
        let filtered: Vec<_> = versions.into_iter().filter(|v| v.version_type == version_type).collect();
        Ok(ldfd_types::version::highest_version(&filtered).cloned())
    }

    pub fn get_source_version(&self, source_id: &Id, version: &str) -> Result<Option<SourceVersion>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.query_row(
            "SELECT * FROM source_versions WHERE source_id = ?1 AND version = ?2",
            params![source_id.as_str(), version],
            rows::source_version_from_row,
        )
        .optional()
        .map_err(rows::map_read_error)
    }

    // ---- Version sync jobs -------------------------------------------------

    /// Enforces invariant 2: fails with `SyncInProgress` if a pending or
    /// running job already exists for this source.
    pub fn try_start_sync(&self, source_id: &Id) -> Result<VersionSyncJob> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction().map_err(rows::map_read_error)?;

        let in_flight: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM version_sync_jobs WHERE source_id = ?1 AND status IN ('pending', 'running')",
                params![source_id.as_str()],
                |row| row.get(0),
            )
            .map_err(rows::map_read_error)?;
        if in_flight > 0 {
            return Err(LdfdError::SyncInProgress(source_id.to_string()));
        }

        let job = VersionSyncJob {
            id: Id::new(),
            source_id: source_id.clone(),
            status: ldfd_types::version::SyncJobStatus::Running,
            versions_found: 0,
            versions_new: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
        };
        tx.execute(
            "INSERT INTO version_sync_jobs (id, source_id, status, versions_found, versions_new, started_at, completed_at, error_message)
             VALUES (?1, ?2, 'running', 0, 0, ?3, NULL, NULL)",
            params![job.id.as_str(), job.source_id.as_str(), job.started_at.map(|d| d.to_rfc3339())],
        )
        .map_err(rows::map_read_error)?;
        tx.commit().map_err(rows::map_read_error)?;
        Ok(job)
    }

    pub fn complete_sync(&self, job_id: &Id, versions_found: u64, versions_new: u64) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE version_sync_jobs SET status = 'completed', versions_found = ?2, versions_new = ?3, completed_at = ?4
             WHERE id = ?1",
            params![job_id.as_str(), versions_found, versions_new, Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn fail_sync(&self, job_id: &Id, message: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE version_sync_jobs SET status = 'failed', error_message = ?2, completed_at = ?3 WHERE id = ?1",
            params![job_id.as_str(), message, Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    // ---- Distributions ----------------------------------------------------

    pub fn create_distribution(&self, distribution: &Distribution) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO distributions (id, name, version, owner, visibility, status, config_json, source_url,
                checksum, size_bytes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                distribution.id.as_str(),
                distribution.name,
                distribution.version,
                distribution.owner,
                rows::visibility_to_str(distribution.visibility),
                rows::distribution_status_to_str(distribution.status),
                rows::json(&distribution.config)?,
                distribution.source_url,
                distribution.checksum,
                distribution.size_bytes,
                distribution.created_at.to_rfc3339(),
                distribution.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| rows::map_write_error(e, "distribution", &distribution.name))?;
        Ok(())
    }

    pub fn get_distribution(&self, id: &Id) -> Result<Option<Distribution>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.query_row("SELECT * FROM distributions WHERE id = ?1", params![id.as_str()], rows::distribution_from_row)
            .optional()
            .map_err(rows::map_read_error)
    }

    pub fn list_distributions(&self, owner: Option<&str>) -> Result<Vec<Distribution>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = match owner {
            Some(_) => conn
                .prepare("SELECT * FROM distributions WHERE owner = ?1 ORDER BY created_at DESC")
                .map_err(rows::map_read_error)?,
            None => conn
                .prepare("SELECT * FROM distributions ORDER BY created_at DESC")
                .map_err(rows::map_read_error)?,
        };
        let rows = match owner {
            Some(owner) => stmt
                .query_map(params![owner], rows::distribution_from_row)
                .map_err(rows::map_read_error)?
                .collect::<rusqlite::Result<Vec<_>>>(),
            None => stmt
                .query_map([], rows::distribution_from_row)
                .map_err(rows::map_read_error)?
                .collect::<rusqlite::Result<Vec<_>>>(),
        }
        .map_err(rows::map_read_error)?;
        Ok(rows)
    }

    pub fn update_distribution_status(&self, id: &Id, status: DistributionStatus) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let changed = conn
            .execute(
                "UPDATE distributions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.as_str(), rows::distribution_status_to_str(status), Utc::now().to_rfc3339()],
            )
            .map_err(rows::map_read_error)?;
        if changed == 0 {
            return Err(LdfdError::NotFound { kind: "distribution", id: id.to_string() });
        }
        Ok(())
    }

    /// Cascading delete per invariant 6: removes build jobs (with their
    /// stages and logs), download jobs, and the owner's non-system
    /// upstream sources. Returns the artifact keys the caller must purge
    /// from the Artifact Store.
    pub fn delete_distribution_cascade(&self, id: &Id) -> Result<CascadeDeleteOutcome> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction().map_err(rows::map_read_error)?;

        let owner: Option<String> = tx
            .query_row("SELECT owner FROM distributions WHERE id = ?1", params![id.as_str()], |row| row.get(0))
            .optional()
            .map_err(rows::map_read_error)?;
        let Some(owner) = owner else {
            return Err(LdfdError::NotFound { kind: "distribution", id: id.to_string() });
        };

        let mut removed_artifact_paths = Vec::new();
        {
            let mut stmt = tx
                .prepare("SELECT artifact_path FROM download_jobs WHERE distribution = ?1 AND artifact_path IS NOT NULL")
                .map_err(rows::map_read_error)?;
            let paths = stmt
                .query_map(params![id.as_str()], |row| row.get::<_, String>(0))
                .map_err(rows::map_read_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(rows::map_read_error)?;
            removed_artifact_paths.extend(paths);
        }
        {
            let mut stmt = tx
                .prepare("SELECT artifact_path FROM build_jobs WHERE distribution = ?1 AND artifact_path IS NOT NULL")
                .map_err(rows::map_read_error)?;
            let paths = stmt
                .query_map(params![id.as_str()], |row| row.get::<_, String>(0))
                .map_err(rows::map_read_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(rows::map_read_error)?;
            removed_artifact_paths.extend(paths);
        }

        tx.execute(
            "DELETE FROM build_logs WHERE build_id IN (SELECT id FROM build_jobs WHERE distribution = ?1)",
            params![id.as_str()],
        )
        .map_err(rows::map_read_error)?;
        tx.execute(
            "DELETE FROM build_stages WHERE build_id IN (SELECT id FROM build_jobs WHERE distribution = ?1)",
            params![id.as_str()],
        )
        .map_err(rows::map_read_error)?;
        tx.execute("DELETE FROM build_jobs WHERE distribution = ?1", params![id.as_str()])
            .map_err(rows::map_read_error)?;
        tx.execute("DELETE FROM download_jobs WHERE distribution = ?1", params![id.as_str()])
            .map_err(rows::map_read_error)?;
        Self::delete_non_system_sources_for_owner(&tx, &owner).map_err(rows::map_read_error)?;
        tx.execute("DELETE FROM distributions WHERE id = ?1", params![id.as_str()])
            .map_err(rows::map_read_error)?;

        tx.commit().map_err(rows::map_read_error)?;
        Ok(CascadeDeleteOutcome { removed_artifact_paths })
    }

    // ---- Download jobs ----------------------------------------------------

    /// Invariant 3: re-submission of the same `(distribution, component,
    /// source, version)` returns the existing job unless `clear_cache`.
    /// Returns `(job, was_created)`.
    pub fn find_or_create_download_job(&self, new: NewDownloadJob, clear_cache: bool) -> Result<(DownloadJob, bool)> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction().map_err(rows::map_read_error)?;

        if !clear_cache {
            let existing = tx
                .query_row(
                    "SELECT * FROM download_jobs WHERE distribution = ?1 AND component = ?2 AND source = ?3 AND version = ?4",
                    params![new.distribution.as_str(), new.component.as_str(), new.source.as_str(), new.version],
                    rows::download_job_from_row,
                )
                .optional()
                .map_err(rows::map_read_error)?;
            if let Some(existing) = existing {
                tx.commit().map_err(rows::map_read_error)?;
                return Ok((existing, false));
            }
        }

        let job = DownloadJob {
            id: Id::new(),
            distribution: new.distribution,
            owner: new.owner,
            component: new.component,
            source: new.source,
            resolved_url: new.resolved_url,
            version: new.version,
            expected_checksum: new.expected_checksum,
            status: DownloadJobStatus::Pending,
            progress_bytes: 0,
            total_bytes: None,
            artifact_path: None,
            checksum: None,
            retry_count: 0,
            max_retries: new.max_retries,
            priority: new.priority,
            cache_hit: false,
            error_message: None,
            started_at: None,
            completed_at: None,
        };
        tx.execute(
            "INSERT INTO download_jobs (id, distribution, owner, component, source, resolved_url, version,
                expected_checksum, status, progress_bytes, total_bytes, artifact_path, checksum, retry_count,
                max_retries, priority, cache_hit, error_message, started_at, completed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0, NULL, NULL, NULL, 0, ?9, ?10, 0, NULL, NULL, NULL, ?11)",
            params![
                job.id.as_str(),
                job.distribution.as_str(),
                job.owner,
                job.component.as_str(),
                job.source.as_str(),
                job.resolved_url,
                job.version,
                job.expected_checksum,
                job.max_retries,
                job.priority,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(rows::map_read_error)?;
        tx.commit().map_err(rows::map_read_error)?;
        Ok((job, true))
    }

    /// Every download job ever submitted for a distribution, regardless of
    /// status; the build manager's `downloads` stage uses this to check
    /// that all of them reached `completed`.
    pub fn list_download_jobs_for_distribution(&self, distribution: &Id) -> Result<Vec<DownloadJob>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM download_jobs WHERE distribution = ?1 ORDER BY created_at ASC")
            .map_err(rows::map_read_error)?;
        let rows = stmt
            .query_map(params![distribution.as_str()], rows::download_job_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)?;
        Ok(rows)
    }

    /// Workers pull `(priority desc, created_at asc)`.
    pub fn next_pending_download_jobs(&self, limit: usize) -> Result<Vec<DownloadJob>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM download_jobs WHERE status = 'pending' ORDER BY priority DESC, created_at ASC LIMIT ?1")
            .map_err(rows::map_read_error)?;
        let rows = stmt
            .query_map(params![limit as i64], rows::download_job_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)?;
        Ok(rows)
    }

    pub fn mark_download_running(&self, id: &Id) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE download_jobs SET status = 'running', started_at = ?2 WHERE id = ?1",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn update_download_progress(&self, id: &Id, progress_bytes: u64, total_bytes: Option<u64>) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE download_jobs SET progress_bytes = ?2, total_bytes = COALESCE(?3, total_bytes) WHERE id = ?1",
            params![id.as_str(), progress_bytes, total_bytes],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn complete_download_job(&self, id: &Id, artifact_path: &str, checksum: &str, total_bytes: u64, cache_hit: bool) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE download_jobs SET status = 'completed', artifact_path = ?2, checksum = ?3, total_bytes = ?4,
                progress_bytes = ?4, cache_hit = ?5, completed_at = ?6 WHERE id = ?1",
            params![id.as_str(), artifact_path, checksum, total_bytes, cache_hit, Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn set_download_status(&self, id: &Id, status: DownloadJobStatus, retry_count: Option<u32>, error_message: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE download_jobs SET status = ?2, retry_count = COALESCE(?3, retry_count),
                error_message = COALESCE(?4, error_message) WHERE id = ?1",
            params![id.as_str(), rows::download_status_to_str(status), retry_count, error_message],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    /// Crash recovery: requeue `running` jobs to `pending`,
    /// clearing `started_at` but preserving `retry_count`.
    pub fn requeue_running_download_jobs(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let changed = conn
            .execute("UPDATE download_jobs SET status = 'pending', started_at = NULL WHERE status = 'running'", [])
            .map_err(rows::map_read_error)?;
        Ok(changed as u64)
    }

    // ---- Artifact cache ----------------------------------------------------

    pub fn get_cache_entry(&self, source_id: &Id, version: &str) -> Result<Option<ArtifactCacheEntry>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.query_row(
            "SELECT * FROM artifact_cache_entries WHERE source_id = ?1 AND version = ?2",
            params![source_id.as_str(), version],
            rows::cache_entry_from_row,
        )
        .optional()
        .map_err(rows::map_read_error)
    }

    /// Invariant 7: checksum, once non-empty, is immutable; a mismatch
    /// invalidates the entry rather than being silently overwritten.
    pub fn put_cache_entry(&self, entry: &ArtifactCacheEntry) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        if let Some(existing) = conn
            .query_row(
                "SELECT checksum FROM artifact_cache_entries WHERE source_id = ?1 AND version = ?2",
                params![entry.source_id.as_str(), entry.version],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(rows::map_read_error)?
            && !existing.is_empty()
            && existing != entry.checksum
        {
            return Err(LdfdError::ChecksumMismatch { expected: existing, actual: entry.checksum.clone() });
        }

        conn.execute(
            "INSERT INTO artifact_cache_entries (source_id, version, checksum, cache_path, size_bytes, content_type,
                resolved_url, last_used_at, use_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
             ON CONFLICT (source_id, version) DO UPDATE SET
                checksum = excluded.checksum,
                cache_path = excluded.cache_path,
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type,
                resolved_url = excluded.resolved_url,
                last_used_at = excluded.last_used_at,
                use_count = artifact_cache_entries.use_count + 1",
            params![
                entry.source_id.as_str(),
                entry.version,
                entry.checksum,
                entry.cache_path,
                entry.size_bytes,
                entry.content_type,
                entry.resolved_url,
                entry.last_used_at.to_rfc3339(),
            ],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn invalidate_cache_entry(&self, source_id: &Id, version: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "DELETE FROM artifact_cache_entries WHERE source_id = ?1 AND version = ?2",
            params![source_id.as_str(), version],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    // ---- Build jobs ----------------------------------------------------

    /// Creates the `BuildJob` row plus all eight `BuildStage` rows pending,
    /// per invariant 4 (stages form a totally ordered sequence).
    pub fn create_build_job(&self, job: &BuildJob) -> Result<()> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction().map_err(rows::map_read_error)?;
        tx.execute(
            "INSERT INTO build_jobs (id, distribution, owner, status, current_stage, target_arch, image_format,
                progress_percent, workspace_path, artifact_path, artifact_checksum, artifact_size, error_stage,
                error_message, retry_count, max_retries, clear_cache, config_snapshot_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                job.id.as_str(),
                job.distribution.as_str(),
                job.owner,
                rows::build_status_to_str(job.status),
                job.current_stage.map(|s| s.as_str()),
                job.target_arch.as_str(),
                job.image_format.extension(),
                job.progress_percent,
                job.workspace_path,
                job.artifact_path,
                job.artifact_checksum,
                job.artifact_size,
                job.error_stage.map(|s| s.as_str()),
                job.error_message,
                job.retry_count,
                job.max_retries,
                job.clear_cache,
                rows::json(&job.config_snapshot)?,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .map_err(rows::map_read_error)?;

        for stage in BuildStageName::ORDER {
            tx.execute(
                "INSERT INTO build_stages (build_id, name, status, progress_percent, started_at, completed_at,
                    duration_ms, error_message, log_path)
                 VALUES (?1, ?2, 'pending', 0, NULL, NULL, NULL, NULL, NULL)",
                params![job.id.as_str(), stage.as_str()],
            )
            .map_err(rows::map_read_error)?;
        }
        tx.commit().map_err(rows::map_read_error)?;
        Ok(())
    }

    /// All build jobs for `owner` (or every owner, if `None`), newest first,
    /// for the CLI's `build list` and operator dashboards.
    pub fn list_build_jobs(&self, owner: Option<&str>) -> Result<Vec<BuildJob>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = match owner {
            Some(_) => conn
                .prepare("SELECT * FROM build_jobs WHERE owner = ?1 ORDER BY created_at DESC")
                .map_err(rows::map_read_error)?,
            None => conn
                .prepare("SELECT * FROM build_jobs ORDER BY created_at DESC")
                .map_err(rows::map_read_error)?,
        };
        match owner {
            Some(owner) => stmt
                .query_map(params![owner], rows::build_job_from_row)
                .map_err(rows::map_read_error)?
                .collect::<rusqlite::Result<Vec<_>>>(),
            None => stmt
                .query_map([], rows::build_job_from_row)
                .map_err(rows::map_read_error)?
                .collect::<rusqlite::Result<Vec<_>>>(),
        }
        .map_err(rows::map_read_error)
    }

    pub fn get_build_job(&self, id: &Id) -> Result<Option<BuildJob>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.query_row("SELECT * FROM build_jobs WHERE id = ?1", params![id.as_str()], rows::build_job_from_row)
            .optional()
            .map_err(rows::map_read_error)
    }

    pub fn list_build_stages(&self, build_id: &Id) -> Result<Vec<BuildStage>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM build_stages WHERE build_id = ?1")
            .map_err(rows::map_read_error)?;
        let mut stages = stmt
            .query_map(params![build_id.as_str()], rows::build_stage_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)?;
        stages.sort_by_key(|s| s.name);
        Ok(stages)
    }

    pub fn update_build_job_status(&self, id: &Id, status: BuildJobStatus) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE build_jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), rows::build_status_to_str(status), Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn set_current_stage(&self, id: &Id, stage: Option<BuildStageName>) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE build_jobs SET current_stage = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), stage.map(|s| s.as_str()), Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn update_stage(&self, build_id: &Id, stage: &BuildStage) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE build_stages SET status = ?3, progress_percent = ?4, started_at = ?5, completed_at = ?6,
                duration_ms = ?7, error_message = ?8, log_path = ?9
             WHERE build_id = ?1 AND name = ?2",
            params![
                build_id.as_str(),
                stage.name.as_str(),
                rows::stage_status_to_str(stage.status),
                stage.progress_percent,
                stage.started_at.map(|d| d.to_rfc3339()),
                stage.completed_at.map(|d| d.to_rfc3339()),
                stage.duration_ms,
                stage.error_message,
                stage.log_path,
            ],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn set_build_failure(&self, id: &Id, stage: BuildStageName, message: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE build_jobs SET status = 'failed', error_stage = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
            params![id.as_str(), stage.as_str(), message, Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    pub fn complete_build(&self, id: &Id, artifact_path: &str, checksum: &str, size: u64) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "UPDATE build_jobs SET status = 'completed', current_stage = NULL, progress_percent = 100,
                artifact_path = ?2, artifact_checksum = ?3, artifact_size = ?4, updated_at = ?5 WHERE id = ?1",
            params![id.as_str(), artifact_path, checksum, size, Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        Ok(())
    }

    /// `RetryBuild(id)`: valid only from `failed`; resets
    /// stages past the failing one to `pending`, bumps `retry_count`
    /// bounded by `max_retries`.
    pub fn retry_build_job(&self, id: &Id) -> Result<BuildJob> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction().map_err(rows::map_read_error)?;

        let job = tx
            .query_row("SELECT * FROM build_jobs WHERE id = ?1", params![id.as_str()], rows::build_job_from_row)
            .optional()
            .map_err(rows::map_read_error)?
            .ok_or_else(|| LdfdError::NotFound { kind: "build_job", id: id.to_string() })?;

        if job.status != BuildJobStatus::Failed {
            return Err(LdfdError::Conflict(format!("build {id} is not in failed state")));
        }
        if job.retry_count >= job.max_retries {
            return Err(LdfdError::RetryExhausted);
        }
        let failing_stage = job.error_stage.ok_or_else(|| LdfdError::Internal("failed build has no error_stage".into()))?;

        for stage in BuildStageName::ORDER.iter().filter(|s| **s >= failing_stage) {
            tx.execute(
                "UPDATE build_stages SET status = 'pending', progress_percent = 0, started_at = NULL,
                    completed_at = NULL, duration_ms = NULL, error_message = NULL WHERE build_id = ?1 AND name = ?2",
                params![id.as_str(), stage.as_str()],
            )
            .map_err(rows::map_read_error)?;
        }

        tx.execute(
            "UPDATE build_jobs SET status = 'pending', current_stage = ?2, error_stage = NULL, error_message = NULL,
                retry_count = retry_count + 1, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), failing_stage.as_str(), Utc::now().to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        tx.commit().map_err(rows::map_read_error)?;

        self.get_build_job(id)?.ok_or_else(|| LdfdError::Internal("build job vanished after retry".into()))
    }

    /// Crash recovery, mirroring `requeue_running_download_jobs`.
    pub fn requeue_running_build_jobs(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let changed = conn
            .execute("UPDATE build_jobs SET status = 'pending' WHERE status = 'running'", [])
            .map_err(rows::map_read_error)?;
        Ok(changed as u64)
    }

    pub fn append_build_log(&self, build_id: &Id, stage: BuildStageName, level: LogLevel, message: &str) -> Result<BuildLog> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let timestamp = Utc::now();
        conn.execute(
            "INSERT INTO build_logs (build_id, stage, level, message, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![build_id.as_str(), stage.as_str(), rows::log_level_to_str(level), message, timestamp.to_rfc3339()],
        )
        .map_err(rows::map_read_error)?;
        let id = conn.last_insert_rowid();
        Ok(BuildLog { id: id as u64, build_id: build_id.clone(), stage, level, message: message.to_string(), timestamp })
    }

    pub fn list_build_logs_since(&self, build_id: &Id, since_id: u64) -> Result<Vec<BuildLog>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM build_logs WHERE build_id = ?1 AND id > ?2 ORDER BY id ASC")
            .map_err(rows::map_read_error)?;
        let rows = stmt
            .query_map(params![build_id.as_str(), since_id as i64], rows::build_log_from_row)
            .map_err(rows::map_read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(rows::map_read_error)?;
        Ok(rows)
    }
}

/// Helper used by the resolver to validate a component selection against
/// `supported_architectures` without round-tripping through JSON at the
/// call site.
pub fn architectures_from_json(json: &str) -> BTreeSet<String> {
    serde_json::from_str(json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldfd_types::component::VersionRule;
    use ldfd_types::distribution::{DistributionConfig, ImageFormat, KernelConfigMode, TargetArch, Visibility};
    use ldfd_types::source::{ForgeType, RetrievalMethod, VersionFilter};

    fn sample_component() -> Component {
        Component {
            id: Id::new(),
            name: "kernel".into(),
            category: ["kernel"].into_iter().map(String::from).collect(),
            is_system: true,
            is_kernel_module: false,
            is_userspace: false,
            artifact_template: "linux-{version}.tar.xz".into(),
            default_url_template: Some("{base_url}/linux-{version}.tar.xz".into()),
            forge_normalized_template: None,
            supported_architectures: ["x86_64"].into_iter().map(String::from).collect(),
            default_version: Some("6.12.3".into()),
            default_version_rule: VersionRule::LatestLts,
        }
    }

    fn sample_source(owner: Option<&str>, is_system: bool, component: &Id) -> UpstreamSource {
        UpstreamSource {
            id: Id::new(),
            name: "kernel.org".into(),
            url: "https://cdn.kernel.org/pub/linux/kernel".into(),
            component_ids: [component.clone()].into_iter().collect(),
            retrieval_method: RetrievalMethod::Archive,
            url_template: Some("{base_url}/v6.x/linux-{version}.tar.xz".into()),
            forge_type: ForgeType::KernelOrg,
            version_filter: VersionFilter::new(""),
            priority: 0,
            enabled: true,
            is_system,
            owner: owner.map(String::from),
            default_version: None,
        }
    }

    fn sample_distribution(owner: &str, component: &Id) -> Distribution {
        let now = Utc::now();
        Distribution {
            id: Id::new(),
            name: format!("dist-{}", Id::new()),
            version: "1.0".into(),
            owner: owner.into(),
            visibility: Visibility::Private,
            status: DistributionStatus::Pending,
            config: DistributionConfig {
                kernel_config: KernelConfigMode::Overlay { fragments: Default::default() },
                components: vec![ldfd_types::distribution::SelectedComponent {
                    component_id: component.clone(),
                    resolved_version: None,
                }],
                bootloader: None,
                init: None,
                target_arch: TargetArch::X86_64,
                image_format: ImageFormat::Qcow2,
                board_profile: None,
                toolchain_profile: None,
            },
            source_url: None,
            checksum: None,
            size_bytes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn component_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let fetched = store.get_component(&component.id).unwrap().unwrap();
        assert_eq!(fetched.name, "kernel");
        assert_eq!(fetched.default_version_rule, VersionRule::LatestLts);
        assert!(fetched.supports_arch("x86_64"));
    }

    #[test]
    fn candidate_sources_orders_by_priority_then_system_then_name() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();

        let mut system_source = sample_source(None, true, &component.id);
        system_source.name = "zz-system".into();
        system_source.priority = 0;
        let mut user_source = sample_source(Some("alice"), false, &component.id);
        user_source.name = "aa-user".into();
        user_source.priority = 0;
        store.create_source(&system_source).unwrap();
        store.create_source(&user_source).unwrap();

        let candidates = store.candidate_sources_for_component(&component.id, "alice").unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, user_source.id, "user override should win the tie via is_system asc");
    }

    #[test]
    fn sync_slot_invariant_rejects_concurrent_sync() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let source = sample_source(None, true, &component.id);
        store.create_source(&source).unwrap();

        store.try_start_sync(&source.id).unwrap();
        let err = store.try_start_sync(&source.id).unwrap_err();
        assert!(matches!(err, LdfdError::SyncInProgress(_)));
    }

    #[test]
    fn sync_slot_reopens_after_completion() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let source = sample_source(None, true, &component.id);
        store.create_source(&source).unwrap();

        let job = store.try_start_sync(&source.id).unwrap();
        store.complete_sync(&job.id, 5, 2).unwrap();
        store.try_start_sync(&source.id).unwrap();
    }

    #[test]
    fn upsert_source_version_preserves_original_discovered_at() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let source = sample_source(None, true, &component.id);
        store.create_source(&source).unwrap();

        let earlier = Utc::now() - chrono::Duration::hours(2);
        let mut version = SourceVersion {
            source_id: source.id.clone(),
            version: "6.12.3".into(),
            version_type: VersionType::Longterm,
            release_date: None,
            download_url: None,
            checksum: None,
            checksum_type: None,
            file_size: None,
            is_stable: false,
            discovered_at: earlier,
        };
        assert!(store.upsert_source_version(&version).unwrap());

        version.discovered_at = Utc::now();
        version.checksum = Some("deadbeef".into());
        assert!(!store.upsert_source_version(&version).unwrap());

        let stored = store.get_source_version(&source.id, "6.12.3").unwrap().unwrap();
        assert_eq!(stored.discovered_at, earlier);
        assert_eq!(stored.checksum.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn download_job_dedup_returns_existing_job() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let source = sample_source(None, true, &component.id);
        store.create_source(&source).unwrap();
        let distribution = sample_distribution("alice", &component.id);
        store.create_distribution(&distribution).unwrap();

        let new = NewDownloadJob {
            distribution: distribution.id.clone(),
            owner: "alice".into(),
            component: component.id.clone(),
            source: source.id.clone(),
            resolved_url: "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.12.3.tar.xz".into(),
            version: "6.12.3".into(),
            expected_checksum: None,
            max_retries: 3,
            priority: 0,
        };
        let (first, created_first) = store.find_or_create_download_job(new.clone(), false).unwrap();
        assert!(created_first);
        let (second, created_second) = store.find_or_create_download_job(new.clone(), false).unwrap();
        assert!(!created_second);
        assert_eq!(first.id, second.id);

        let (third, created_third) = store.find_or_create_download_job(new, true).unwrap();
        assert!(created_third);
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn cache_entry_checksum_mismatch_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let entry = ArtifactCacheEntry {
            source_id: Id::new(),
            version: "6.12.3".into(),
            checksum: "aaaa".into(),
            cache_path: "_cache/src/6.12.3".into(),
            size_bytes: 10,
            content_type: None,
            resolved_url: "https://example.test/linux-6.12.3.tar.xz".into(),
            last_used_at: Utc::now(),
            use_count: 1,
        };
        store.put_cache_entry(&entry).unwrap();

        let mut mismatched = entry.clone();
        mismatched.checksum = "bbbb".into();
        let err = store.put_cache_entry(&mismatched).unwrap_err();
        assert!(matches!(err, LdfdError::ChecksumMismatch { .. }));

        store.invalidate_cache_entry(&entry.source_id, &entry.version).unwrap();
        store.put_cache_entry(&mismatched).unwrap();
    }

    #[test]
    fn cascading_delete_removes_jobs_and_nonsystem_sources() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let system_source = sample_source(None, true, &component.id);
        let mut user_source = sample_source(Some("alice"), false, &component.id);
        user_source.name = "alice-mirror".into();
        store.create_source(&system_source).unwrap();
        store.create_source(&user_source).unwrap();

        let distribution = sample_distribution("alice", &component.id);
        store.create_distribution(&distribution).unwrap();

        let new = NewDownloadJob {
            distribution: distribution.id.clone(),
            owner: "alice".into(),
            component: component.id.clone(),
            source: system_source.id.clone(),
            resolved_url: "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.12.3.tar.xz".into(),
            version: "6.12.3".into(),
            expected_checksum: None,
            max_retries: 3,
            priority: 0,
        };
        store.find_or_create_download_job(new, false).unwrap();

        let outcome = store.delete_distribution_cascade(&distribution.id).unwrap();
        assert!(outcome.removed_artifact_paths.is_empty(), "no artifact was ever promoted in this test");

        assert!(store.get_distribution(&distribution.id).unwrap().is_none());
        assert!(store.get_source(&user_source.id).unwrap().is_none(), "non-system owner source must be cascaded");
        assert!(store.get_source(&system_source.id).unwrap().is_some(), "system sources survive cascade");

        let remaining_jobs = store.next_pending_download_jobs(10).unwrap();
        assert!(remaining_jobs.is_empty());
    }

    #[test]
    fn build_job_retry_resets_failing_stage_onward() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let distribution = sample_distribution("alice", &component.id);
        store.create_distribution(&distribution).unwrap();

        let now = Utc::now();
        let build = BuildJob {
            id: Id::new(),
            distribution: distribution.id.clone(),
            owner: "alice".into(),
            status: BuildJobStatus::Running,
            current_stage: Some(BuildStageName::Kernel),
            target_arch: TargetArch::X86_64,
            image_format: ImageFormat::Qcow2,
            progress_percent: 40,
            workspace_path: Some("/var/lib/ldfd/workspaces/abc".into()),
            artifact_path: None,
            artifact_checksum: None,
            artifact_size: None,
            error_stage: None,
            error_message: None,
            retry_count: 0,
            max_retries: 1,
            clear_cache: false,
            config_snapshot: distribution.config.clone(),
            created_at: now,
            updated_at: now,
        };
        store.create_build_job(&build).unwrap();
        store.set_build_failure(&build.id, BuildStageName::Kernel, "toolchain exited 1").unwrap();

        let retried = store.retry_build_job(&build.id).unwrap();
        assert_eq!(retried.status, BuildJobStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.current_stage, Some(BuildStageName::Kernel));

        let stages = store.list_build_stages(&build.id).unwrap();
        let kernel_stage = stages.iter().find(|s| s.name == BuildStageName::Kernel).unwrap();
        assert_eq!(kernel_stage.status, StageStatus::Pending);

        let err = store.retry_build_job(&build.id).unwrap_err();
        // Not failed anymore (it's pending), so the second retry is rejected as a conflict, not RetryExhausted.
        assert!(matches!(err, LdfdError::Conflict(_)));
    }

    #[test]
    fn build_logs_append_and_list_since() {
        let store = Store::open_in_memory().unwrap();
        let component = sample_component();
        store.create_component(&component).unwrap();
        let distribution = sample_distribution("alice", &component.id);
        store.create_distribution(&distribution).unwrap();
        let now = Utc::now();
        let build = BuildJob {
            id: Id::new(),
            distribution: distribution.id.clone(),
            owner: "alice".into(),
            status: BuildJobStatus::Running,
            current_stage: Some(BuildStageName::Prepare),
            target_arch: TargetArch::X86_64,
            image_format: ImageFormat::Raw,
            progress_percent: 0,
            workspace_path: None,
            artifact_path: None,
            artifact_checksum: None,
            artifact_size: None,
            error_stage: None,
            error_message: None,
            retry_count: 0,
            max_retries: 1,
            clear_cache: false,
            config_snapshot: distribution.config.clone(),
            created_at: now,
            updated_at: now,
        };
        store.create_build_job(&build).unwrap();

        store.append_build_log(&build.id, BuildStageName::Prepare, LogLevel::Info, "starting").unwrap();
        let second = store.append_build_log(&build.id, BuildStageName::Prepare, LogLevel::Error, "ERROR: disk full").unwrap();

        let since_first = store.list_build_logs_since(&build.id, second.id - 1).unwrap();
        assert_eq!(since_first.len(), 1);
        assert_eq!(since_first[0].message, "ERROR: disk full");
    }
}
