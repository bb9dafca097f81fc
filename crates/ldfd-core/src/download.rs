//! Download Manager: resolves a distribution's component set into
//! download jobs, fetches tarballs from upstream (honoring mirrors and a
//! shared content-addressed artifact cache), verifies checksums, and
//! persists artifacts to the configured object store.
//!
//! The worker pool pulls a bounded batch of jobs, `thread::spawn`s one
//! per job, and `.join()`s the whole batch before pulling the next. Only
//! the main thread touches the `Store`; worker threads do nothing but the
//! network transfer and hand back a [`JobOutcome`] for the main thread to
//! persist, so `Store` never needs to be shared across threads.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use ldfd_config::mirror_candidates;
use ldfd_config::MirrorConfig;
use ldfd_events::{emit, event_for, EventKind};
use ldfd_lock::KeyedLock;
use ldfd_process::CancelToken;
use ldfd_retry::{self, DOWNLOAD_DEFAULT};
use ldfd_storage::{keys, ArtifactStore};
use ldfd_store::{NewDownloadJob, Store};
use ldfd_types::component::Component;
use ldfd_types::distribution::Distribution;
use ldfd_types::error::LdfdError;
use ldfd_types::ids::Id;
use ldfd_types::jobs::{ArtifactCacheEntry, DownloadJob, DownloadJobStatus};

use crate::resolver;

/// Coordinates the bounded-concurrency worker pool and the single-flight
/// transfer guard shared by every job it runs.
pub struct DownloadManager {
    artifact_store: Arc<dyn ArtifactStore>,
    mirrors: Vec<MirrorConfig>,
    locks: KeyedLock<(Id, String)>,
}

impl DownloadManager {
    pub fn new(artifact_store: Arc<dyn ArtifactStore>, mirrors: Vec<MirrorConfig>) -> Self {
        Self {
            artifact_store,
            mirrors,
            locks: KeyedLock::new(),
        }
    }

    /// `submitForDistribution`: resolves every component the
    /// distribution references and inserts pending `DownloadJob`s in one
    /// pass, deduplicated by `(distribution, component, source, version)`
    /// unless `clear_cache` is set.
    pub fn submit_for_distribution(
        &self,
        store: &Store,
        distribution: &Distribution,
        components: &[Component],
        clear_cache: bool,
    ) -> Result<Vec<DownloadJob>, LdfdError> {
        let mut jobs = Vec::with_capacity(components.len());
        for component in components {
            let resolved = resolver::resolve_component(store, &distribution.owner, component)?;
            if clear_cache {
                store.invalidate_cache_entry(&resolved.source_id, &resolved.version)?;
            }
            let new = NewDownloadJob {
                distribution: distribution.id.clone(),
                owner: distribution.owner.clone(),
                component: component.id.clone(),
                source: resolved.source_id,
                resolved_url: resolved.resolved_url,
                version: resolved.version.clone(),
                expected_checksum: resolved.checksum,
                max_retries: DOWNLOAD_DEFAULT.max_attempts,
                priority: 0,
            };
            let (job, created) = store.find_or_create_download_job(new, clear_cache)?;
            if created {
                emit(&event_for(
                    &job.id,
                    EventKind::DownloadSubmitted {
                        component: component.name.clone(),
                        version: resolved.version,
                    },
                ));
            }
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Pulls up to `pool_size` pending jobs and runs them in bounded
    /// batches. Cache lookups and all persistence happen on this thread;
    /// only the network transfer for a cache miss runs on a worker thread.
    pub fn run_pool(&self, store: &Store, pool_size: usize, cancel: &CancelToken) -> Result<Vec<DownloadJob>, LdfdError> {
        let pending = store.next_pending_download_jobs(pool_size)?;
        let mut results = Vec::with_capacity(pending.len());

        for chunk in pending.chunks(pool_size.max(1)) {
            let mut started = Vec::with_capacity(chunk.len());
            for job in chunk {
                store.mark_download_running(&job.id)?;
                let guard = self.locks.lock((job.source.clone(), job.version.clone()));

                if let Some(entry) = store.get_cache_entry(&job.source, &job.version)? {
                    store.complete_download_job(&job.id, &entry.cache_path, &entry.checksum, entry.size_bytes, true)?;
                    emit(&event_for(
                        &job.id,
                        EventKind::DownloadCompleted {
                            cache_hit: true,
                            total_bytes: entry.size_bytes,
                        },
                    ));
                    drop(guard);
                    results.push(job.clone());
                    continue;
                }

                let job = job.clone();
                let artifact_store = self.artifact_store.clone();
                let mirrors = self.mirrors.clone();
                let cancel = cancel.clone();
                started.push((job.clone(), guard, thread::spawn(move || fetch(&artifact_store, &mirrors, &job, &cancel))));
            }

            for (job, guard, handle) in started {
                let outcome = handle.join().expect("download worker thread panicked");
                drop(guard);
                apply_outcome(store, &job, outcome)?;
                results.push(job);
            }
        }
        Ok(results)
    }
}

/// Result of attempting one job's transfer, independent of persistence.
enum JobOutcome {
    Downloaded { artifact_path: String, checksum: String, total_bytes: u64 },
    Cancelled,
    Failed(LdfdError),
}

fn apply_outcome(store: &Store, job: &DownloadJob, outcome: JobOutcome) -> Result<(), LdfdError> {
    match outcome {
        JobOutcome::Downloaded { artifact_path, checksum, total_bytes } => {
            store.complete_download_job(&job.id, &artifact_path, &checksum, total_bytes, false)?;
            let entry = ArtifactCacheEntry {
                source_id: job.source.clone(),
                version: job.version.clone(),
                checksum: checksum.clone(),
                cache_path: artifact_path,
                size_bytes: total_bytes,
                content_type: None,
                resolved_url: job.resolved_url.clone(),
                last_used_at: chrono::Utc::now(),
                use_count: 1,
            };
            store.put_cache_entry(&entry)?;
            emit(&event_for(&job.id, EventKind::DownloadCompleted { cache_hit: false, total_bytes }));
        }
        JobOutcome::Cancelled => {
            store.set_download_status(&job.id, DownloadJobStatus::Cancelled, None, None)?;
            emit(&event_for(&job.id, EventKind::DownloadCancelled));
        }
        JobOutcome::Failed(err) => {
            let retryable = err.is_retryable() && ldfd_retry::should_retry(&DOWNLOAD_DEFAULT, &err, job.retry_count);
            emit(&event_for(
                &job.id,
                EventKind::DownloadFailed {
                    message: err.to_string(),
                    retryable,
                },
            ));
            if retryable {
                let delay = ldfd_retry::backoff_delay(&DOWNLOAD_DEFAULT, job.retry_count + 1);
                thread::sleep(delay);
                store.set_download_status(&job.id, DownloadJobStatus::Pending, Some(job.retry_count + 1), Some(&err.to_string()))?;
            } else {
                store.set_download_status(&job.id, DownloadJobStatus::Failed, None, Some(&err.to_string()))?;
            }
        }
    }
    Ok(())
}

fn filename_for_job(job: &DownloadJob) -> Result<String, LdfdError> {
    job.resolved_url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| LdfdError::TemplateUnresolvable("resolved_url has no filename segment".to_string()))
}

/// The per-job transfer: try mirrors in priority order then the original
/// URL, stream the body while hashing it, reject zero-byte bodies as
/// malformed, and promote the bytes into the artifact store under its
/// canonical key.
fn fetch(artifact_store: &Arc<dyn ArtifactStore>, mirrors: &[MirrorConfig], job: &DownloadJob, cancel: &CancelToken) -> JobOutcome {
    if cancel.is_cancelled() {
        return JobOutcome::Cancelled;
    }

    let filename = match filename_for_job(job) {
        Ok(f) => f,
        Err(err) => return JobOutcome::Failed(err),
    };
    let artifact_key = keys::component_artifact(&job.owner, job.distribution.as_str(), job.component.as_str(), &filename);

    let client = ldfd_forge::default_client();
    let candidates = mirror_candidates(mirrors, &job.resolved_url);

    let mut last_err = None;
    for url in candidates {
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }
        match fetch_one(&client, &url, cancel) {
            Ok(body) => {
                if body.is_empty() {
                    return JobOutcome::Failed(LdfdError::MalformedResponse(format!("zero-byte artifact from {url}")));
                }
                let checksum = Sha256::digest(&body).iter().map(|b| format!("{b:02x}")).collect::<String>();
                if let Err(err) = verify_checksum(job.expected_checksum.as_deref(), &checksum) {
                    return JobOutcome::Failed(err);
                }
                return match artifact_store.put(&artifact_key, &body) {
                    Ok(()) => JobOutcome::Downloaded {
                        artifact_path: artifact_key,
                        checksum,
                        total_bytes: body.len() as u64,
                    },
                    Err(e) => JobOutcome::Failed(LdfdError::Internal(e.to_string())),
                };
            }
            Err(FetchError::Cancelled) => return JobOutcome::Cancelled,
            Err(FetchError::NotFound(url)) => {
                last_err = Some(LdfdError::UpstreamUnavailable(format!("404 for {url}")));
            }
            Err(FetchError::Other(e)) => last_err = Some(e),
        }
    }
    JobOutcome::Failed(last_err.unwrap_or_else(|| LdfdError::UpstreamUnavailable(job.resolved_url.clone())))
}

/// Compares a downloaded blob's hash against the upstream-declared
/// checksum, when one was resolved. No expected checksum means nothing
/// to check against; the component's source didn't publish one.
fn verify_checksum(expected: Option<&str>, actual: &str) -> Result<(), LdfdError> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => Err(LdfdError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

enum FetchError {
    Cancelled,
    NotFound(String),
    Other(LdfdError),
}

fn fetch_one(client: &reqwest::blocking::Client, url: &str, cancel: &CancelToken) -> Result<Vec<u8>, FetchError> {
    let response = client
        .get(url)
        .timeout(Duration::from_secs(60))
        .send()
        .map_err(|e| FetchError::Other(LdfdError::UpstreamUnavailable(e.to_string())))?;

    if response.status().as_u16() == 404 {
        return Err(FetchError::NotFound(url.to_string()));
    }
    if !response.status().is_success() {
        return Err(FetchError::Other(LdfdError::UpstreamUnavailable(format!(
            "status {} for {url}",
            response.status()
        ))));
    }

    let mut body = Vec::new();
    let mut reader = response;
    let mut buf = [0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let n = reader.read(&mut buf).map_err(|e| FetchError::Other(LdfdError::UpstreamUnavailable(e.to_string())))?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldfd_storage::LocalFsBackend;

    fn sample_job(resolved_url: &str) -> DownloadJob {
        DownloadJob {
            id: Id::new(),
            distribution: Id::new(),
            owner: "alice".into(),
            component: Id::new(),
            source: Id::new(),
            resolved_url: resolved_url.to_string(),
            version: "6.12.3".into(),
            expected_checksum: None,
            status: DownloadJobStatus::Pending,
            progress_bytes: 0,
            total_bytes: None,
            artifact_path: None,
            checksum: None,
            retry_count: 0,
            max_retries: 3,
            priority: 0,
            cache_hit: false,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn filename_for_job_takes_last_url_segment() {
        let job = sample_job("https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.12.3.tar.xz");
        assert_eq!(filename_for_job(&job).unwrap(), "linux-6.12.3.tar.xz");
    }

    #[test]
    fn filename_for_job_rejects_trailing_slash() {
        let job = sample_job("https://example.org/releases/");
        assert!(filename_for_job(&job).is_err());
    }

    #[test]
    fn cancelled_token_short_circuits_before_network() {
        let job = sample_job("https://example.invalid/whatever.tar.gz");
        let cancel = CancelToken::new();
        cancel.cancel();
        let store: Arc<dyn ArtifactStore> = Arc::new(LocalFsBackend::new(std::env::temp_dir()));
        let outcome = fetch(&store, &[], &job, &cancel);
        assert!(matches!(outcome, JobOutcome::Cancelled));
    }

    #[test]
    fn unreachable_host_fails_not_cancelled() {
        let job = sample_job("https://example.invalid/whatever.tar.gz");
        let cancel = CancelToken::new();
        let store: Arc<dyn ArtifactStore> = Arc::new(LocalFsBackend::new(std::env::temp_dir()));
        let outcome = fetch(&store, &[], &job, &cancel);
        assert!(matches!(outcome, JobOutcome::Failed(_)));
    }

    #[test]
    fn verify_checksum_accepts_no_expectation() {
        assert!(verify_checksum(None, "anything").is_ok());
    }

    #[test]
    fn verify_checksum_is_case_insensitive() {
        assert!(verify_checksum(Some("ABCD"), "abcd").is_ok());
    }

    #[test]
    fn verify_checksum_rejects_mismatch() {
        let err = verify_checksum(Some("deadbeef"), "cafef00d").unwrap_err();
        assert!(matches!(err, LdfdError::ChecksumMismatch { .. }));
        assert!(!err.is_retryable());
    }
}
