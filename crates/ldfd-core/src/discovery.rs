//! Version Discovery Service: drives a forge adapter,
//! applies the source's version filter, and upserts the discovered
//! versions, all under the one-in-flight-sync-per-source slot enforced by
//! the Durable Store.

use std::time::{Duration, Instant};

use ldfd_events::{EventKind, EventLog, emit, event_for};
use ldfd_forge::ForgeAdapter;
use ldfd_store::Store;
use ldfd_types::error::LdfdError;
use ldfd_types::ids::Id;
use ldfd_types::source::UpstreamSource;
use ldfd_types::version::SourceVersion;

/// Result of one `sync` call: counts for the completed `VersionSyncJob`.
#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    pub versions_found: u64,
    pub versions_new: u64,
}

/// Runs one sync for `source`. Acquires the sync-job slot
/// (fails `SyncInProgress` if one is already pending/running), drives the
/// adapter, applies `source.version_filter`, upserts `SourceVersion` rows,
/// and marks the job terminal.
///
/// `deadline` bounds the whole operation (the Discovery service's sync pool
/// enforces this as the 5-minute timeout from `TimeoutsConfig::sync`); it
/// is checked after the network call returns, since the adapter call itself
/// is a single blocking request with its own client-side timeout.
pub fn sync(
    store: &Store,
    client: &reqwest::blocking::Client,
    source: &UpstreamSource,
    deadline: Duration,
    mut log: Option<&mut EventLog>,
) -> Result<SyncOutcome, LdfdError> {
    let job = store.try_start_sync(&source.id)?;
    record(&mut log, &source.id, EventKind::SyncStarted);

    let started = Instant::now();
    let adapter = ForgeAdapter::for_type(source.forge_type);

    let discovered = adapter.discover(client, source).map_err(|e| match e {
        ldfd_forge::ForgeError::UpstreamUnavailable(m) => LdfdError::UpstreamUnavailable(m),
        ldfd_forge::ForgeError::MalformedResponse(m) => LdfdError::MalformedResponse(m),
    });

    let discovered = match discovered {
        Ok(d) => d,
        Err(err) => {
            store.fail_sync(&job.id, &err.to_string())?;
            record(&mut log, &source.id, EventKind::SyncFailed { message: err.to_string() });
            return Err(err);
        }
    };

    if started.elapsed() > deadline {
        let message = format!("sync exceeded {}s deadline", deadline.as_secs());
        store.fail_sync(&job.id, &message)?;
        record(&mut log, &source.id, EventKind::SyncFailed { message: message.clone() });
        return Err(LdfdError::UpstreamUnavailable(message));
    }

    let admitted: Vec<_> = discovered.into_iter().filter(|v| source.version_filter.admits(&v.version)).collect();

    let mut versions_new = 0u64;
    for v in &admitted {
        let row = SourceVersion {
            source_id: source.id.clone(),
            version: v.version.clone(),
            version_type: v.version_type,
            release_date: v.release_date,
            download_url: v.download_url.clone(),
            checksum: v.checksum.clone(),
            checksum_type: v.checksum.as_ref().map(|_| "sha256".to_string()),
            file_size: v.file_size,
            is_stable: v.is_stable,
            discovered_at: chrono::Utc::now(),
        };
        if store.upsert_source_version(&row)? {
            versions_new += 1;
        }
    }

    let outcome = SyncOutcome { versions_found: admitted.len() as u64, versions_new };
    store.complete_sync(&job.id, outcome.versions_found, outcome.versions_new)?;
    record(&mut log, &source.id, EventKind::SyncCompleted { versions_found: outcome.versions_found, versions_new: outcome.versions_new });

    Ok(outcome)
}

/// Emits `kind` on the audit target and, if `log` is given, also buffers it
/// there — the non-error counterpart to [`record_error`], which only
/// covers failure kinds.
fn record(log: &mut Option<&mut EventLog>, entity: &Id, kind: EventKind) {
    let event = event_for(entity, kind);
    emit(&event);
    if let Some(log) = log.as_deref_mut() {
        log.record(event);
    }
}

/// Invoked at startup: waits `startup_grace`, then syncs
/// every enabled source sequentially (never in parallel) to avoid
/// thundering-herd on rate-limited forges. A single source's failure is
/// logged and does not stop the remaining sources.
pub fn sync_all(
    store: &Store,
    client: &reqwest::blocking::Client,
    sources: &[UpstreamSource],
    startup_grace: Duration,
    sync_deadline: Duration,
    mut log: Option<&mut EventLog>,
) {
    std::thread::sleep(startup_grace);
    for source in sources.iter().filter(|s| s.enabled) {
        if let Err(err) = sync(store, client, source, sync_deadline, log.as_deref_mut()) {
            tracing::warn!(source_id = %source.id, error = %err, "sync failed during syncAll");
        }
    }
}

/// Schedules a single background sync for a newly created source:
/// failures are logged and swallowed, the caller never blocks on or
/// observes the outcome.
pub fn trigger_auto_sync(store: Store, client: reqwest::blocking::Client, source: UpstreamSource, sync_deadline: Duration) {
    std::thread::spawn(move || {
        if let Err(err) = sync(&store, &client, &source, sync_deadline, None) {
            tracing::warn!(source_id = %source.id, error = %err, "triggerAutoSync failed");
        }
    });
}
