//! Append-only JSONL audit log for sync/download/build operations, plus
//! the `ldfd::audit` tracing target. `EventLog` keeps events in memory
//! until flushed, a buffer-then-append shape.
//!
//! Every error transition that persists `error_message` is expected to go
//! through [`record_error`] so the audit trail and the in-process log stay
//! in sync without callers repeating the `tracing::error!` call site.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ldfd_types::ids::Id;

pub const EVENTS_FILE: &str = "audit.jsonl";
pub const AUDIT_TARGET: &str = "ldfd::audit";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// One audit-trail entry: an entity (source, distribution, download job,
/// or build job) transitioning through a lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub entity: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SyncStarted,
    SyncCompleted { versions_found: u64, versions_new: u64 },
    SyncFailed { message: String },
    DownloadSubmitted { component: String, version: String },
    DownloadCompleted { cache_hit: bool, total_bytes: u64 },
    DownloadFailed { message: String, retryable: bool },
    DownloadCancelled,
    BuildSubmitted { target_arch: String, image_format: String },
    BuildStageStarted { stage: String },
    BuildStageCompleted { stage: String, duration_ms: u64 },
    BuildFailed { stage: String, message: String },
    BuildCompleted { artifact_checksum: String },
    BuildCancelled,
    BuildRetried { retry_count: u32 },
    DistributionDeleted { cascaded_sources: usize },
}

impl EventKind {
    fn is_failure(&self) -> bool {
        matches!(self, EventKind::SyncFailed { .. } | EventKind::DownloadFailed { .. } | EventKind::BuildFailed { .. })
    }
}

/// Emits `event` on the [`AUDIT_TARGET`] tracing target at a level matching
/// its severity, independent of whether it's also buffered into an
/// `EventLog`.
pub fn emit(event: &AuditEvent) {
    if event.kind.is_failure() {
        tracing::error!(target: AUDIT_TARGET, entity = %event.entity, kind = ?event.kind, "{}", describe(event));
    } else {
        tracing::info!(target: AUDIT_TARGET, entity = %event.entity, kind = ?event.kind, "{}", describe(event));
    }
}

fn describe(event: &AuditEvent) -> String {
    format!("{} {:?}", event.entity, event.kind)
}

pub fn event_for(entity: &Id, kind: EventKind) -> AuditEvent {
    AuditEvent { timestamp: Utc::now(), entity: entity.to_string(), kind }
}

/// Convenience for error transitions: records the event into `log` (if
/// given) and always emits it on the audit target.
pub fn record_error(log: Option<&mut EventLog>, entity: &Id, kind: EventKind) {
    let event = event_for(entity, kind);
    emit(&event);
    if let Some(log) = log {
        log.record(event);
    }
}

/// Buffered, append-only audit log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<AuditEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: AuditEvent) {
        self.events.push(event);
    }

    /// Appends buffered events to `path` in JSONL format, creating parent
    /// directories as needed. Does not clear the in-memory buffer.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create audit log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize audit event")?;
            writeln!(writer, "{line}").context("failed to write audit log line")?;
        }
        writer.flush().context("failed to flush audit log")
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let file = File::open(path).with_context(|| format!("failed to open audit log {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| format!("failed to read line from audit log {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line).with_context(|| format!("failed to parse audit event: {line}"))?;
            events.push(event);
        }
        Ok(Self { events })
    }

    pub fn events_for_entity(&self, entity: &str) -> Vec<&AuditEvent> {
        self.events.iter().filter(|e| e.entity == entity).collect()
    }

    pub fn all_events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(entity: &str) -> AuditEvent {
        AuditEvent { timestamp: Utc::now(), entity: entity.to_string(), kind: EventKind::SyncStarted }
    }

    #[test]
    fn new_log_is_empty() {
        assert!(EventLog::new().is_empty());
    }

    #[test]
    fn record_adds_to_log() {
        let mut log = EventLog::new();
        log.record(sample("src-1"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_for_entity_filters() {
        let mut log = EventLog::new();
        log.record(sample("src-1"));
        log.record(sample("src-2"));
        assert_eq!(log.events_for_entity("src-1").len(), 1);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = events_path(dir.path());
        let mut log = EventLog::new();
        log.record(sample("src-1"));
        log.record(AuditEvent {
            timestamp: Utc::now(),
            entity: "src-1".into(),
            kind: EventKind::SyncCompleted { versions_found: 10, versions_new: 2 },
        });
        log.write_to_file(&path).unwrap();

        let loaded = EventLog::read_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn write_appends_across_calls() {
        let dir = tempdir().unwrap();
        let path = events_path(dir.path());
        let mut first = EventLog::new();
        first.record(sample("src-1"));
        first.write_to_file(&path).unwrap();

        let mut second = EventLog::new();
        second.record(sample("src-2"));
        second.write_to_file(&path).unwrap();

        let all = EventLog::read_from_file(&path).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let loaded = EventLog::read_from_file(&dir.path().join("nope.jsonl")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn failure_kinds_are_classified_for_emit_level() {
        assert!(EventKind::SyncFailed { message: "x".into() }.is_failure());
        assert!(!EventKind::SyncStarted.is_failure());
        assert!(!EventKind::BuildCompleted { artifact_checksum: "abc".into() }.is_failure());
    }

    #[test]
    fn event_kinds_round_trip_through_json() {
        let kinds = vec![
            EventKind::SyncStarted,
            EventKind::DownloadSubmitted { component: "kernel".into(), version: "6.12.3".into() },
            EventKind::BuildStageCompleted { stage: "kernel".into(), duration_ms: 4200 },
            EventKind::DistributionDeleted { cascaded_sources: 2 },
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            let _: EventKind = serde_json::from_str(&json).unwrap();
        }
    }
}
