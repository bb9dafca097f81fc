//! SourceVersion and VersionSyncJob, plus the version ordering rules used
//! by the resolver to pick "highest" for `latest-stable` / `latest-lts`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionType {
    Stable,
    Longterm,
    Mainline,
    LinuxNext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceVersion {
    pub source_id: Id,
    pub version: String,
    pub version_type: VersionType,
    pub release_date: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub file_size: Option<u64>,
    pub is_stable: bool,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSyncJob {
    pub id: Id,
    pub source_id: Id,
    pub status: SyncJobStatus,
    pub versions_found: u64,
    pub versions_new: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl VersionSyncJob {
    pub fn pending(source_id: Id) -> Self {
        Self {
            id: Id::new(),
            source_id,
            status: SyncJobStatus::Pending,
            versions_found: 0,
            versions_new: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, SyncJobStatus::Pending | SyncJobStatus::Running)
    }
}

/// A sort key that orders version strings the way the resolver needs:
/// dotted numeric runs compare numerically, a `-rc`/`-alpha`/`-beta`
/// suffix (or any non-empty pre-release tag) sorts below the release it
/// modifies, and anything that doesn't parse as dotted-numeric falls back
/// to plain lexicographic comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSortKey {
    numeric: Vec<u64>,
    pre_release: Option<String>,
    raw: String,
}

impl VersionSortKey {
    pub fn parse(version: &str) -> Self {
        let (core, pre) = split_pre_release(version);
        let numeric = core
            .split('.')
            .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
            .map(|digits| digits.parse::<u64>().unwrap_or(0))
            .collect();
        Self {
            numeric,
            pre_release: pre,
            raw: version.to_string(),
        }
    }
}

impl PartialOrd for VersionSortKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionSortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.numeric.cmp(&other.numeric) {
            std::cmp::Ordering::Equal => {
                // Same numeric core: a pre-release sorts below the plain release.
                match (&self.pre_release, &other.pre_release) {
                    (None, None) => self.raw.cmp(&other.raw),
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (Some(a), Some(b)) => a.cmp(b),
                }
            }
            ord => ord,
        }
    }
}

/// Splits a version like `"0.0.0-rc1"` into `("0.0.0", Some("rc1"))`.
/// Versions with no numeric-dotted core (e.g. `"next-20250101"`) are
/// returned whole with no pre-release tag; they sort lexicographically.
fn split_pre_release(version: &str) -> (&str, Option<String>) {
    if let Some(idx) = version.find(['-', '_']) {
        let (core, rest) = version.split_at(idx);
        let tag = &rest[1..];
        if is_pre_release_tag(tag) {
            return (core, Some(tag.to_string()));
        }
    }
    (version, None)
}

fn is_pre_release_tag(tag: &str) -> bool {
    let lower = tag.to_ascii_lowercase();
    lower.starts_with("rc") || lower.starts_with("alpha") || lower.starts_with("beta")
}

/// Order a set of `(version, discovered_at)` pairs by the resolver's
/// "highest wins, ties broken by most-recently-discovered" rule.
pub fn highest_version<'a, I>(versions: I) -> Option<&'a SourceVersion>
where
    I: IntoIterator<Item = &'a SourceVersion>,
{
    versions.into_iter().max_by(|a, b| {
        let ka = VersionSortKey::parse(&a.version);
        let kb = VersionSortKey::parse(&b.version);
        ka.cmp(&kb).then(a.discovered_at.cmp(&b.discovered_at))
    })
}
