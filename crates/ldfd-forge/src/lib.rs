//! Forge adapters: given an `UpstreamSource`, produce the
//! versions it currently advertises. Dispatch is a tagged enum rather than
//! a trait object — the adapter set is closed and small, and match arms
//! read better than a vtable for five variants.

mod generic;
mod kernel_org;
mod repo_forge;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ldfd_types::source::{ForgeType, UpstreamSource};
use ldfd_types::version::VersionType;

const USER_AGENT: &str = concat!("ldfd/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ForgeError {
    /// Network failure or non-2xx from the forge. Retryable by the caller.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// The forge replied but the body didn't parse as expected. Not retried.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ForgeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForgeError::UpstreamUnavailable(_))
    }
}

/// One version as reported by a forge, prior to being upserted as a
/// `SourceVersion` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredVersion {
    pub version: String,
    pub version_type: VersionType,
    pub download_url: Option<String>,
    pub release_date: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub file_size: Option<u64>,
    pub is_stable: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum ForgeAdapter {
    Generic,
    GitHub,
    GitLab,
    Codeberg,
    KernelOrg,
}

impl ForgeAdapter {
    pub fn for_type(forge_type: ForgeType) -> Self {
        match forge_type {
            ForgeType::Generic => ForgeAdapter::Generic,
            ForgeType::GitHub => ForgeAdapter::GitHub,
            ForgeType::GitLab => ForgeAdapter::GitLab,
            ForgeType::Codeberg => ForgeAdapter::Codeberg,
            ForgeType::KernelOrg => ForgeAdapter::KernelOrg,
        }
    }

    /// Enumerate versions advertised by `source`. Pure with respect to the
    /// network call: all classification/templating happens on the response
    /// body, nothing is persisted here.
    pub fn discover(&self, client: &reqwest::blocking::Client, source: &UpstreamSource) -> Result<Vec<DiscoveredVersion>, ForgeError> {
        let _span = tracing::debug_span!("forge.discover", source_id = %source.id, forge_type = ?source.forge_type).entered();
        match self {
            ForgeAdapter::Generic => generic::discover(client, source),
            ForgeAdapter::GitHub => repo_forge::discover_github(client, source),
            ForgeAdapter::GitLab => repo_forge::discover_gitlab(client, source),
            ForgeAdapter::Codeberg => repo_forge::discover_codeberg(client, source),
            ForgeAdapter::KernelOrg => kernel_org::discover(client, source),
        }
    }
}

pub fn default_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| reqwest::blocking::Client::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_selection_matches_forge_type() {
        assert!(matches!(ForgeAdapter::for_type(ForgeType::GitHub), ForgeAdapter::GitHub));
        assert!(matches!(ForgeAdapter::for_type(ForgeType::KernelOrg), ForgeAdapter::KernelOrg));
    }

    #[test]
    fn forge_error_retryability_matches_documented_rules() {
        assert!(ForgeError::UpstreamUnavailable("timeout".into()).is_retryable());
        assert!(!ForgeError::MalformedResponse("bad json".into()).is_retryable());
    }
}
