//! Generic adapter: fetches a listing page and extracts semver-shaped
//! tokens by regex. Everything it finds is classified
//! `stable` — there's no structured metadata to do better with.

use std::sync::LazyLock;

use ldfd_types::source::UpstreamSource;
use ldfd_types::version::VersionType;
use regex::Regex;

use crate::{DiscoveredVersion, ForgeError};

static VERSION_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bv?(\d+(?:\.\d+){1,3}(?:-(?:rc|alpha|beta)\d*)?)\b").expect("static regex is valid")
});

pub fn discover(client: &reqwest::blocking::Client, source: &UpstreamSource) -> Result<Vec<DiscoveredVersion>, ForgeError> {
    let response = client
        .get(&source.url)
        .send()
        .map_err(|e| ForgeError::UpstreamUnavailable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ForgeError::UpstreamUnavailable(format!("status {}", response.status())));
    }

    let body = response.text().map_err(|e| ForgeError::MalformedResponse(e.to_string()))?;
    Ok(extract_versions(&body))
}

fn extract_versions(body: &str) -> Vec<DiscoveredVersion> {
    let mut seen = std::collections::BTreeSet::new();
    let mut versions = Vec::new();
    for capture in VERSION_TOKEN.captures_iter(body) {
        let version = capture[1].to_string();
        if seen.insert(version.clone()) {
            versions.push(DiscoveredVersion {
                version,
                version_type: VersionType::Stable,
                download_url: None,
                release_date: None,
                checksum: None,
                file_size: None,
                is_stable: true,
            });
        }
    }
    versions
}
