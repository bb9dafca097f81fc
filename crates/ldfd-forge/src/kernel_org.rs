//! kernel.org adapter: parses the releases index and classifies each
//! entry by name pattern, ignoring the upstream `moniker` field (their
//! taxonomy doesn't line up with ours one-to-one).

use chrono::{NaiveDate, TimeZone, Utc};
use serde::Deserialize;

use ldfd_types::source::UpstreamSource;
use ldfd_types::version::VersionType;

use crate::{DiscoveredVersion, ForgeError};

/// Declared LTS series; a version matches when its
/// `major.minor` prefix equals one of these.
const LTS_SERIES: &[&str] = &["6.12", "6.6", "6.1", "5.15", "5.10", "5.4", "4.19", "4.14"];

#[derive(Debug, Deserialize)]
struct ReleasesIndex {
    releases: Vec<ReleaseEntry>,
}

#[derive(Debug, Deserialize)]
struct ReleaseEntry {
    version: String,
    source: Option<String>,
    released: Option<Released>,
}

#[derive(Debug, Deserialize)]
struct Released {
    isodate: Option<String>,
}

pub fn discover(client: &reqwest::blocking::Client, source: &UpstreamSource) -> Result<Vec<DiscoveredVersion>, ForgeError> {
    let url = format!("{}/releases.json", source.url.trim_end_matches('/'));
    let response = client.get(&url).send().map_err(|e| ForgeError::UpstreamUnavailable(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ForgeError::UpstreamUnavailable(format!("status {}", response.status())));
    }
    let index: ReleasesIndex = response.json().map_err(|e| ForgeError::MalformedResponse(e.to_string()))?;

    Ok(index
        .releases
        .into_iter()
        .map(|entry| {
            let version_type = classify_kernel_version(&entry.version);
            DiscoveredVersion {
                release_date: entry.released.and_then(|r| r.isodate).and_then(|d| parse_isodate(&d)),
                version_type,
                is_stable: version_type == VersionType::Stable,
                download_url: entry.source,
                checksum: None,
                file_size: None,
                version: entry.version,
            }
        })
        .collect())
}

/// Classification rules, checked in order.
pub fn classify_kernel_version(name: &str) -> VersionType {
    if name.contains("-rc") {
        return VersionType::Mainline;
    }
    if name.starts_with("next-") {
        return VersionType::LinuxNext;
    }
    if LTS_SERIES.iter().any(|series| is_series_member(name, series)) {
        return VersionType::Longterm;
    }
    VersionType::Stable
}

fn is_series_member(name: &str, series: &str) -> bool {
    name == series || name.starts_with(&format!("{series}."))
}

fn parse_isodate(raw: &str) -> Option<chrono::DateTime<Utc>> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0)).and_then(|dt| Utc.from_local_datetime(&dt).single())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_versions_are_mainline() {
        assert_eq!(classify_kernel_version("6.13-rc1"), VersionType::Mainline);
    }

    #[test]
    fn next_prefix_is_linux_next() {
        assert_eq!(classify_kernel_version("next-20250101"), VersionType::LinuxNext);
    }

    #[test]
    fn lts_series_members_are_longterm() {
        assert_eq!(classify_kernel_version("6.12.3"), VersionType::Longterm);
        assert_eq!(classify_kernel_version("5.4.280"), VersionType::Longterm);
        assert_eq!(classify_kernel_version("4.14.336"), VersionType::Longterm);
    }

    #[test]
    fn non_lts_dotted_is_stable() {
        assert_eq!(classify_kernel_version("6.13.2"), VersionType::Stable);
    }

    #[test]
    fn series_prefix_match_does_not_false_positive_on_similar_major_minor() {
        // "6.1" must not match "6.120.0"
        assert_eq!(classify_kernel_version("6.120.0"), VersionType::Stable);
    }

    #[test]
    fn parses_real_shaped_releases_document() {
        let body = r#"{"releases":[
            {"version":"6.12.3","moniker":"longterm","source":"https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.12.3.tar.xz","released":{"isodate":"2024-12-08"}},
            {"version":"6.13-rc1","moniker":"mainline","source":"https://git.kernel.org/torvalds/t/linux-6.13-rc1.tar.gz","released":{"isodate":"2024-11-17"}}
        ]}"#;
        let index: ReleasesIndex = serde_json::from_str(body).unwrap();
        assert_eq!(index.releases.len(), 2);
        assert_eq!(classify_kernel_version(&index.releases[0].version), VersionType::Longterm);
        assert_eq!(classify_kernel_version(&index.releases[1].version), VersionType::Mainline);
    }
}
