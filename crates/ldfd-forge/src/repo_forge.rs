//! github/gitlab/codeberg adapters: paginated release/tag API clients
//!. All three forges speak a releases-or-tags REST API with
//! enough shape in common to share the owner/repo parsing and the
//! release-falls-back-to-tags edge case, but each has its own JSON layout
//! so the HTTP calls themselves stay forge-specific.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use ldfd_types::source::{RetrievalMethod, UpstreamSource};
use ldfd_types::version::VersionType;

use crate::{DiscoveredVersion, ForgeError};

const MAX_PAGES: u32 = 10;
const PER_PAGE: u32 = 100;

fn owner_repo(source: &UpstreamSource) -> Result<(String, String), ForgeError> {
    let trimmed = source.url.trim_end_matches('/').trim_end_matches(".git");
    let mut segments = trimmed.rsplit('/').take(2);
    let repo = segments.next().ok_or_else(|| ForgeError::MalformedResponse(format!("cannot parse repo from url {}", source.url)))?;
    let owner = segments.next().ok_or_else(|| ForgeError::MalformedResponse(format!("cannot parse owner from url {}", source.url)))?;
    Ok((owner.to_string(), repo.to_string()))
}

fn want_tags(source: &UpstreamSource) -> bool {
    matches!(source.retrieval_method, RetrievalMethod::Tag | RetrievalMethod::Branch | RetrievalMethod::Archive)
}

// ---- GitHub -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    prerelease: bool,
    published_at: Option<DateTime<Utc>>,
    tarball_url: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct GitHubTag {
    name: String,
    tarball_url: Option<String>,
}

pub fn discover_github(client: &reqwest::blocking::Client, source: &UpstreamSource) -> Result<Vec<DiscoveredVersion>, ForgeError> {
    let (owner, repo) = owner_repo(source)?;
    if want_tags(source) {
        let tags: Vec<GitHubTag> = paginate(client, &format!("https://api.github.com/repos/{owner}/{repo}/tags"))?;
        return Ok(tags
            .into_iter()
            .map(|t| DiscoveredVersion {
                version: t.name,
                version_type: VersionType::Stable,
                download_url: None,
                release_date: None,
                checksum: None,
                file_size: None,
                is_stable: true,
            })
            .collect());
    }

    let releases: Vec<GitHubRelease> = paginate(client, &format!("https://api.github.com/repos/{owner}/{repo}/releases"))?;
    if releases.is_empty() {
        // No releases published yet; fall back to tags.
        let tags: Vec<GitHubTag> = paginate(client, &format!("https://api.github.com/repos/{owner}/{repo}/tags"))?;
        return Ok(tags
            .into_iter()
            .map(|t| DiscoveredVersion {
                version: t.name,
                version_type: VersionType::Stable,
                download_url: t.tarball_url,
                release_date: None,
                checksum: None,
                file_size: None,
                is_stable: true,
            })
            .collect());
    }

    Ok(releases
        .into_iter()
        .map(|r| DiscoveredVersion {
            version: r.tag_name,
            version_type: if r.prerelease { VersionType::Mainline } else { VersionType::Stable },
            download_url: r.assets.first().map(|a| a.browser_download_url.clone()).or(r.tarball_url),
            release_date: r.published_at,
            checksum: None,
            file_size: None,
            is_stable: !r.prerelease,
        })
        .collect())
}

fn paginate<T: serde::de::DeserializeOwned>(client: &reqwest::blocking::Client, base_url: &str) -> Result<Vec<T>, ForgeError> {
    let mut all = Vec::new();
    for page in 1..=MAX_PAGES {
        let separator = if base_url.contains('?') { '&' } else { '?' };
        let url = format!("{base_url}{separator}per_page={PER_PAGE}&page={page}");
        let response = client.get(&url).send().map_err(|e| ForgeError::UpstreamUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ForgeError::UpstreamUnavailable(format!("status {}", response.status())));
        }
        let batch: Vec<T> = response.json().map_err(|e| ForgeError::MalformedResponse(e.to_string()))?;
        let is_last = batch.len() < PER_PAGE as usize;
        all.extend(batch);
        if is_last {
            break;
        }
    }
    Ok(all)
}

// ---- GitLab -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GitLabRelease {
    tag_name: String,
    released_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: GitLabAssets,
}

#[derive(Debug, Default, Deserialize)]
struct GitLabAssets {
    #[serde(default)]
    links: Vec<GitLabAssetLink>,
}

#[derive(Debug, Deserialize)]
struct GitLabAssetLink {
    url: String,
}

#[derive(Debug, Deserialize)]
struct GitLabTag {
    name: String,
}

pub fn discover_gitlab(client: &reqwest::blocking::Client, source: &UpstreamSource) -> Result<Vec<DiscoveredVersion>, ForgeError> {
    let (owner, repo) = owner_repo(source)?;
    let project = urlencoding_slash(&owner, &repo);

    if want_tags(source) {
        let tags: Vec<GitLabTag> = paginate(client, &format!("https://gitlab.com/api/v4/projects/{project}/repository/tags"))?;
        return Ok(tags.into_iter().map(|t| stable_version(t.name, None)).collect());
    }

    let releases: Vec<GitLabRelease> = paginate(client, &format!("https://gitlab.com/api/v4/projects/{project}/releases"))?;
    if releases.is_empty() {
        let tags: Vec<GitLabTag> = paginate(client, &format!("https://gitlab.com/api/v4/projects/{project}/repository/tags"))?;
        return Ok(tags.into_iter().map(|t| stable_version(t.name, None)).collect());
    }

    Ok(releases
        .into_iter()
        .map(|r| DiscoveredVersion {
            version: r.tag_name,
            version_type: VersionType::Stable,
            download_url: r.assets.links.first().map(|l| l.url.clone()),
            release_date: r.released_at,
            checksum: None,
            file_size: None,
            is_stable: true,
        })
        .collect())
}

fn urlencoding_slash(owner: &str, repo: &str) -> String {
    format!("{owner}%2F{repo}")
}

// ---- Codeberg (Gitea API) ------------------------------------------------

#[derive(Debug, Deserialize)]
struct GiteaRelease {
    tag_name: String,
    prerelease: bool,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GiteaAsset>,
    tarball_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GiteaAsset {
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct GiteaTag {
    name: String,
}

pub fn discover_codeberg(client: &reqwest::blocking::Client, source: &UpstreamSource) -> Result<Vec<DiscoveredVersion>, ForgeError> {
    let (owner, repo) = owner_repo(source)?;

    if want_tags(source) {
        let tags: Vec<GiteaTag> = paginate(client, &format!("https://codeberg.org/api/v1/repos/{owner}/{repo}/tags"))?;
        return Ok(tags.into_iter().map(|t| stable_version(t.name, None)).collect());
    }

    let releases: Vec<GiteaRelease> = paginate(client, &format!("https://codeberg.org/api/v1/repos/{owner}/{repo}/releases"))?;
    if releases.is_empty() {
        let tags: Vec<GiteaTag> = paginate(client, &format!("https://codeberg.org/api/v1/repos/{owner}/{repo}/tags"))?;
        return Ok(tags.into_iter().map(|t| stable_version(t.name, None)).collect());
    }

    Ok(releases
        .into_iter()
        .map(|r| DiscoveredVersion {
            version: r.tag_name,
            version_type: if r.prerelease { VersionType::Mainline } else { VersionType::Stable },
            download_url: r.assets.first().map(|a| a.browser_download_url.clone()).or(r.tarball_url),
            release_date: r.published_at,
            checksum: None,
            file_size: None,
            is_stable: !r.prerelease,
        })
        .collect())
}

fn stable_version(version: String, download_url: Option<String>) -> DiscoveredVersion {
    DiscoveredVersion {
        version,
        version_type: VersionType::Stable,
        download_url,
        release_date: None,
        checksum: None,
        file_size: None,
        is_stable: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldfd_types::ids::Id;
    use ldfd_types::source::{ForgeType, VersionFilter};

    fn source(url: &str, retrieval_method: RetrievalMethod) -> UpstreamSource {
        UpstreamSource {
            id: Id::new(),
            name: "test".into(),
            url: url.into(),
            component_ids: Default::default(),
            retrieval_method,
            url_template: None,
            forge_type: ForgeType::GitHub,
            version_filter: VersionFilter::new(""),
            priority: 0,
            enabled: true,
            is_system: true,
            owner: None,
            default_version: None,
        }
    }

    #[test]
    fn parses_owner_repo_from_github_url() {
        let s = source("https://github.com/torvalds/linux", RetrievalMethod::Release);
        assert_eq!(owner_repo(&s).unwrap(), ("torvalds".to_string(), "linux".to_string()));
    }

    #[test]
    fn parses_owner_repo_with_trailing_slash_and_dotgit() {
        let s = source("https://github.com/rust-lang/rust.git/", RetrievalMethod::Release);
        assert_eq!(owner_repo(&s).unwrap(), ("rust-lang".to_string(), "rust".to_string()));
    }

    #[test]
    fn tag_retrieval_method_wants_tags() {
        let s = source("https://github.com/a/b", RetrievalMethod::Tag);
        assert!(want_tags(&s));
        let s = source("https://github.com/a/b", RetrievalMethod::Release);
        assert!(!want_tags(&s));
    }

    #[test]
    fn gitlab_project_path_is_percent_encoded() {
        assert_eq!(urlencoding_slash("group", "project"), "group%2Fproject");
    }
}
