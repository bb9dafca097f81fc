//! Source Resolver: given a distribution owner and a
//! component, picks a candidate source, a version satisfying the
//! component's version rule, and the URL the Download Manager should
//! fetch.

use ldfd_store::Store;
use ldfd_types::component::{Component, VersionRule};
use ldfd_types::error::LdfdError;
use ldfd_types::ids::Id;
use ldfd_types::source::UpstreamSource;
use ldfd_types::version::{SourceVersion, VersionType};

use crate::template;

/// The outcome of resolving one component against a distribution owner.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    pub component_id: Id,
    pub source_id: Id,
    pub version: String,
    pub resolved_url: String,
    pub checksum: Option<String>,
}

/// Resolves `(owner, component)` to a concrete source and version.
pub fn resolve_component(store: &Store, owner: &str, component: &Component) -> Result<ResolvedComponent, LdfdError> {
    let candidates = store
        .candidate_sources_for_component(&component.id, owner)
        .map_err(|e| LdfdError::Internal(e.to_string()))?;
    if candidates.is_empty() {
        return Err(LdfdError::NoSourceForComponent(component.name.clone()));
    }

    for source in &candidates {
        if let Some(version) = pick_version(store, source, component)? {
            let resolved_url = resolve_url(component, source, &version)?;
            return Ok(ResolvedComponent {
                component_id: component.id.clone(),
                source_id: source.id.clone(),
                version: version.version,
                resolved_url,
                checksum: version.checksum,
            });
        }
    }

    match component.default_version_rule {
        VersionRule::Pinned => Err(LdfdError::VersionNotAvailable {
            component: component.name.clone(),
            version: component.default_version.clone().unwrap_or_default(),
        }),
        VersionRule::LatestStable | VersionRule::LatestLts => Err(LdfdError::VersionNotAvailable {
            component: component.name.clone(),
            version: "latest".to_string(),
        }),
    }
}

/// Picks the version a single candidate `source` offers for `component`'s
/// rule. `None` means this source has nothing usable and the caller
/// should try the next candidate.
fn pick_version(store: &Store, source: &UpstreamSource, component: &Component) -> Result<Option<SourceVersion>, LdfdError> {
    let found = match component.default_version_rule {
        VersionRule::Pinned => {
            let Some(version) = &component.default_version else {
                return Ok(None);
            };
            store.get_source_version(&source.id, version).map_err(|e| LdfdError::Internal(e.to_string()))?
        }
        VersionRule::LatestStable => store
            .highest_version_of_type(&source.id, VersionType::Stable)
            .map_err(|e| LdfdError::Internal(e.to_string()))?,
        VersionRule::LatestLts => store
            .highest_version_of_type(&source.id, VersionType::Longterm)
            .map_err(|e| LdfdError::Internal(e.to_string()))?,
    };
    Ok(found)
}

/// Builds the resolved download URL: prefer the
/// `SourceVersion`'s own `download_url`, else substitute the source's
/// `url_template`, falling back to the component's forge-normalized
/// template if the generic one is unresolvable.
fn resolve_url(component: &Component, source: &UpstreamSource, version: &SourceVersion) -> Result<String, LdfdError> {
    if let Some(url) = &version.download_url {
        return Ok(url.clone());
    }

    let generic = source
        .url_template
        .as_deref()
        .or(component.default_url_template.as_deref());

    let generic_result = generic.map(|t| template::resolve_url(t, &source.url, &version.version));

    match generic_result {
        Some(Ok(url)) => Ok(url),
        Some(Err(err)) => {
            if let Some(normalized) = &component.forge_normalized_template {
                template::resolve_url(normalized, &source.url, &version.version)
            } else {
                Err(err)
            }
        }
        None => {
            if let Some(normalized) = &component.forge_normalized_template {
                template::resolve_url(normalized, &source.url, &version.version)
            } else {
                Err(LdfdError::TemplateUnresolvable("no url_template configured".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ldfd_types::component::VersionRule;
    use ldfd_types::source::{ForgeType, RetrievalMethod, VersionFilter};
    use std::collections::BTreeSet;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn component(rule: VersionRule, default_version: Option<&str>) -> Component {
        Component {
            id: Id::new(),
            name: "kernel".into(),
            category: BTreeSet::new(),
            is_system: true,
            is_kernel_module: false,
            is_userspace: false,
            artifact_template: "{name}-{version}.tar.xz".into(),
            default_url_template: Some("{base_url}/linux-{version}.tar.xz".into()),
            forge_normalized_template: None,
            supported_architectures: BTreeSet::new(),
            default_version: default_version.map(String::from),
            default_version_rule: rule,
        }
    }

    fn source(component_id: &Id, priority: i64, owner: Option<&str>) -> UpstreamSource {
        UpstreamSource {
            id: Id::new(),
            name: "kernel-org".into(),
            url: "https://cdn.kernel.org/pub/linux/kernel".into(),
            component_ids: [component_id.clone()].into_iter().collect(),
            retrieval_method: RetrievalMethod::Archive,
            url_template: None,
            forge_type: ForgeType::KernelOrg,
            version_filter: VersionFilter::new(""),
            priority,
            enabled: true,
            is_system: owner.is_none(),
            owner: owner.map(String::from),
            default_version: None,
        }
    }

    fn version(source_id: &Id, v: &str, vtype: VersionType) -> SourceVersion {
        SourceVersion {
            source_id: source_id.clone(),
            version: v.to_string(),
            version_type: vtype,
            release_date: None,
            download_url: None,
            checksum: None,
            checksum_type: None,
            file_size: None,
            is_stable: matches!(vtype, VersionType::Stable),
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn no_candidate_sources_fails_no_source_for_component() {
        let store = store();
        let component = component(VersionRule::LatestStable, None);
        let err = resolve_component(&store, "alice", &component).unwrap_err();
        assert!(matches!(err, LdfdError::NoSourceForComponent(_)));
    }

    #[test]
    fn latest_lts_picks_highest_longterm() {
        let store = store();
        let component = component(VersionRule::LatestLts, None);
        store.create_component(&component).unwrap();
        let source = source(&component.id, 10, None);
        store.create_source(&source).unwrap();
        store.upsert_source_version(&version(&source.id, "6.12.2", VersionType::Longterm)).unwrap();
        store.upsert_source_version(&version(&source.id, "6.12.3", VersionType::Longterm)).unwrap();
        store.upsert_source_version(&version(&source.id, "6.13-rc1", VersionType::Mainline)).unwrap();

        let resolved = resolve_component(&store, "alice", &component).unwrap();
        assert_eq!(resolved.version, "6.12.3");
        assert_eq!(resolved.resolved_url, "https://cdn.kernel.org/pub/linux/kernel/linux-6.12.3.tar.xz");
    }

    #[test]
    fn pinned_without_matching_version_fails() {
        let store = store();
        let component = component(VersionRule::Pinned, Some("6.12.3"));
        store.create_component(&component).unwrap();
        let source = source(&component.id, 10, None);
        store.create_source(&source).unwrap();

        let err = resolve_component(&store, "alice", &component).unwrap_err();
        assert!(matches!(err, LdfdError::VersionNotAvailable { .. }));
    }

    #[test]
    fn higher_priority_source_wins_over_lower() {
        let store = store();
        let component = component(VersionRule::LatestStable, None);
        store.create_component(&component).unwrap();

        let low = source(&component.id, 1, None);
        let high = source(&component.id, 10, None);
        store.create_source(&low).unwrap();
        store.create_source(&high).unwrap();
        store.upsert_source_version(&version(&low.id, "1.0.0", VersionType::Stable)).unwrap();
        store.upsert_source_version(&version(&high.id, "2.0.0", VersionType::Stable)).unwrap();

        let resolved = resolve_component(&store, "alice", &component).unwrap();
        assert_eq!(resolved.source_id, high.id);
        assert_eq!(resolved.version, "2.0.0");
    }
}
