//! UpstreamSource: a configured place to fetch one or more component
//! versions from, plus the version-filter glob language used to prune
//! discovered versions during a sync.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrievalMethod {
    Release,
    Tag,
    Branch,
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForgeType {
    Generic,
    GitHub,
    GitLab,
    Codeberg,
    KernelOrg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSource {
    pub id: Id,
    pub name: String,
    pub url: String,
    pub component_ids: BTreeSet<Id>,
    pub retrieval_method: RetrievalMethod,
    /// `{base_url}`/`{version}` substitution template.
    pub url_template: Option<String>,
    pub forge_type: ForgeType,
    pub version_filter: VersionFilter,
    pub priority: i64,
    pub enabled: bool,
    pub is_system: bool,
    pub owner: Option<String>,
    pub default_version: Option<String>,
}

/// A comma-separated list of glob tokens; tokens prefixed with `!` exclude,
/// everything else includes. Empty filter is identity (admits all).
///
/// Semantics:
/// - No `!` tokens present → include-only: a version must match at least
///   one include glob.
/// - `!` tokens are applied *after* the include pass, as an exclude list.
/// - Empty filter (or a filter consisting only of empty/whitespace tokens,
///   e.g. `","`) is the identity — it admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionFilter {
    raw: String,
}

impl VersionFilter {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn tokens(&self) -> impl Iterator<Item = &str> {
        self.raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    fn includes(&self) -> Vec<&str> {
        self.tokens().filter(|t| !t.starts_with('!')).collect()
    }

    fn excludes(&self) -> Vec<&str> {
        self.tokens()
            .filter_map(|t| t.strip_prefix('!'))
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Whether `version` passes this filter.
    pub fn admits(&self, version: &str) -> bool {
        let includes = self.includes();
        let included = includes.is_empty() || includes.iter().any(|g| glob_match(g, version));
        if !included {
            return false;
        }
        !self.excludes().iter().any(|g| glob_match(g, version))
    }
}

/// Minimal glob matcher supporting `*` (any run of characters) and `?`
/// (single character), sufficient for version tokens like `*-rc*` or
/// `6.12.*`. No character classes — version strings don't need them.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn rec(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => rec(&p[1..], t) || (!t.is_empty() && rec(p, &t[1..])),
            Some(b'?') => !t.is_empty() && rec(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && t[0] == c && rec(&p[1..], &t[1..]),
        }
    }
    rec(pattern.as_bytes(), text.as_bytes())
}
