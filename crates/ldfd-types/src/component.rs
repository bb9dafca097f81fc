//! Component: a named building block of a distribution (kernel, bootloader,
//! init, userspace package).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// How a component's version is selected when resolving a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionRule {
    /// Use `Component::default_version` verbatim.
    Pinned,
    /// Highest-ordered `SourceVersion` with `version_type = stable`.
    LatestStable,
    /// Highest-ordered `SourceVersion` with `version_type = longterm`.
    LatestLts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: Id,
    /// Unique, human-chosen name (`"kernel"`, `"grub"`, `"busybox"`, ...).
    pub name: String,
    /// Free-form tags such as `"kernel"`, `"bootloader"`, `"init"`.
    pub category: BTreeSet<String>,
    /// Built-in (seeded by ldfd itself) vs. user-created.
    pub is_system: bool,
    pub is_kernel_module: bool,
    pub is_userspace: bool,
    /// Template describing the on-disk artifact name, e.g. `"{name}-{version}.tar.xz"`.
    pub artifact_template: String,
    /// Default `{base_url}`/`{version}` URL template used when a source
    /// doesn't carry a forge-normalized one.
    pub default_url_template: Option<String>,
    /// Forge-normalized template, tried when the generic template fails to
    /// resolve (e.g. GitHub's `{base_url}/archive/refs/tags/{version}.tar.gz`).
    pub forge_normalized_template: Option<String>,
    pub supported_architectures: BTreeSet<String>,
    pub default_version: Option<String>,
    pub default_version_rule: VersionRule,
}

impl Component {
    pub fn supports_arch(&self, arch: &str) -> bool {
        self.supported_architectures.is_empty() || self.supported_architectures.contains(arch)
    }
}
