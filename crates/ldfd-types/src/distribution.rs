//! Distribution: the user-facing object describing a buildable image.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStatus {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetArch {
    X86_64,
    Aarch64,
}

impl TargetArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Iso,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "img",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Iso => "iso",
        }
    }
}

/// A single component selection within a distribution's config: which
/// component, and (once resolved) which version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedComponent {
    pub component_id: Id,
    pub resolved_version: Option<String>,
}

/// Kernel configuration mode: either a declarative overlay of `CONFIG_`
/// key/value fragments applied on top of a default, or a user-uploaded
/// `.config` file (validated to contain at least one `CONFIG_` line).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KernelConfigMode {
    Overlay {
        #[serde(default)]
        fragments: BTreeMap<String, String>,
    },
    Uploaded {
        artifact_key: String,
    },
}

/// The structured, versionable config of a distribution. A frozen copy of
/// this is carried on every `BuildJob` as `config_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub kernel_config: KernelConfigMode,
    pub components: Vec<SelectedComponent>,
    pub bootloader: Option<Id>,
    pub init: Option<Id>,
    pub target_arch: TargetArch,
    pub image_format: ImageFormat,
    pub board_profile: Option<String>,
    pub toolchain_profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub id: Id,
    pub name: String,
    pub version: String,
    pub owner: String,
    pub visibility: Visibility,
    pub status: DistributionStatus,
    pub config: DistributionConfig,
    pub source_url: Option<String>,
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Distribution {
    pub fn artifact_component_ids(&self) -> impl Iterator<Item = &Id> {
        self.config.components.iter().map(|c| &c.component_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_format_extensions_match_storage_layout() {
        assert_eq!(ImageFormat::Raw.extension(), "img");
        assert_eq!(ImageFormat::Qcow2.extension(), "qcow2");
        assert_eq!(ImageFormat::Iso.extension(), "iso");
    }

    #[test]
    fn target_arch_as_str() {
        assert_eq!(TargetArch::X86_64.as_str(), "x86_64");
        assert_eq!(TargetArch::Aarch64.as_str(), "aarch64");
    }
}
