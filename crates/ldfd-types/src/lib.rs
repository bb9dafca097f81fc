//! # ldfd-types
//!
//! Core domain types shared by every `ldfd` crate: the entities of
//! [`Distribution`], [`Component`], [`UpstreamSource`], [`SourceVersion`],
//! and the two job state machines ([`DownloadJob`], [`BuildJob`]) that drive
//! the download and build managers.
//!
//! ## Modules
//!
//! - [`ids`] — the opaque UUID newtype used for every entity id
//! - [`distribution`] — `Distribution` and its frozen build-time config
//! - [`component`] — `Component`, version rules, category tags
//! - [`source`] — `UpstreamSource`, retrieval method, version filter
//! - [`version`] — `SourceVersion`, `VersionSyncJob`, version ordering
//! - [`jobs`] — `DownloadJob`, `ArtifactCacheEntry`, `BuildJob`, `BuildStage`, `BuildLog`
//! - [`error`] — the `LdfdError` taxonomy from the error handling design

pub mod component;
pub mod distribution;
pub mod error;
pub mod ids;
pub mod jobs;
pub mod source;
pub mod version;

pub use component::{Component, VersionRule};
pub use distribution::{Distribution, DistributionConfig, ImageFormat, TargetArch, Visibility};
pub use error::LdfdError;
pub use ids::Id;
pub use jobs::{
    ArtifactCacheEntry, BuildJob, BuildJobStatus, BuildLog, BuildStage, BuildStageName,
    DownloadJob, DownloadJobStatus, LogLevel, StageStatus,
};
pub use source::{RetrievalMethod, UpstreamSource, VersionFilter};
pub use version::{SourceVersion, SyncJobStatus, VersionSyncJob, VersionType};
