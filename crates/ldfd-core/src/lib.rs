//! Version discovery, source resolution, download, and build
//! orchestration: the operational core driven by the CLI and, eventually,
//! the HTTP surface. Each module owns one stage of the pipeline; none of
//! them hold their own database connection — they're handed a `&Store`
//! per call rather than owning one.

pub mod build;
pub mod discovery;
pub mod download;
pub mod resolver;
pub mod template;

pub use build::BuildManager;
pub use discovery::{sync, sync_all, trigger_auto_sync, SyncOutcome};
pub use download::DownloadManager;
pub use resolver::{resolve_component, ResolvedComponent};
