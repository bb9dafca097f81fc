use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};

use ldfd_config::LdfdConfig;
use ldfd_core::{BuildManager, DownloadManager};
use ldfd_process::CancelToken;
use ldfd_storage::{ArtifactStore, LocalFsBackend};
use ldfd_store::Store;
use ldfd_types::distribution::Distribution;
use ldfd_types::ids::Id;
use ldfd_types::jobs::{BuildJob, BuildJobStatus, BuildStageName, DownloadJobStatus, StageStatus};

mod progress;

/// The `ldfd` control-plane CLI: one-shot administrative commands that
/// wire the config loader, store, artifact store, and the two managers
/// together and drive them to completion, or `serve` to keep the worker
/// pools alive.
#[derive(Parser, Debug)]
#[command(name = "ldfd", version)]
#[command(about = "Control plane for building custom Linux distribution images")]
struct Cli {
    /// Directory containing `.ldfd.toml` (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// Owner id to operate as.
    #[arg(long, global = true, default_value = "system")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upstream source operations.
    Source {
        #[command(subcommand)]
        cmd: SourceCommands,
    },
    /// Distribution operations.
    Distribution {
        #[command(subcommand)]
        cmd: DistributionCommands,
    },
    /// Build job operations.
    Build {
        #[command(subcommand)]
        cmd: BuildCommands,
    },
    /// Run the download and build worker pools continuously.
    Serve {
        /// How often to poll for pending jobs.
        #[arg(long, default_value = "5s")]
        interval: String,
    },
    /// Print configuration and container runtime diagnostics.
    Doctor,
    /// Emit shell completion scripts.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
enum SourceCommands {
    /// List all configured upstream sources.
    List,
    /// Trigger an immediate sync for one source.
    Sync { id: String },
    /// Sync every enabled source sequentially.
    SyncAll,
}

#[derive(Subcommand, Debug)]
enum DistributionCommands {
    /// Resolve every component, download what's missing, and run a full
    /// build to completion.
    Build {
        id: String,
        /// Bypass the artifact cache and re-download every component.
        #[arg(long)]
        clear_cache: bool,
    },
    /// List distributions for the active owner.
    List,
}

#[derive(Subcommand, Debug)]
enum BuildCommands {
    /// List build jobs for the active owner.
    List,
    /// Show a build job's current status and per-stage progress.
    Status { id: String },
    /// Print build logs, optionally following new lines as they arrive.
    Logs {
        id: String,
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        follow: bool,
    },
    /// Request cancellation of a running or pending build.
    Cancel { id: String },
    /// Retry a failed build job, up to its configured retry budget.
    Retry { id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = LdfdConfig::load_from_workspace(&cli.config_dir).context("loading .ldfd.toml")?;

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
            return Ok(());
        }
        Commands::Doctor => {
            return run_doctor(&config);
        }
        _ => {}
    }

    let store = Store::open(&config.db_path).with_context(|| format!("opening store at {}", config.db_path.display()))?;
    let artifact_store = build_artifact_store(&config)?;

    match cli.command {
        Commands::Source { cmd } => run_source(&store, &config, cmd),
        Commands::Distribution { cmd } => run_distribution(&store, &config, artifact_store, &cli.owner, cmd),
        Commands::Build { cmd } => run_build(&store, &config, artifact_store, cmd),
        Commands::Serve { interval } => run_serve(&store, &config, artifact_store, &interval),
        Commands::Completions { .. } | Commands::Doctor => unreachable!("handled above"),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn build_artifact_store(config: &LdfdConfig) -> Result<Arc<dyn ArtifactStore>> {
    match config.storage.backend {
        ldfd_config::StorageBackendKind::Local => Ok(Arc::new(LocalFsBackend::new(config.storage.local_root.clone()))),
        ldfd_config::StorageBackendKind::S3 => build_s3_backend(config),
    }
}

#[cfg(feature = "s3")]
fn build_s3_backend(config: &LdfdConfig) -> Result<Arc<dyn ArtifactStore>> {
    let bucket = config.storage.bucket.clone().context("storage.bucket is required for the s3 backend")?;
    let region = config.storage.region.clone().unwrap_or_else(|| "us-east-1".to_string());
    let mut s3_config = ldfd_storage::s3::S3Config::new(bucket, region).with_base_path(config.storage.base_path.clone());
    if let Some(endpoint) = &config.storage.endpoint {
        s3_config = s3_config.with_endpoint(endpoint.clone());
    }
    let backend = ldfd_storage::s3::S3Backend::new(&s3_config).context("initializing s3 backend")?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "s3"))]
fn build_s3_backend(_config: &LdfdConfig) -> Result<Arc<dyn ArtifactStore>> {
    bail!("storage.backend = \"s3\" requires building ldfd-cli with the `s3` feature")
}

fn run_source(store: &Store, config: &LdfdConfig, cmd: SourceCommands) -> Result<()> {
    let client = ldfd_forge_client();
    match cmd {
        SourceCommands::List => {
            let sources = store.list_sources()?;
            if sources.is_empty() {
                println!("no sources configured");
            }
            for source in sources {
                println!(
                    "{}  {:<20} priority={:<4} enabled={} system={} owner={}",
                    source.id,
                    source.name,
                    source.priority,
                    source.enabled,
                    source.is_system,
                    source.owner.as_deref().unwrap_or("-")
                );
            }
        }
        SourceCommands::Sync { id } => {
            let source = store.get_source(&Id::from(id.as_str()))?.with_context(|| format!("source {id} not found"))?;
            let outcome = ldfd_core::sync(store, &client, &source, config.timeouts.sync, None)?;
            println!("versions_found={} versions_new={}", outcome.versions_found, outcome.versions_new);
        }
        SourceCommands::SyncAll => {
            let sources = store.list_sources()?;
            ldfd_core::sync_all(store, &client, &sources, config.timeouts.startup_grace, config.timeouts.sync, None);
            println!("sync_all complete for {} source(s)", sources.iter().filter(|s| s.enabled).count());
        }
    }
    Ok(())
}

fn ldfd_forge_client() -> reqwest::blocking::Client {
    ldfd_forge::default_client()
}

fn run_distribution(store: &Store, config: &LdfdConfig, artifact_store: Arc<dyn ArtifactStore>, owner: &str, cmd: DistributionCommands) -> Result<()> {
    match cmd {
        DistributionCommands::List => {
            for d in store.list_distributions(Some(owner))? {
                println!("{}  {:<20} status={:?}", d.id, d.name, d.status);
            }
            Ok(())
        }
        DistributionCommands::Build { id, clear_cache } => build_distribution(store, config, artifact_store, &id, clear_cache),
    }
}

/// `ldfd distribution build`: resolves every component the distribution
/// selects, downloads whatever isn't already cached, then runs a full
/// build to completion. This is the "one-shot invocation" surface named
/// alongside `serve` for the long-running worker pools.
fn build_distribution(store: &Store, config: &LdfdConfig, artifact_store: Arc<dyn ArtifactStore>, id: &str, clear_cache: bool) -> Result<()> {
    let distribution = store.get_distribution(&Id::from(id))?.with_context(|| format!("distribution {id} not found"))?;

    let components = distribution
        .artifact_component_ids()
        .map(|component_id| {
            store.get_component(component_id)?.with_context(|| format!("component {component_id} referenced by distribution is missing"))
        })
        .collect::<Result<Vec<_>>>()?;

    println!("resolving {} component(s) for {}", components.len(), distribution.name);
    let download_manager = Arc::new(DownloadManager::new(artifact_store.clone(), config.mirrors.clone()));
    let jobs = download_manager.submit_for_distribution(store, &distribution, &components, clear_cache)?;

    run_downloads_to_completion(store, &download_manager, &jobs, config.pools.download)?;

    let build_job = new_build_job(&distribution, clear_cache);
    store.create_build_job(&build_job)?;
    println!("build {} started", build_job.id);

    let build_manager = BuildManager::new(
        artifact_store,
        config.container_runtime.clone(),
        config.builder_image.clone(),
        config.workspace_root.clone(),
        download_manager,
        config.pools.download,
    );
    let finished = build_manager.run_one(store, &build_job)?;

    report_build_result(store, &finished)
}

fn new_build_job(distribution: &Distribution, clear_cache: bool) -> BuildJob {
    let now = chrono::Utc::now();
    BuildJob {
        id: Id::new(),
        distribution: distribution.id.clone(),
        owner: distribution.owner.clone(),
        status: BuildJobStatus::Pending,
        current_stage: None,
        target_arch: distribution.config.target_arch,
        image_format: distribution.config.image_format,
        progress_percent: 0,
        workspace_path: None,
        artifact_path: None,
        artifact_checksum: None,
        artifact_size: None,
        error_stage: None,
        error_message: None,
        retry_count: 0,
        max_retries: ldfd_retry::BUILD_DEFAULT.max_attempts,
        clear_cache,
        config_snapshot: distribution.config.clone(),
        created_at: now,
        updated_at: now,
    }
}

/// Drives the download pool until every job this invocation submitted has
/// reached a terminal state, or bails out once the pool reports nothing
/// pending at all (nothing left to make progress on).
fn run_downloads_to_completion(store: &Store, download_manager: &DownloadManager, jobs: &[ldfd_types::jobs::DownloadJob], pool_size: usize) -> Result<()> {
    use std::collections::HashMap;

    let mut remaining: HashMap<Id, DownloadJobStatus> = jobs.iter().map(|j| (j.id.clone(), j.status)).collect();
    remaining.retain(|_, status| !matches!(status, DownloadJobStatus::Completed | DownloadJobStatus::Failed | DownloadJobStatus::Cancelled));

    let cancel = CancelToken::new();
    while !remaining.is_empty() {
        let round = download_manager.run_pool(store, pool_size, &cancel)?;
        if round.is_empty() {
            break;
        }
        for result in round {
            if let Some(status) = remaining.get_mut(&result.id) {
                *status = result.status;
            }
        }
        remaining.retain(|_, status| !matches!(status, DownloadJobStatus::Completed | DownloadJobStatus::Failed | DownloadJobStatus::Cancelled));
    }

    if remaining.values().any(|status| !matches!(status, DownloadJobStatus::Completed)) {
        bail!("one or more component downloads did not complete");
    }
    println!("all component downloads complete");
    Ok(())
}

fn report_build_result(store: &Store, job: &BuildJob) -> Result<()> {
    let stages = store.list_build_stages(&job.id)?;
    let progress = progress::StageProgress::new();
    for (index, stage) in BuildStageName::ORDER.iter().enumerate() {
        if stages.iter().any(|s| s.name == *stage && s.status != StageStatus::Pending) {
            progress.start_stage(index, *stage);
        }
    }
    let outcome = format!("build {} finished: {:?}", job.id, job.status);
    progress.finish(&outcome);

    for stage in &stages {
        println!("  {:<10} {:?} ({}ms)", stage.name.as_str(), stage.status, stage.duration_ms.unwrap_or(0));
    }

    if let Some(message) = &job.error_message {
        println!("error: {message}");
    }
    if job.status != BuildJobStatus::Completed {
        bail!("build did not complete successfully");
    }
    if let Some(checksum) = &job.artifact_checksum {
        println!("artifact: {} (sha256={})", job.artifact_path.as_deref().unwrap_or("-"), checksum);
    }
    Ok(())
}

fn run_build(store: &Store, config: &LdfdConfig, artifact_store: Arc<dyn ArtifactStore>, cmd: BuildCommands) -> Result<()> {
    match cmd {
        BuildCommands::List => {
            for job in store.list_build_jobs(None)? {
                println!("{}  status={:?} stage={:?} progress={}%", job.id, job.status, job.current_stage, job.progress_percent);
            }
            Ok(())
        }
        BuildCommands::Status { id } => {
            let job = store.get_build_job(&Id::from(id.as_str()))?.with_context(|| format!("build {id} not found"))?;
            println!("status: {:?}", job.status);
            println!("stage:  {:?}", job.current_stage);
            println!("progress: {}%", job.progress_percent);
            if let Some(message) = &job.error_message {
                println!("error: {message}");
            }
            Ok(())
        }
        BuildCommands::Logs { id, since, follow } => run_build_logs(store, &id, since, follow),
        BuildCommands::Cancel { id } => {
            let build_id = Id::from(id.as_str());
            store.update_build_job_status(&build_id, BuildJobStatus::Cancelled)?;
            ldfd_events::emit(&ldfd_events::event_for(&build_id, ldfd_events::EventKind::BuildCancelled));
            println!("cancellation requested for build {id}");
            Ok(())
        }
        BuildCommands::Retry { id } => {
            let download_manager = Arc::new(DownloadManager::new(artifact_store.clone(), config.mirrors.clone()));
            let build_manager = BuildManager::new(
                artifact_store,
                config.container_runtime.clone(),
                config.builder_image.clone(),
                config.workspace_root.clone(),
                download_manager,
                config.pools.download,
            );
            let job = build_manager.retry(store, &Id::from(id.as_str()))?;
            println!("build {} requeued (retry {}/{})", job.id, job.retry_count, job.max_retries);
            Ok(())
        }
    }
}

fn run_build_logs(store: &Store, id: &str, since: u64, follow: bool) -> Result<()> {
    let build_id = Id::from(id);
    let mut cursor = since;
    loop {
        let logs = store.list_build_logs_since(&build_id, cursor)?;
        for log in &logs {
            println!("[{}] {:?} {}", log.stage.as_str(), log.level, log.message);
            cursor = log.id;
        }
        if !follow {
            break;
        }
        let job = store.get_build_job(&build_id)?.with_context(|| format!("build {id} not found"))?;
        if job.is_terminal() {
            break;
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    Ok(())
}

/// Runs the download and build pools in a loop until the process is
/// killed, the deployment shape alongside the one-shot subcommands.
fn run_serve(store: &Store, config: &LdfdConfig, artifact_store: Arc<dyn ArtifactStore>, interval: &str) -> Result<()> {
    let poll_interval = humantime::parse_duration(interval).with_context(|| format!("invalid duration: {interval}"))?;
    let download_manager = Arc::new(DownloadManager::new(artifact_store.clone(), config.mirrors.clone()));
    let build_manager = BuildManager::new(
        artifact_store,
        config.container_runtime.clone(),
        config.builder_image.clone(),
        config.workspace_root.clone(),
        download_manager.clone(),
        config.pools.download,
    );
    let cancel = CancelToken::new();

    println!("ldfd serve: polling every {poll_interval:?}");
    loop {
        match download_manager.run_pool(store, config.pools.download, &cancel) {
            Ok(jobs) if !jobs.is_empty() => tracing::info!(count = jobs.len(), "processed download jobs"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "download pool iteration failed"),
        }

        let pending_builds: Vec<_> = store
            .list_build_jobs(None)?
            .into_iter()
            .filter(|j| matches!(j.status, BuildJobStatus::Pending | BuildJobStatus::Queued))
            .take(config.pools.build)
            .collect();
        if !pending_builds.is_empty() {
            if let Err(err) = build_manager.run_pool(store, &pending_builds, config.pools.build) {
                tracing::warn!(error = %err, "build pool iteration failed");
            }
        }

        std::thread::sleep(poll_interval);
    }
}

fn run_doctor(config: &LdfdConfig) -> Result<()> {
    println!("db_path:         {}", config.db_path.display());
    println!("workspace_root:  {}", config.workspace_root.display());
    println!("container_runtime: {}", config.container_runtime);
    println!("builder_image:     {}", config.builder_image);
    println!("storage_backend:   {:?}", config.storage.backend);
    println!("pools: version_sync={} download={} build={}", config.pools.version_sync, config.pools.download, config.pools.build);
    println!();
    print_cmd_version(&config.container_runtime);
    Ok(())
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(output) if output.status.success() => {
            println!("{cmd}: {}", String::from_utf8_lossy(&output.stdout).trim());
        }
        Ok(output) => {
            eprintln!("[warn] {cmd} --version failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Err(err) => {
            eprintln!("[warn] unable to run {cmd} --version: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldfd_types::distribution::{DistributionConfig, DistributionStatus, ImageFormat, KernelConfigMode, TargetArch, Visibility};

    fn sample_distribution() -> Distribution {
        let now = chrono::Utc::now();
        Distribution {
            id: Id::new(),
            name: "test-dist".into(),
            version: "1".into(),
            owner: "alice".into(),
            visibility: Visibility::Private,
            status: DistributionStatus::Pending,
            config: DistributionConfig {
                kernel_config: KernelConfigMode::Overlay { fragments: Default::default() },
                components: vec![],
                bootloader: None,
                init: None,
                target_arch: TargetArch::X86_64,
                image_format: ImageFormat::Raw,
                board_profile: None,
                toolchain_profile: None,
            },
            source_url: None,
            checksum: None,
            size_bytes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn new_build_job_carries_target_and_format_from_distribution() {
        let distribution = sample_distribution();
        let job = new_build_job(&distribution, true);
        assert_eq!(job.target_arch, distribution.config.target_arch);
        assert_eq!(job.image_format, distribution.config.image_format);
        assert!(job.clear_cache);
        assert_eq!(job.status, BuildJobStatus::Pending);
    }

    #[test]
    fn print_cmd_version_reports_missing_command() {
        print_cmd_version("definitely-not-a-real-command-ldfd");
    }

    #[test]
    fn cli_parses_distribution_build_with_clear_cache() {
        let cli = Cli::parse_from(["ldfd", "distribution", "build", "abc-123", "--clear-cache"]);
        match cli.command {
            Commands::Distribution { cmd: DistributionCommands::Build { id, clear_cache } } => {
                assert_eq!(id, "abc-123");
                assert!(clear_cache);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
