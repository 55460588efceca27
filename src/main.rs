//! Entry point: logging/panic setup, CLI dispatch, and the sequential
//! run-an-instance driver loop (§4.4, §5 "no cross-instance parallelism").

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use benchmarkoor::{
    cli::{self, Cli, Command, RunManifest},
    model::RunStatus,
    orphans,
    runtime::{docker::BollardRuntime, ContainerRuntime, RuntimeBackend},
    supervisor::InstanceSupervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic::setup_panic!();
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            manifest,
            results_dir,
            tmp_dir,
            chown,
        } => run(manifest, results_dir, tmp_dir, chown).await,
        Command::Index { results_dir, output } => generate_index(results_dir, output).await,
        Command::SuiteStats {
            results_dir,
            output_dir,
        } => generate_suite_stats(results_dir, output_dir).await,
        Command::CleanupOrphans { dry_run } => cleanup_orphans(dry_run).await,
    }
}

async fn run(
    manifest_path: std::path::PathBuf,
    results_dir: std::path::PathBuf,
    tmp_dir: std::path::PathBuf,
    chown: Option<String>,
) -> anyhow::Result<()> {
    let manifest: RunManifest = serde_json::from_slice(
        &tokio::fs::read(&manifest_path)
            .await
            .with_context(|| format!("reading manifest {}", manifest_path.display()))?,
    )
    .context("parsing run manifest")?;

    for instance in &manifest.instances {
        instance.validate().map_err(|err| anyhow::anyhow!(err))?;
    }

    let result_owner = chown.as_deref().map(cli::parse_chown).transpose()?;

    log::info!("connecting to container runtime...");
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(BollardRuntime::connect_docker().context("connecting to Docker daemon")?);
    log::info!("connected to {:?} runtime", RuntimeBackend::Docker);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    tokio::fs::create_dir_all(&tmp_dir).await?;

    let test_source = cli::build_test_source(&manifest.test_source, tmp_dir.join("checkout"))?;
    let uploader = cli::build_uploader(manifest.upload_url.as_deref(), &results_dir);

    // Instances run one after another on purpose: benchmarks must not
    // compete for host CPU/memory/disk bandwidth (§5).
    let mut failures = 0usize;
    for instance in manifest.instances {
        if cancel.is_cancelled() {
            log::warn!("cancellation requested, skipping remaining instances");
            break;
        }

        log::info!("running instance {}", instance.id);
        let supervisor = InstanceSupervisor::new(
            runtime.clone(),
            instance.clone(),
            results_dir.clone(),
            tmp_dir.clone(),
            test_source.clone(),
            uploader.clone(),
            result_owner,
            cancel.clone(),
        );

        match supervisor.run().await {
            Ok(RunStatus::Completed) => log::info!("instance {} completed", instance.id),
            Ok(status) => {
                log::warn!("instance {} finished with status {status:?}", instance.id);
                failures += 1;
            }
            Err(err) => {
                log::error!("instance {} failed: {err:#}", instance.id);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} instance(s) did not complete successfully");
    }
    Ok(())
}

async fn generate_index(results_dir: std::path::PathBuf, output: std::path::PathBuf) -> anyhow::Result<()> {
    let entries = benchmarkoor::index::generate_index(&results_dir.join("runs")).await?;
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&output, serde_json::to_vec_pretty(&entries)?).await?;
    log::info!("wrote {} index entries to {}", entries.len(), output.display());
    Ok(())
}

async fn generate_suite_stats(results_dir: std::path::PathBuf, output_dir: std::path::PathBuf) -> anyhow::Result<()> {
    let by_suite = benchmarkoor::index::generate_suite_stats(&results_dir.join("runs")).await?;
    tokio::fs::create_dir_all(&output_dir).await?;
    for (suite_hash, stats) in &by_suite {
        let path = output_dir.join(suite_hash).join("stats.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(stats)?).await?;
    }
    log::info!("wrote stats for {} suite(s) to {}", by_suite.len(), output_dir.display());
    Ok(())
}

async fn cleanup_orphans(dry_run: bool) -> anyhow::Result<()> {
    let orphans = orphans::sweep(dry_run).await?;
    if orphans.is_empty() {
        log::info!("no orphaned host state found");
    }
    for orphan in &orphans {
        log::info!("run {}: governor state restored = {}", orphan.run_id, orphan.restored);
    }
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("received interrupt, cancelling in-flight run...");
            cancel.cancel();
        }
    });
}
