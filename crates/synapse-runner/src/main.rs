//! Synapse runner entry point.
//!
//! Binary name: `synapse`
//!
//! `run` publishes workflow definitions, starts the instance runner and the
//! correlator against the configured repository and keeps them going until
//! Ctrl+C or SIGTERM. `validate` checks definition files without starting
//! anything.

mod cli;
mod engine;
mod ingest;
mod publish;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use synapse_core::definition::{discover_workflows, load_workflow_file};
use synapse_core::repository::{MemoryResourceRepository, ResourceRepository};
use synapse_infra::config::{load_config, resolve_config_path};
use synapse_infra::sqlite::{default_database_url, DatabasePool, SqliteResourceRepository};
use synapse_observe::tracing_setup::{init_tracing, shutdown_tracing};
use synapse_types::config::SynapseConfig;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use engine::{Engine, Services};
use ingest::ingest_events;
use publish::publish_definition;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = load_config(&config_path).await;
    init_tracing(cli.otel || config.observability.otel).map_err(|e| anyhow::anyhow!("{e}"))?;

    let result = match cli.command {
        Commands::Run {
            workflows,
            events,
            persist,
        } => {
            let mut config = config;
            if config.database.url.is_empty() && persist {
                config.database.url = default_database_url();
                if let Some(dir) = sqlite_parent_dir(&config.database.url) {
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .with_context(|| format!("failed to create {}", dir.display()))?;
                }
            }
            if config.database.url.is_empty() {
                tracing::warn!("no database configured, resources are kept in memory");
                run(Arc::new(MemoryResourceRepository::new()), &config, workflows, events).await
            } else {
                let pool = DatabasePool::new(&config.database.url)
                    .await
                    .with_context(|| format!("failed to open database {}", config.database.url))?;
                run(Arc::new(SqliteResourceRepository::new(pool)), &config, workflows, events).await
            }
        }
        Commands::Validate { paths } => validate(&paths),
    };

    shutdown_tracing();
    result
}

async fn run<R: ResourceRepository + 'static>(
    repo: Arc<R>,
    config: &SynapseConfig,
    workflows: Option<PathBuf>,
    events: Option<String>,
) -> anyhow::Result<()> {
    if let Some(dir) = workflows {
        let namespace = config.runner.namespace.as_str();
        for (path, definition) in discover_workflows(&dir)? {
            let published = publish_definition(repo.as_ref(), namespace, &definition)
                .await
                .with_context(|| format!("failed to publish {}", path.display()))?;
            tracing::debug!(path = %path.display(), ?published, "workflow file processed");
        }
    }

    let engine = Engine::start(repo, Services::build(config)?, config).await?;

    let cancel = CancellationToken::new();
    let ingestor = events.map(|source| {
        let bus = engine.events.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = if source == "-" {
                ingest_events(BufReader::new(tokio::io::stdin()), &bus, &cancel).await
            } else {
                match tokio::fs::File::open(&source).await {
                    Ok(file) => ingest_events(BufReader::new(file), &bus, &cancel).await,
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                tracing::error!(source = source.as_str(), error = %e, "event ingestion failed");
            }
        })
    });

    println!("\n  Synapse running (Ctrl+C to stop)\n");
    shutdown_signal().await;
    tracing::info!("shutdown requested");

    cancel.cancel();
    if let Some(handle) = ingestor
        && let Err(e) = handle.await
    {
        tracing::warn!(error = %e, "event ingestion task aborted");
    }
    engine.shutdown().await?;
    println!("\n  Synapse stopped.");
    Ok(())
}

/// Directory holding the database file of a `sqlite://` URL.
fn sqlite_parent_dir(url: &str) -> Option<PathBuf> {
    let path = url.strip_prefix("sqlite://")?;
    let path = path.split('?').next().unwrap_or(path);
    Path::new(path)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Check every definition file under `paths`, reporting all failures.
fn validate(paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut files = Vec::new();
    for path in paths {
        collect_definition_files(path, &mut files)?;
    }

    let mut invalid = 0;
    for file in &files {
        match load_workflow_file(file) {
            Ok(def) => println!("  ok     {} ({} v{})", file.display(), def.id, def.version),
            Err(e) => {
                invalid += 1;
                println!("  error  {}: {e}", file.display());
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} of {} workflow definition(s) invalid", files.len());
    }
    println!("\n  {} workflow definition(s) valid", files.len());
    Ok(())
}

fn collect_definition_files(path: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if !path.is_dir() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    let mut entries = std::fs::read_dir(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        let is_definition = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json");
        if path.is_dir() || is_definition {
            collect_definition_files(&path, files)?;
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
