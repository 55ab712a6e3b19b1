use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use gantry::catalog::{Catalog, DbHandle};
use gantry::compose::{BaseLibrary, Composition, compose};
use gantry::config::GantryConfig;
use gantry::engine::{DockerEngine, cleanup_orphans};
use gantry::orchestrator::Orchestrator;
use gantry::pipeline::no_credentials_resolver;
use gantry::proxy::ProxyManager;
use gantry::reconcile::Reconciler;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version, about = "Container lifecycle orchestrator for Streamlit apps")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "gantry.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the task workers until interrupted
    Serve,
    /// Render a Dockerfile for the given composition parameters
    Preview {
        /// App entry file
        #[arg(long, default_value = "streamlit_app.py")]
        entry_file: String,
        /// Base image choice (auto, minimal, py39, py310, py311)
        #[arg(long, default_value = "auto")]
        base: String,
        /// Custom base image overriding the choice
        #[arg(long)]
        custom_base_image: Option<String>,
        /// File containing overlay Dockerfile instructions
        #[arg(long)]
        overlay_file: Option<PathBuf>,
        /// requirements.txt to classify
        #[arg(long)]
        requirements_file: Option<PathBuf>,
    },
    /// Print the reconciled status of every app
    Status,
    /// Remove orphaned containers and stale proxy fragments
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = GantryConfig::load_or_default(&cli.config)?;
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Preview {
            entry_file,
            base,
            custom_base_image,
            overlay_file,
            requirements_file,
        } => preview(
            &config,
            &entry_file,
            &base,
            custom_base_image,
            overlay_file,
            requirements_file,
        ),
        Commands::Status => status(config).await,
        Commands::Cleanup => cleanup(config).await,
    }
}

async fn serve(config: GantryConfig) -> Result<()> {
    let catalog = DbHandle::new(Catalog::open(&config.catalog.db_path)?);
    let engine = Arc::new(
        DockerEngine::connect()
            .await
            .context("container engine must be reachable")?,
    );
    let orchestrator =
        Orchestrator::start(&config, catalog, engine, no_credentials_resolver()).await?;

    info!(workers = config.platform.workers, "gantry workers running");
    tokio::signal::ctrl_c().await.context("install ctrl_c")?;
    info!("shutting down, draining in-flight tasks");
    orchestrator.shutdown().await;
    Ok(())
}

fn preview(
    config: &GantryConfig,
    entry_file: &str,
    base: &str,
    custom_base_image: Option<String>,
    overlay_file: Option<PathBuf>,
    requirements_file: Option<PathBuf>,
) -> Result<()> {
    let bases = BaseLibrary::load(&config.paths.base_dockerfiles)?;
    let overlay = overlay_file
        .map(|p| std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display())))
        .transpose()?;
    let requirements = requirements_file
        .map(|p| std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display())))
        .transpose()?;
    let classification = requirements
        .as_deref()
        .map(gantry::analyzer::classify_requirements)
        .unwrap_or_default();

    let rendered = compose(
        &bases,
        &Composition {
            app_id: 0,
            entry_file,
            base_image_choice: base.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            custom_base_image: custom_base_image.as_deref(),
            custom_overlay: overlay.as_deref(),
            has_requirements: requirements.is_some(),
            classification: &classification,
        },
    )?;
    if let Some(variant) = rendered.variant {
        eprintln!("# variant: {variant}");
    }
    eprintln!("# sha256: {}", rendered.content_hash);
    println!("{}", rendered.dockerfile);
    Ok(())
}

async fn status(config: GantryConfig) -> Result<()> {
    let catalog = DbHandle::new(Catalog::open(&config.catalog.db_path)?);
    let engine = Arc::new(
        DockerEngine::connect()
            .await
            .context("container engine must be reachable")?,
    );
    let proxy = Arc::new(ProxyManager::new(
        config.paths.proxy_fragments.clone(),
        config.proxy.container.clone(),
        config.proxy.system_fragments.clone(),
        engine.clone(),
        Duration::from_secs(config.timeouts.reload_secs),
    ));
    let reconciler = Reconciler::new(catalog.clone(), engine, proxy);

    let apps = catalog.call(|c| c.list_apps()).await?;
    for app in &apps {
        let report = reconciler.status_of(app).await?;
        println!(
            "{:>5}  {:<40}  declared={:<10} actual={}",
            app.id, app.subdomain, report.declared, report.actual
        );
        if let Some(diagnostic) = report.diagnostic {
            println!("       {diagnostic}");
        }
    }
    if apps.is_empty() {
        println!("no apps registered");
    }
    Ok(())
}

async fn cleanup(config: GantryConfig) -> Result<()> {
    let catalog = DbHandle::new(Catalog::open(&config.catalog.db_path)?);
    let engine = Arc::new(
        DockerEngine::connect()
            .await
            .context("container engine must be reachable")?,
    );
    let proxy = ProxyManager::new(
        config.paths.proxy_fragments.clone(),
        config.proxy.container.clone(),
        config.proxy.system_fragments.clone(),
        engine.clone(),
        Duration::from_secs(config.timeouts.reload_secs),
    );

    let apps = catalog.call(|c| c.list_apps()).await?;
    let active_ids = apps.iter().map(|a| a.id).collect();
    let report = cleanup_orphans(engine.as_ref(), &active_ids).await?;
    println!(
        "containers: removed {}, failed {}",
        report.removed.len(),
        report.failed.len()
    );

    let active_subdomains = apps
        .iter()
        .filter(|a| {
            matches!(
                a.status,
                gantry::catalog::models::AppStatus::Running
                    | gantry::catalog::models::AppStatus::Building
                    | gantry::catalog::models::AppStatus::Deploying
            )
        })
        .map(|a| a.subdomain.clone())
        .collect();
    let removed = proxy.cleanup(&active_subdomains).await?;
    println!("fragments: removed {}", removed.len());
    Ok(())
}
