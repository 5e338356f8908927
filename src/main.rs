//! Flotilla - ephemeral multi-container clusters for integration tests
//!
//! This is the main CLI entry point for Flotilla.

use clap::{Parser, Subcommand};
use flotilla::cluster::{ClusterManifest, ManifestParser, StartMode};
use flotilla::container::DockerRuntime;
use flotilla::error::{FlotillaError, Result};
use flotilla::node::{ProfileKind, ServiceProfile};
use flotilla::settings::Settings;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Flotilla - ephemeral multi-container test clusters
#[derive(Parser)]
#[command(name = "flotilla")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Ephemeral multi-container clusters for integration tests", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Settings file (defaults to $FLOTILLA_CONFIG or ~/.flotilla.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster and keep it running until Ctrl-C
    Up {
        /// Manifest file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Start independent services concurrently
        #[arg(long)]
        parallel: bool,
        /// Attach to identical running services where allowed
        #[arg(long)]
        reuse: bool,
        /// Print endpoints as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a manifest and show its start order
    Config {
        /// Manifest file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List the built-in service profiles
    Profiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = match cli.config {
        Some(ref path) => {
            let mut settings = Settings::from_file(path)?;
            settings.apply_env_from(|name| std::env::var(name).ok())?;
            settings
        }
        None => Settings::load()?,
    };

    match cli.command {
        Commands::Up {
            file,
            parallel,
            reuse,
            json,
        } => {
            if parallel {
                settings.start_mode = StartMode::Parallel;
            }
            if reuse {
                settings.reuse_enabled = true;
            }

            let manifest = load_manifest(file)?;
            for warning in ManifestParser::validate(&manifest)? {
                tracing::warn!("{}", warning);
            }

            let name = manifest.name.clone().unwrap_or_else(|| "flotilla".to_string());
            let runtime = Arc::new(DockerRuntime::from_settings(&settings));

            let mut orchestrator = manifest.build_orchestrator(&settings, runtime)?;
            if parallel {
                orchestrator = orchestrator.with_start_mode(StartMode::Parallel);
            }

            let interrupted = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };

            if let Err(e) = orchestrator.start_until(interrupted).await {
                for secondary in e.teardown_errors() {
                    tracing::warn!("Teardown: {}", secondary);
                }
                return Err(e);
            }

            let endpoints = orchestrator.endpoints()?;
            if json {
                println!("{}", serde_json::to_string_pretty(endpoints)?);
            } else {
                println!("{:<20} {:<28} {}", "SERVICE", "INTERNAL", "EXTERNAL");
                for (service, endpoint) in endpoints {
                    println!("{:<20} {:<28} {}", service, endpoint.internal.to_string(), endpoint.external);
                }
            }

            println!("Cluster {} is running, press Ctrl-C to stop", name);
            tokio::signal::ctrl_c().await?;

            orchestrator.stop().await?;
            println!("Cluster {} stopped", name);
        }

        Commands::Config { file } => {
            let manifest = load_manifest(file)?;
            let warnings = ManifestParser::validate(&manifest)?;
            let graph = manifest.build_graph()?;

            for warning in &warnings {
                println!("warning: {}", warning);
            }

            println!(
                "{} services, start order: {}",
                graph.len(),
                graph.topological_start_order()?.join(" -> ")
            );
        }

        Commands::Profiles => {
            println!("{:<16} {:<46} {:<16} {:<6} {}", "PROFILE", "IMAGE", "ALIAS", "PORT", "READINESS");
            for kind in ProfileKind::ALL {
                let profile = ServiceProfile::for_kind(kind);
                let image = profile.image
                    .as_ref()
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let alias = if profile.alias.is_empty() { "<name>" } else { profile.alias.as_str() };

                println!(
                    "{:<16} {:<46} {:<16} {:<6} {}",
                    kind.to_string(), image, alias, profile.port, profile.readiness
                );
            }
        }
    }

    Ok(())
}

/// Read the manifest given on the command line or found in the working directory
fn load_manifest(file: Option<PathBuf>) -> Result<ClusterManifest> {
    let path = match file {
        Some(path) => path,
        None => {
            let working_dir = std::env::current_dir()?;
            find_manifest(&working_dir)?
        }
    };

    ManifestParser::parse_file(&path)
}

fn find_manifest(dir: &Path) -> Result<PathBuf> {
    ManifestParser::find_manifest_file(dir).ok_or_else(|| {
        FlotillaError::InvalidConfig(format!("No cluster manifest found in {}", dir.display()))
    })
}
