//! Tugboat
//!
//! Provisions a single-node cluster on a cloud instance, publishes the
//! application image and rolls it out, then verifies the public endpoint.
//!
//! Architecture:
//! - Configuration: defaults, optional TOML file, environment, CLI flags
//! - Process/Remote: timeout-bounded external tools and the ssh shell
//! - Services: provisioning, publishing, rollout, verification, diagnostics
//! - Pipeline: stage sequencing, state, and failure diagnosis
//!
//! Exit codes: 0 on success, 1 when a stage fails, 2 on configuration errors.

mod config;
mod manifest;
mod pipeline;
mod poller;
mod process;
mod remote;
mod service;
mod summary;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tugboat_core::domain::state::Credential;

use crate::config::Config;
use crate::manifest::ManifestSet;
use crate::pipeline::{Pipeline, ProvisionMode};
use crate::remote::{ClusterHandle, ShellConnector, SshConnector};
use crate::service::{
    DiagnosticsCollector, DockerPublisher, HttpProbe, ReqwestProbe, TerraformProvisioner,
};

#[derive(Parser)]
#[command(name = "tugboat")]
#[command(about = "Provision, publish, roll out and verify an application", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, global = true, env = "TUGBOAT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full deployment pipeline
    Deploy {
        /// Reuse an existing instance instead of running terraform
        #[arg(long)]
        skip_provision: bool,

        /// Address of the existing instance
        #[arg(long, env = "TUGBOAT_INSTANCE_ADDRESS")]
        address: Option<String>,

        /// Private key for the existing instance
        #[arg(long, env = "TUGBOAT_SSH_KEY_FILE")]
        key_file: Option<PathBuf>,

        /// Image tag to publish, overriding the configuration
        #[arg(long)]
        tag: Option<String>,

        /// Write the run result, including diagnostics, as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the manifests a deploy would apply, without touching anything
    Render {
        /// Image tag to render, overriding the configuration
        #[arg(long)]
        tag: Option<String>,
    },

    /// Collect a diagnostics report from an existing instance
    Diagnose {
        #[arg(long, env = "TUGBOAT_INSTANCE_ADDRESS")]
        address: String,

        #[arg(long, env = "TUGBOAT_SSH_KEY_FILE")]
        key_file: PathBuf,

        /// Write the report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tugboat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Deploy {
            skip_provision,
            address,
            key_file,
            tag,
            report,
        } => {
            let config = load_config(config_path, tag)?;
            let mode = if skip_provision {
                let address = address
                    .context("--skip-provision needs --address or TUGBOAT_INSTANCE_ADDRESS")?;
                let key_file = key_file
                    .context("--skip-provision needs --key-file or TUGBOAT_SSH_KEY_FILE")?;
                ProvisionMode::Existing {
                    address,
                    credential: read_key(&key_file)?,
                }
            } else {
                ProvisionMode::Provision
            };
            deploy(config, mode, report.as_deref()).await
        }
        Commands::Render { tag } => {
            let config = load_config(config_path, tag)?;
            render(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Diagnose {
            address,
            key_file,
            report,
        } => {
            let config = load_config(config_path, None)?;
            let credential = read_key(&key_file)?;
            diagnose(&config, &address, &credential, report.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Loads and validates configuration, applying CLI overrides last
fn load_config(path: Option<&Path>, tag: Option<String>) -> Result<Config> {
    let mut config = Config::load(path).context("Failed to load configuration")?;
    if let Some(tag) = tag {
        config.image.tag = tag;
        config.validate().context("Invalid --tag")?;
    }
    info!(
        "Loaded configuration: region={}, image={}, replicas={}",
        config.region,
        config.image_reference(),
        config.deployment.replicas
    );
    Ok(config)
}

fn read_key(path: &Path) -> Result<Credential> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    Ok(Credential::new(pem))
}

async fn deploy(config: Config, mode: ProvisionMode, report: Option<&Path>) -> Result<ExitCode> {
    let http: Arc<dyn HttpProbe> =
        Arc::new(ReqwestProbe::new().context("Failed to initialise http client")?);
    let provisioner = Arc::new(TerraformProvisioner::new(
        config.terraform.clone(),
        config.timeouts.clone(),
    ));
    let publisher = Arc::new(DockerPublisher::new(
        config.image.clone(),
        config.registry.clone(),
        config.timeouts.clone(),
    ));
    let connector = Arc::new(SshConnector::new(
        config.ssh.clone(),
        config.timeouts.remote_command(),
    ));

    let pipeline = Pipeline::new(config, mode, provisioner, publisher, connector, http);
    let result = pipeline.run().await;

    if let Some(path) = report {
        match write_json(path, &result) {
            Ok(()) => info!("Run report written to {}", path.display()),
            Err(e) => warn!("Failed to write run report: {:#}", e),
        }
    }

    summary::print_summary(&result);
    Ok(ExitCode::from(result.exit_code() as u8))
}

fn render(config: &Config) -> Result<()> {
    let spec = config.deployment_spec(&config.image_reference());
    spec.validate().context("Invalid deployment spec")?;

    let manifests = ManifestSet::render(&spec, config.pull_secret().as_ref());
    println!("{}", manifests.to_display());
    if manifests.has_secret() {
        println!(
            "{}",
            format!(
                "# image pull secret `{}` omitted",
                spec.image_pull_secret.unwrap_or_default()
            )
            .dimmed()
        );
    }
    Ok(())
}

async fn diagnose(
    config: &Config,
    address: &str,
    credential: &Credential,
    report: Option<&Path>,
) -> Result<()> {
    let http: Arc<dyn HttpProbe> =
        Arc::new(ReqwestProbe::new().context("Failed to initialise http client")?);
    let connector = SshConnector::new(config.ssh.clone(), config.timeouts.remote_command());

    let cluster = match connector.connect(address, credential) {
        Ok(shell) => Some(ClusterHandle::new(shell, config.cluster.kubectl.clone())),
        Err(e) => {
            warn!("Could not open a shell to {}: {}", address, e);
            None
        }
    };

    let collector = DiagnosticsCollector::new(config, http);
    let diagnostics = collector.collect(cluster.as_ref(), Some(address)).await;
    println!("{}", diagnostics.render());

    if let Some(path) = report {
        write_json(path, &diagnostics)?;
        info!("Diagnostics written to {}", path.display());
    }
    Ok(())
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}
