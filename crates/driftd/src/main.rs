//! driftd - configuration drift detection and canary remediation.
//!
//! Invoked by an external scheduler (cron/systemd timer); each invocation
//! runs a single cycle and exits. Exit code 1 signals detected drift or an
//! unsuccessful plan.

use anyhow::Result;
use clap::Parser;
use driftd::cli::{self, Cli, Commands};
use drift_common::EngineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();

    info!("driftd v{} starting", env!("CARGO_PKG_VERSION"));

    // Fail fast before any node is touched.
    let config = EngineConfig::load_from_path(&args.config)?;

    let code = match args.command {
        Commands::Detect { format } => cli::detect(config, format).await?,
        Commands::Remediate { format, from_latest } => {
            cli::remediate(config, format, from_latest).await?
        }
        Commands::Audit { last, format } => cli::audit(config, last, format).await?,
    };

    std::process::exit(code);
}
