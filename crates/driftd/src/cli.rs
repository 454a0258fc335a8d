//! Command surface of the `driftd` binary.
//!
//! Three subcommands cover the engine's external trigger points: `detect`
//! runs one detection cycle (exit code 1 when drift was found), `remediate`
//! runs detection plus a canary remediation plan, and `audit` prints the
//! append-only trail.

use crate::audit::AuditLogger;
use crate::backup::BackupManager;
use crate::classify::Classifier;
use crate::collector::StateCollector;
use crate::detect::DetectionRunner;
use crate::invoker::{ConvergenceInvoker, PlaybookInvoker};
use crate::lease::NodeLeases;
use crate::notify::{LogNotifier, Notifier, SeverityGate};
use crate::orchestrator::{cancel_channel, Orchestrator};
use crate::registry::ManifestRegistry;
use crate::report::ReportEmitter;
use crate::rollback::RollbackManager;
use crate::transport::{RemoteChannel, SshChannel};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use drift_common::config::CONFIG_PATH;
use drift_common::plan::PlanOutcome;
use drift_common::types::{DetectionReport, NodeCycleStatus, Severity};
use drift_common::EngineConfig;
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "driftd")]
#[command(about = "Configuration drift detection and canary remediation", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Engine configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one detection cycle across the fleet
    Detect {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Detect and then remediate drifted nodes (canary first)
    Remediate {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Plan against the latest sealed report instead of re-collecting
        #[arg(long)]
        from_latest: bool,
    },

    /// Print the audit trail
    Audit {
        /// Show only the most recent N entries
        #[arg(long, default_value_t = 20)]
        last: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Everything a command needs, wired once from the configuration.
struct Engine {
    config: EngineConfig,
    registry: Arc<ManifestRegistry>,
    runner: DetectionRunner,
    orchestrator: Orchestrator,
    emitter: ReportEmitter,
    audit: Arc<AuditLogger>,
    cancel_tx: tokio::sync::watch::Sender<bool>,
}

async fn build(config: EngineConfig) -> Result<Engine> {
    let registry = ManifestRegistry::load(Path::new(&config.detection.manifest_path))
        .await
        .context("loading fleet manifest")?;
    let registry = Arc::new(registry);

    let channel: Arc<dyn RemoteChannel> = Arc::new(SshChannel::new(
        &config.transport.ssh_user,
        config.transport.connect_timeout(),
        config.transport.op_timeout(),
    ));
    let collector = Arc::new(StateCollector::new(channel.clone()));
    let classifier = Arc::new(Classifier::new(config.classify.clone()));
    let audit = Arc::new(AuditLogger::open(&config.audit).await.context("opening audit trail")?);
    let notifier: Arc<dyn Notifier> = Arc::new(SeverityGate::new(
        Arc::new(LogNotifier),
        config.detection.notify_threshold,
    ));
    let leases = NodeLeases::new();

    let runner = DetectionRunner::new(
        collector.clone(),
        classifier.clone(),
        ReportEmitter::new(&config.detection.report_dir),
        audit.clone(),
        notifier.clone(),
        leases.clone(),
        config.detection.max_concurrent_nodes,
    );

    let invoker: Arc<dyn ConvergenceInvoker> = Arc::new(PlaybookInvoker::new(
        &config.remediation.playbook,
        &config.remediation.inventory,
        config.transport.op_timeout(),
    ));
    let backups = Arc::new(BackupManager::new(
        channel.clone(),
        &config.remediation.backup_dir,
    ));
    let rollback = Arc::new(RollbackManager::new(channel));

    let (cancel_tx, cancel_rx) = cancel_channel();
    let orchestrator = Orchestrator::new(
        collector,
        classifier,
        backups,
        rollback,
        invoker,
        audit.clone(),
        notifier,
        leases,
        config.remediation.clone(),
        config.detection.max_concurrent_nodes,
        cancel_rx,
    );

    let emitter = ReportEmitter::new(&config.detection.report_dir);
    Ok(Engine {
        config,
        registry,
        runner,
        orchestrator,
        emitter,
        audit,
        cancel_tx,
    })
}

/// Run one detection cycle. Exit code 1 when drift was detected, 0 when the
/// fleet is clean.
pub async fn detect(config: EngineConfig, format: OutputFormat) -> Result<i32> {
    let engine = build(config).await?;
    let report = engine.runner.run_cycle(engine.registry.clone()).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }

    Ok(if report.summary.total > 0 { 1 } else { 0 })
}

/// Run detection (or reuse the latest sealed report) and drive a canary
/// remediation plan for the drifted nodes.
pub async fn remediate(config: EngineConfig, format: OutputFormat, from_latest: bool) -> Result<i32> {
    let engine = build(config).await?;

    // Ctrl-C requests a stop at the next safe checkpoint rather than an
    // immediate abort.
    let cancel_tx = engine.cancel_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancellation requested; stopping at next safe checkpoint");
            let _ = cancel_tx.send(true);
        }
    });

    let report = if from_latest {
        engine
            .emitter
            .load_latest()
            .await?
            .context("no sealed report found; run `driftd detect` first")?
    } else {
        engine.runner.run_cycle(engine.registry.clone()).await?
    };

    let plan = engine
        .orchestrator
        .run_plan(&report, engine.registry.clone())
        .await?;

    let Some(plan) = plan else {
        if format == OutputFormat::Text {
            println!("{} fleet matches desired state; no plan created", "[OK]".green());
        }
        return Ok(0);
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => {
            println!(
                "Plan {} for report {}: {}",
                plan.id,
                plan.report_id,
                outcome_label(plan.outcome)
            );
            println!("  canary: {}", plan.canary.join(", "));
            if !plan.full.is_empty() {
                println!("  full:   {}", plan.full.join(", "));
            }
            for attempt in &plan.attempts {
                println!("  {:<20} {:?} ({:?})", attempt.node, attempt.outcome, attempt.phase);
            }
            for rec in &plan.recommendations {
                println!(
                    "  {} {}: {}",
                    "[ACTION]".bright_red().bold(),
                    rec.action,
                    rec.detail
                );
            }
        }
    }

    Ok(if plan.outcome == PlanOutcome::Success { 0 } else { 1 })
}

/// Print the audit trail, newest last.
pub async fn audit(config: EngineConfig, last: usize, format: OutputFormat) -> Result<i32> {
    let engine = build(config).await?;
    let entries = engine.audit.read_all().await?;
    let start = entries.len().saturating_sub(last);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries[start..])?),
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("audit trail is empty ({})", engine.config.audit.dir);
                return Ok(0);
            }
            for entry in &entries[start..] {
                println!(
                    "#{:<6} {}  {:<11} {}",
                    entry.seq,
                    entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.payload.kind(),
                    entry.payload.summary_line()
                );
            }
        }
    }

    info!("Printed {} of {} audit entries", entries.len() - start, entries.len());
    Ok(0)
}

fn print_report(report: &DetectionReport) {
    let clean = report
        .nodes
        .values()
        .filter(|s| **s == NodeCycleStatus::Clean)
        .count();
    let drifted = report.drifted_nodes().len();
    let unreachable = report
        .nodes
        .values()
        .filter(|s| **s == NodeCycleStatus::Unreachable)
        .count();

    println!("Report {}", report.id);
    println!(
        "  nodes: {} total, {} clean, {} drifted, {} unreachable",
        report.nodes.len(),
        clean,
        drifted,
        unreachable
    );

    if report.summary.total == 0 {
        println!("  {} no drift detected", "[OK]".green());
        return;
    }

    let counts: Vec<String> = report
        .summary
        .by_severity
        .iter()
        .rev()
        .map(|(severity, n)| format!("{}: {}", paint(*severity), n))
        .collect();
    println!("  drift: {} records ({})", report.summary.total, counts.join(", "));

    for record in &report.records {
        println!(
            "  {:<20} {:<40} {:<13} {}",
            record.node,
            record.item,
            record.category.to_string(),
            paint(record.severity)
        );
    }
}

fn outcome_label(outcome: PlanOutcome) -> String {
    match outcome {
        PlanOutcome::Success => "success".green().to_string(),
        PlanOutcome::RolledBack => "rolled back".yellow().bold().to_string(),
        PlanOutcome::Failed => "failed".bright_red().bold().to_string(),
        PlanOutcome::Pending => "pending".to_string(),
    }
}

fn paint(severity: Severity) -> String {
    match severity {
        Severity::Critical => "critical".bright_red().bold().to_string(),
        Severity::High => "high".red().to_string(),
        Severity::Medium => "medium".yellow().to_string(),
        Severity::Low => "low".green().to_string(),
    }
}
