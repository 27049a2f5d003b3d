//! Loadflow CLI entry point

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flowkit::domain::{ExecutionStatus, Workflow};
use loadflow::cli::{Cli, Command, OutputFormat};
use loadflow::config::Config;
use loadflow::master::{LogOutput, MasterRuntime};
use loadflow::slave::SlaveRuntime;
use loadflow::transport::run_listener;

fn setup_logging(verbose: bool) {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Master { listen } => {
            let mut master_config = config.master;
            if let Some(listen) = listen {
                master_config.listen = listen;
            }
            run_master(master_config).await
        }
        Command::Slave {
            master_addr,
            max_vus,
            id,
        } => {
            let mut slave_config = config.slave;
            if let Some(addr) = master_addr {
                slave_config.master_addr = addr;
            }
            if let Some(max_vus) = max_vus {
                slave_config.max_vus = max_vus;
            }
            if id.is_some() {
                slave_config.id = id;
            }
            run_slave(slave_config).await
        }
        Command::Run { file, format } => run_workflow(config, file, format).await,
    }
}

async fn run_master(config: loadflow::MasterConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .context(format!("Failed to bind {}", config.listen))?;

    let runtime = MasterRuntime::new(config);
    let handle = runtime.handle();
    runtime.outputs().register(Arc::new(LogOutput)).await?;
    tokio::spawn(run_listener(listener, runtime.events_sender()));
    let runtime_task = tokio::spawn(runtime.run());

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("shutting down");
    handle.shutdown().await;
    runtime_task.await.context("Master runtime task failed")?;
    Ok(())
}

async fn run_slave(config: loadflow::SlaveConfig) -> Result<()> {
    let runtime = SlaveRuntime::new(config);
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                shutdown.cancel();
            }
        });
    }

    runtime.run(shutdown).await
}

/// Load a pre-parsed workflow document and execute it on an embedded
/// master in standalone mode
async fn run_workflow(config: Config, file: std::path::PathBuf, format: OutputFormat) -> Result<()> {
    let content = std::fs::read_to_string(&file).context(format!("Failed to read {}", file.display()))?;
    let mut workflow: Workflow =
        serde_yaml::from_str(&content).context(format!("Failed to parse {}", file.display()))?;
    workflow.options.standalone = true;

    let runtime = MasterRuntime::new(config.master);
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let execution_id = handle
        .submit(workflow)
        .await
        .map_err(|e| eyre!("submission refused: {e}"))?;
    println!("{} {}", "execution".bold(), execution_id);

    let mut status = handle
        .subscribe_status(&execution_id)
        .await
        .ok_or_else(|| eyre!("execution vanished"))?;

    let final_status = loop {
        match status.recv().await {
            Ok(snapshot) => {
                println!(
                    "  {:>8} {:>6.1}s  iterations={} qps={:.1} errors={:.1}%",
                    snapshot.status.to_string().cyan(),
                    snapshot.elapsed_ms as f64 / 1000.0,
                    snapshot.iterations,
                    snapshot.qps,
                    snapshot.error_rate * 100.0,
                );
                if snapshot.status.is_terminal() {
                    break snapshot.status;
                }
            }
            Err(_) => {
                // publisher is gone; read the final state directly
                let state = handle.execution(&execution_id).await.ok_or_else(|| eyre!("execution vanished"))?;
                break state.status;
            }
        }
    };

    let report = handle.report(&execution_id).await.ok_or_else(|| eyre!("no final report"))?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report, final_status),
    }
    handle.shutdown().await;

    if final_status == ExecutionStatus::Completed && report.passed {
        Ok(())
    } else {
        Err(eyre!("execution {final_status}"))
    }
}

fn print_report(report: &loadflow::FinalReport, status: ExecutionStatus) {
    let verdict = match status {
        ExecutionStatus::Completed if report.passed => "passed".green().bold(),
        ExecutionStatus::Completed => "thresholds failed".yellow().bold(),
        other => other.to_string().red().bold(),
    };
    println!("\n{} {}", "result:".bold(), verdict);
    println!("  iterations: {}", report.metrics.iterations);
    for step in &report.metrics.steps {
        println!(
            "  step {:<20} count={:<6} failures={:<4} avg={:.1}ms p95={:.1}ms",
            step.step_id, step.count, step.failure_count, step.avg_ms, step.p95_ms
        );
    }
    for outcome in &report.thresholds {
        let mark = if outcome.passed { "ok".green() } else { "FAIL".red() };
        println!(
            "  threshold {} (actual: {})  [{}]",
            outcome.threshold.metric,
            outcome.actual.map_or("n/a".to_string(), |v| format!("{v:.2}")),
            mark
        );
    }
}
