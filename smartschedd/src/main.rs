use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use smartsched_core::policy::classes::{Algorithm, Mode};
use smartsched_core::scheduler::Scheduler;
use smartsched_core::{config::Config, run_daemon};
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod systemd;

#[derive(Parser, Debug)]
#[command(name = "smartschedd", about = "SmartSched process scheduling daemon")]
struct Args {
    /// Путь к конфигу (без него используются значения по умолчанию)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dry-run: принимать решения, но не трогать процессы
    #[arg(long)]
    dry_run: bool,

    /// Начальный режим (gaming, productivity, power-saving)
    #[arg(long)]
    mode: Option<Mode>,

    /// Алгоритм вместо алгоритма режима (fcfs, sjf, priority, round-robin, hybrid)
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// Выполнить один цикл и напечатать снапшот в JSON
    #[arg(long)]
    once: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.algorithm.is_some() {
        config.algorithm = args.algorithm;
    }
    Ok(config)
}

async fn run_once(config: &Config, dry_run: bool) -> Result<()> {
    let scheduler = Scheduler::from_config(config, dry_run)?;
    let snapshot = scheduler.run_cycle().await?;
    // один цикл не должен оставлять процессы остановленными
    scheduler.release_auto_suspended().await;
    let json = serde_json::to_string_pretty(&*snapshot).context("failed to serialize snapshot")?;
    println!("{json}");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler, using Ctrl-C only");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout остаётся чистым для --once
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;

    if args.once {
        return run_once(&config, args.dry_run).await;
    }

    info!("Starting SmartSched daemon (dry_run = {})", args.dry_run);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Received SIGINT/SIGTERM, initiating graceful shutdown");
        let _ = shutdown_tx.send(true);
    });

    let on_ready: smartsched_core::ReadyCallback = Box::new(|| {
        if let Err(e) = systemd::notify_ready() {
            debug!(error = %e, "systemd notification skipped");
        }
    });
    let on_status: smartsched_core::StatusCallback = Box::new(systemd::notify_status);

    run_daemon(config, args.dry_run, shutdown_rx, Some(on_ready), Some(on_status)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from(["smartschedd", "--mode", "gaming", "--algorithm", "rr"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.mode, Mode::Gaming);
        assert_eq!(config.algorithm, Some(Algorithm::RoundRobin));
    }

    #[test]
    fn cli_rejects_unknown_mode() {
        assert!(Args::try_parse_from(["smartschedd", "--mode", "turbo"]).is_err());
    }

    #[test]
    fn defaults_without_config() {
        let args = Args::parse_from(["smartschedd", "--once", "--dry-run"]);
        assert!(args.once && args.dry_run);
        assert_eq!(load_config(&args).unwrap(), Config::default());
    }
}
