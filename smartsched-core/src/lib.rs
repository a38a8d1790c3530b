//! Ядро планировщика процессов SmartSched.
//!
//! Монитор снимает снапшоты процессов, движок превращает их в решения по
//! выбранному режиму и алгоритму, контроллер применяет решения к ОС.
//! [`scheduler::Scheduler`] связывает всё в периодический цикл, а
//! [`run_daemon`] — точка входа для демона `smartschedd`.

pub mod analytics;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod policy;
pub mod scheduler;

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::scheduler::Scheduler;

pub use crate::error::{SchedError, SchedResult};

/// Callback функция для уведомления о готовности демона (например, для systemd notify).
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

/// Callback функция для обновления статуса демона (например, для systemd notify).
pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Как часто обновляется статус демона.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Статистика циклов планировщика.
///
/// Собирается во время работы: количество циклов, их длительность,
/// количество применённых команд и ошибок. Каждые 10 циклов логируется
/// через [`CycleStats::log_stats`].
///
/// # Примеры использования
///
/// ```
/// use smartsched_core::CycleStats;
///
/// let mut stats = CycleStats::new();
/// stats.record_successful_cycle(100, 5, 1);
/// stats.record_error_cycle();
///
/// assert_eq!(stats.total_cycles, 2);
/// assert_eq!(stats.average_cycle_duration_ms(), 100.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleStats {
    /// Общее количество циклов (успешных и с ошибками)
    pub total_cycles: u64,
    /// Циклы, в которых удалось снять снапшот
    pub successful_cycles: u64,
    /// Циклы, в которых перечисление процессов не удалось
    pub failed_cycles: u64,
    /// Суммарное время успешных циклов (мс)
    pub total_duration_ms: u128,
    pub max_cycle_duration_ms: u128,
    /// Применённые команды (приостановка, возобновление, nice)
    pub applied_commands: u64,
    pub command_errors: u64,
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Учесть успешный цикл.
    ///
    /// - `duration_ms`: время выполнения цикла
    /// - `applied`: количество успешно применённых команд
    /// - `errors`: количество команд, завершившихся ошибкой
    pub fn record_successful_cycle(&mut self, duration_ms: u128, applied: u64, errors: u64) {
        self.total_cycles += 1;
        self.successful_cycles += 1;
        self.total_duration_ms += duration_ms;
        self.max_cycle_duration_ms = self.max_cycle_duration_ms.max(duration_ms);
        self.applied_commands += applied;
        self.command_errors += errors;
    }

    /// Учесть цикл, в котором не удалось снять снапшот.
    pub fn record_error_cycle(&mut self) {
        self.total_cycles += 1;
        self.failed_cycles += 1;
    }

    /// Среднее время успешного цикла; 0.0, если успешных циклов не было.
    pub fn average_cycle_duration_ms(&self) -> f64 {
        if self.successful_cycles > 0 {
            self.total_duration_ms as f64 / self.successful_cycles as f64
        } else {
            0.0
        }
    }

    pub fn log_stats(&self) {
        info!(
            "Scheduler stats: {} total cycles ({} successful, {} failed), \
             avg cycle: {:.2}ms, max cycle: {}ms, \
             applied commands: {}, command errors: {}",
            self.total_cycles,
            self.successful_cycles,
            self.failed_cycles,
            self.average_cycle_duration_ms(),
            self.max_cycle_duration_ms,
            self.applied_commands,
            self.command_errors
        );
    }
}

/// Краткая строка статуса для systemd `STATUS=`.
pub fn status_line(scheduler: &Scheduler) -> String {
    let snapshot = scheduler.get_processes();
    format!(
        "mode={} algorithm={} processes={} suspended={} auto-suspended={}",
        scheduler.mode(),
        scheduler.algorithm(),
        snapshot.len(),
        snapshot.suspended_count(),
        scheduler.auto_suspended().len()
    )
}

/// Главный цикл демона.
///
/// Строит [`Scheduler`] поверх настоящей системы, запускает мониторинг и
/// работает, пока в `shutdown_rx` не придёт `true` (или отправитель не
/// исчезнет). Перед выходом текущий цикл доводится до конца.
///
/// ```no_run
/// use smartsched_core::{config::Config, run_daemon};
/// use tokio::sync::watch;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::default();
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let daemon = tokio::spawn(run_daemon(config, true, shutdown_rx, None, None));
/// shutdown_tx.send(true)?;
/// daemon.await??;
/// # Ok(())
/// # }
/// ```
pub async fn run_daemon(
    config: Config,
    dry_run: bool,
    mut shutdown_rx: watch::Receiver<bool>,
    on_ready: Option<ReadyCallback>,
    on_status_update: Option<StatusCallback>,
) -> Result<()> {
    info!("Initializing SmartSched daemon (dry_run = {})", dry_run || config.dry_run);

    let scheduler = Scheduler::from_config(&config, dry_run)?;
    scheduler.start_monitoring();

    info!("SmartSched daemon started");
    if let Some(ref callback) = on_ready {
        callback();
    }

    loop {
        if *shutdown_rx.borrow_and_update() {
            info!("Shutdown signal received, stopping monitoring");
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    warn!("Shutdown channel closed, stopping monitoring");
                    break;
                }
            }
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                if let Some(ref callback) = on_status_update {
                    callback(&status_line(&scheduler));
                }
            }
        }
    }

    scheduler.stop_monitoring().await;
    scheduler.cycle_stats().log_stats();
    Ok(())
}
