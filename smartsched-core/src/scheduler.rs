//! Координатор: цикл мониторинга и публичный интерфейс планировщика.
//!
//! [`Scheduler`] владеет текущим режимом, алгоритмом, параметрами и последним
//! снапшотом. Каждый цикл:
//!
//! 1. `ProcessMonitor::sample` снимает снапшот;
//! 2. `SchedulingEngine::decide` вычисляет решения для текущего состояния;
//! 3. `ProcessController` приостанавливает кандидатов, возобновляет процессы,
//!    которые планировщик приостановил сам и которые больше не кандидаты, и
//!    применяет nice;
//! 4. при нехватке памяти приостанавливаются самые тяжёлые фоновые процессы
//!    ([`MemoryPressurePolicy`]), они возвращаются, когда давление спадает;
//! 5. снапшот атомарно публикуется для [`Scheduler::get_processes`].
//!
//! Сеттеры меняют состояние, которое прочитает следующий цикл. Ошибки по
//! отдельным процессам логируются и никогда не останавливают цикл. При
//! остановке мониторинга все автоматически приостановленные процессы
//! возобновляются.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analytics::{PerformanceAnalyzer, PerformanceStats, ProcessDistribution};
use crate::config::Config;
use crate::controller::backend::{DryRunBackend, NixBackend, ProcessBackend};
use crate::controller::planner::{plan_priority_changes, ApplyResult, NiceBand, RoundRobinRotator};
use crate::controller::{CommandOutcome, ProcessController};
use crate::error::{SchedError, SchedResult};
use crate::metrics::foreground::{default_detector, ForegroundDetector};
use crate::metrics::process::{ProcessSource, ProcfsSource};
use crate::metrics::system::{MemoryInfo, SystemMetrics};
use crate::monitor::{ProcessMonitor, Snapshot};
use crate::policy::classes::{Algorithm, Mode};
use crate::policy::engine::{DecisionSet, SchedulingEngine};
use crate::policy::mode::ModePolicy;
use crate::policy::params::SchedulingParameters;
use crate::policy::pressure::{MemoryPressurePolicy, PressureLevel};
use crate::policy::protection::ProtectionList;
use crate::CycleStats;

/// Изменяемое состояние планирования, которое читает каждый цикл.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub mode: Mode,
    /// Явный выбор пользователя; сбрасывается при смене режима.
    pub algorithm_override: Option<Algorithm>,
    pub params: SchedulingParameters,
}

impl SchedulerState {
    /// Действующий алгоритм: явный выбор или алгоритм режима.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm_override
            .unwrap_or_else(|| ModePolicy::for_mode(self.mode).default_algorithm)
    }
}

/// Внешние зависимости планировщика.
pub struct SchedulerParts {
    pub source: Arc<dyn ProcessSource>,
    pub detector: Box<dyn ForegroundDetector>,
    pub backend: Arc<dyn ProcessBackend>,
    pub system_metrics: SystemMetrics,
}

impl SchedulerParts {
    /// Настоящая система: `/proc`, X11/терминал, сигналы и `setpriority`.
    pub fn system(dry_run: bool) -> Self {
        let backend: Arc<dyn ProcessBackend> = if dry_run {
            Arc::new(DryRunBackend::new(Arc::new(NixBackend)))
        } else {
            Arc::new(NixBackend)
        };
        Self {
            source: Arc::new(ProcfsSource::new()),
            detector: default_detector(),
            backend,
            system_metrics: SystemMetrics::new(),
        }
    }
}

/// Почему планировщик приостановил процесс.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuspendCause {
    /// Правило текущего режима.
    Mode,
    /// Нехватка памяти; держится, пока давление не спадёт.
    MemoryPressure,
}

struct MonitorTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Координатор планировщика.
pub struct Scheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<MonitorTask>>,
}

struct Inner {
    monitor: Arc<Mutex<ProcessMonitor>>,
    system: Arc<SystemMetrics>,
    engine: SchedulingEngine,
    controller: Arc<ProcessController>,
    polling_interval: Duration,
    band: NiceBand,
    pressure: MemoryPressurePolicy,
    state: RwLock<SchedulerState>,
    snapshot: RwLock<Arc<Snapshot>>,
    decisions: RwLock<Option<Arc<DecisionSet>>>,
    auto_suspended: Mutex<HashMap<i32, SuspendCause>>,
    rotator: Mutex<RoundRobinRotator>,
    analyzer: Mutex<PerformanceAnalyzer>,
    stats: Mutex<CycleStats>,
    // один цикл за раз, даже если run_cycle вызван вручную
    cycle_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// Планировщик поверх настоящей системы.
    pub fn from_config(config: &Config, dry_run: bool) -> Result<Self> {
        Self::new(config, SchedulerParts::system(dry_run || config.dry_run))
    }

    pub fn new(config: &Config, parts: SchedulerParts) -> Result<Self> {
        config.validate().context("invalid scheduler configuration")?;

        let protection = ProtectionList::new(config.controller.extra_protected.iter().cloned());
        let controller = ProcessController::new(
            parts.backend,
            protection.clone(),
            config.controller_settings(),
        );
        let monitor = ProcessMonitor::new(parts.source, parts.detector, config.monitor_settings());

        let state = SchedulerState {
            mode: config.mode,
            algorithm_override: config.algorithm,
            params: config.params,
        };

        info!(
            mode = %state.mode,
            algorithm = %state.algorithm(),
            backend = controller.backend_name(),
            "Scheduler initialised"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                monitor: Arc::new(Mutex::new(monitor)),
                system: Arc::new(parts.system_metrics),
                engine: SchedulingEngine::new(protection),
                controller: Arc::new(controller),
                polling_interval: config.polling_interval(),
                band: config.nice_band(),
                pressure: MemoryPressurePolicy::default(),
                state: RwLock::new(state),
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
                decisions: RwLock::new(None),
                auto_suspended: Mutex::new(HashMap::new()),
                rotator: Mutex::new(RoundRobinRotator::new()),
                analyzer: Mutex::new(PerformanceAnalyzer::new()),
                stats: Mutex::new(CycleStats::new()),
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
            task: Mutex::new(None),
        })
    }

    /// Запустить периодический цикл (Stopped → Monitoring).
    ///
    /// Повторный вызов ничего не делает. Должен вызываться внутри runtime
    /// tokio. Возвращает `true`, если цикл был запущен этим вызовом.
    pub fn start_monitoring(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(monitoring_loop(inner, shutdown_rx));
        *task = Some(MonitorTask {
            shutdown_tx,
            handle,
        });
        info!(interval_ms = self.inner.polling_interval.as_millis() as u64, "Monitoring started");
        true
    }

    /// Остановить цикл (Monitoring → Stopped) и дождаться его завершения.
    ///
    /// Текущий цикл доводится до конца, затем всё, что планировщик
    /// приостановил сам, возобновляется. Повторный вызов ничего не делает.
    pub async fn stop_monitoring(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Monitoring task ended abnormally");
            }
            info!("Monitoring stopped");
        }
        self.release_auto_suspended().await;
    }

    /// Возобновить все процессы, приостановленные автоматически.
    ///
    /// Возвращает число реально возобновлённых процессов.
    pub async fn release_auto_suspended(&self) -> usize {
        self.inner.release_auto_suspended().await
    }

    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Выполнить один цикл вне периодического цикла (например, `--once`).
    pub async fn run_cycle(&self) -> Result<Arc<Snapshot>> {
        self.inner.run_cycle().await
    }

    /// Снапшот последнего завершённого цикла; никогда не ждёт текущий цикл.
    pub fn get_processes(&self) -> Arc<Snapshot> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Решения последнего цикла.
    pub fn last_decisions(&self) -> Option<Arc<DecisionSet>> {
        self.inner
            .decisions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> Mode {
        self.state().mode
    }

    pub fn algorithm(&self) -> Algorithm {
        self.state().algorithm()
    }

    pub fn params(&self) -> SchedulingParameters {
        self.state().params
    }

    /// Сменить режим; явно выбранный алгоритм сбрасывается на алгоритм режима.
    ///
    /// Процессы, приостановленные планировщиком в прежнем режиме, следующий
    /// цикл возобновит, если новый режим не считает их кандидатами.
    pub fn set_mode(&self, mode: Mode) {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        if state.mode != mode || state.algorithm_override.is_some() {
            info!(from = %state.mode, to = %mode, "Mode changed");
        }
        state.mode = mode;
        state.algorithm_override = None;
    }

    /// Выбрать алгоритм вместо алгоритма режима до следующей смены режима.
    pub fn set_algorithm(&self, algorithm: Algorithm) {
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        info!(algorithm = %algorithm, "Algorithm override set");
        state.algorithm_override = Some(algorithm);
    }

    /// Задать квант и порог памяти; при ошибке прежние параметры сохраняются.
    pub fn set_custom_params(&self, time_slice_ms: i64, memory_threshold_mb: f64) -> SchedResult<()> {
        let params = SchedulingParameters::new(time_slice_ms, memory_threshold_mb)?;
        let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
        state.params = params;
        info!(
            time_slice_ms = params.time_slice_ms,
            memory_threshold_mb = params.memory_threshold_mb,
            "Scheduling parameters updated"
        );
        Ok(())
    }

    /// Приостановить процесс по команде пользователя.
    pub async fn suspend(&self, pid: i32, override_protection: bool) -> SchedResult<CommandOutcome> {
        self.inner.controller.suspend(pid, override_protection).await
    }

    /// Возобновить процесс; планировщик больше не считает его своим.
    pub async fn resume(&self, pid: i32) -> SchedResult<CommandOutcome> {
        let outcome = self.inner.controller.resume(pid).await?;
        self.inner
            .auto_suspended
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
        Ok(outcome)
    }

    pub async fn terminate(&self, pid: i32, override_protection: bool) -> SchedResult<CommandOutcome> {
        self.inner.controller.terminate(pid, override_protection).await
    }

    pub fn controller(&self) -> Arc<ProcessController> {
        self.inner.controller.clone()
    }

    pub fn system_metrics(&self) -> &SystemMetrics {
        &self.inner.system
    }

    /// PID, приостановленные планировщиком автоматически.
    pub fn auto_suspended(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self
            .inner
            .auto_suspended
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.inner
            .analyzer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
    }

    pub fn process_distribution(&self) -> ProcessDistribution {
        self.inner
            .analyzer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .distribution()
    }

    pub fn reset_performance_stats(&self) {
        self.inner
            .analyzer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }

    pub fn cycle_stats(&self) -> CycleStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

async fn monitoring_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }

        // ошибки цикла уже учтены в статистике, цикл продолжается
        if let Err(e) = inner.run_cycle().await {
            warn!(error = %format!("{e:#}"), "Monitoring cycle failed");
        }

        {
            let stats = inner.stats.lock().unwrap_or_else(|e| e.into_inner());
            if stats.total_cycles % 10 == 0 {
                stats.log_stats();
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // отправитель исчез вместе с планировщиком
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(inner.polling_interval) => {}
        }
    }
    debug!("Monitoring loop exited");
}

/// Что было сделано за цикл.
#[derive(Debug, Default, Clone, Copy)]
struct CycleActions {
    applied: u64,
    errors: u64,
}

impl CycleActions {
    fn add(&mut self, result: ApplyResult) {
        self.applied += result.applied as u64;
        self.errors += result.errors as u64;
    }
}

impl Inner {
    async fn run_cycle(&self) -> Result<Arc<Snapshot>> {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();
        let state = *self.state.read().unwrap_or_else(|e| e.into_inner());

        let monitor = self.monitor.clone();
        let system = self.system.clone();
        let sampled = tokio::task::spawn_blocking(move || {
            let snapshot = monitor.lock().unwrap_or_else(|e| e.into_inner()).sample();
            (snapshot, system.cpu_usage_percent(), system.memory_info())
        })
        .await
        .context("sampling task panicked");

        let (snapshot, cpu, memory) = match sampled {
            Ok((Ok(snapshot), cpu, memory)) => (Arc::new(snapshot), cpu, memory),
            Ok((Err(e), _, _)) | Err(e) => {
                self.stats
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_error_cycle();
                return Err(e);
            }
        };

        self.controller.observe(&snapshot);
        let algorithm = state.algorithm();
        let decisions = Arc::new(self.engine.decide(&snapshot, state.mode, algorithm, &state.params));
        let pressure = match &memory {
            Ok(info) => Some(self.pressure.level(info)),
            Err(e) => {
                debug!(error = %e, "Memory metrics unavailable, memory pressure not evaluated");
                None
            }
        };

        let mut actions = CycleActions::default();
        self.apply_suspensions(&snapshot, &decisions, pressure, &mut actions)
            .await;
        if pressure == Some(PressureLevel::High) {
            self.relieve_memory_pressure(&snapshot, &decisions, &state.params, &mut actions)
                .await;
        }
        self.apply_priorities(&snapshot, &decisions, &state.params, &mut actions)
            .await;

        self.record_load(&snapshot, cpu, memory);

        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        *self.decisions.write().unwrap_or_else(|e| e.into_inner()) = Some(decisions);

        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_successful_cycle(started.elapsed().as_millis(), actions.applied, actions.errors);

        Ok(snapshot)
    }

    fn record_load(
        &self,
        snapshot: &Snapshot,
        cpu: SchedResult<f64>,
        memory: SchedResult<MemoryInfo>,
    ) {
        match (cpu, memory) {
            (Ok(cpu), Ok(memory)) => {
                let memory_percent = memory.mem_used_percent();
                self.analyzer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .collect_sample(snapshot, self.engine.protection(), memory_percent, cpu);
                debug!(
                    cycle = snapshot.sequence,
                    cpu_percent = cpu,
                    memory_percent = memory_percent,
                    swap_percent = memory.swap_used_percent(),
                    processes = snapshot.len(),
                    suspended = snapshot.suspended_count(),
                    "Cycle completed"
                );
            }
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "System metrics unavailable, skipping sample")
            }
        }
    }

    /// Приостановить кандидатов и вернуть «свои» процессы, переставшие ими быть.
    ///
    /// Процессы, приостановленные из-за нехватки памяти, возвращаются только
    /// когда давление спало.
    async fn apply_suspensions(
        &self,
        snapshot: &Snapshot,
        decisions: &DecisionSet,
        pressure: Option<PressureLevel>,
        actions: &mut CycleActions,
    ) {
        let candidates: HashSet<i32> = decisions.suspension_candidates().collect();

        let owned: Vec<(i32, SuspendCause)> = {
            let mut auto = self.auto_suspended.lock().unwrap_or_else(|e| e.into_inner());
            // исчезнувшие процессы забываются
            auto.retain(|pid, _| snapshot.get(*pid).is_some());
            // кандидат режима держится правилом режима, а не давлением
            for (pid, cause) in auto.iter_mut() {
                if candidates.contains(pid) {
                    *cause = SuspendCause::Mode;
                }
            }
            auto.iter().map(|(pid, cause)| (*pid, *cause)).collect()
        };

        let mut result = ApplyResult::default();

        for (pid, cause) in owned {
            let release = match cause {
                SuspendCause::Mode => !candidates.contains(&pid),
                SuspendCause::MemoryPressure => pressure == Some(PressureLevel::Relieved),
            };
            if !release {
                continue;
            }
            match self.controller.resume(pid).await {
                Ok(outcome) => {
                    if outcome == CommandOutcome::Applied {
                        info!(pid = pid, cause = ?cause, "Resumed automatically suspended process");
                        result.applied += 1;
                    }
                    self.forget_auto(pid);
                }
                Err(SchedError::NoSuchProcess { .. }) => self.forget_auto(pid),
                Err(_) => result.errors += 1,
            }
        }

        for decision in decisions.decisions.iter().filter(|d| d.should_suspend) {
            let Some(record) = snapshot.get(decision.pid) else {
                continue;
            };
            // остановлен не нами или уже нами
            if record.is_suspended() {
                continue;
            }
            match self.controller.suspend(decision.pid, false).await {
                Ok(CommandOutcome::Applied) => {
                    info!(
                        pid = decision.pid,
                        name = %record.name,
                        reason = decision.reason.as_deref().unwrap_or(""),
                        "Suspended process"
                    );
                    self.own(decision.pid, SuspendCause::Mode);
                    result.applied += 1;
                }
                Ok(CommandOutcome::NoOp) => result.skipped += 1,
                Err(SchedError::NoSuchProcess { .. }) => result.skipped += 1,
                Err(_) => result.errors += 1,
            }
        }

        actions.add(result);
    }

    /// Приостановить несколько самых тяжёлых фоновых процессов.
    async fn relieve_memory_pressure(
        &self,
        snapshot: &Snapshot,
        decisions: &DecisionSet,
        params: &SchedulingParameters,
        actions: &mut CycleActions,
    ) {
        let mut result = ApplyResult::default();
        let pids = self
            .pressure
            .candidates(snapshot, params, self.engine.protection());

        for pid in pids {
            // кандидатов режима уже обработали выше
            if decisions.get(pid).is_some_and(|d| d.should_suspend) {
                continue;
            }
            match self.controller.suspend(pid, false).await {
                Ok(CommandOutcome::Applied) => {
                    info!(pid = pid, "Suspended process under memory pressure");
                    self.own(pid, SuspendCause::MemoryPressure);
                    result.applied += 1;
                }
                Ok(CommandOutcome::NoOp) | Err(SchedError::NoSuchProcess { .. }) => {
                    result.skipped += 1
                }
                Err(_) => result.errors += 1,
            }
        }

        actions.add(result);
    }

    async fn apply_priorities(
        &self,
        snapshot: &Snapshot,
        decisions: &DecisionSet,
        params: &SchedulingParameters,
        actions: &mut CycleActions,
    ) {
        let protection = self.engine.protection();
        let adjustments = match decisions.algorithm {
            Algorithm::RoundRobin => self
                .rotator
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .plan(snapshot, decisions, self.polling_interval, params, protection),
            _ => plan_priority_changes(snapshot, decisions, self.band, protection),
        };
        if adjustments.is_empty() {
            return;
        }

        let result = self.controller.apply_adjustments(&adjustments).await;
        debug!(
            planned = adjustments.len(),
            applied = result.applied,
            skipped = result.skipped,
            errors = result.errors,
            "Applied priority adjustments"
        );
        actions.add(result);
    }

    async fn release_auto_suspended(&self) -> usize {
        let _cycle = self.cycle_lock.lock().await;
        let owned: Vec<i32> = self
            .auto_suspended
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(pid, _)| pid)
            .collect();

        let mut resumed = 0;
        for pid in owned {
            match self.controller.resume(pid).await {
                Ok(CommandOutcome::Applied) => resumed += 1,
                Ok(CommandOutcome::NoOp) | Err(SchedError::NoSuchProcess { .. }) => {}
                Err(e) => warn!(pid = pid, error = %e, "Failed to resume process on shutdown"),
            }
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed automatically suspended processes");
        }
        resumed
    }

    fn own(&self, pid: i32, cause: SuspendCause) {
        self.auto_suspended
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, cause);
    }

    fn forget_auto(&self, pid: i32) {
        self.auto_suspended
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }
}
