//! Интеграционные тесты координатора планировщика.
//!
//! Все процессы живут в памяти (`StaticProcessSource` + `SimulatedBackend`),
//! поэтому тесты не требуют root и не трогают настоящие процессы:
//! - смена режимов и автоматическая приостановка
//! - отказ для защищённых процессов
//! - идемпотентность команд и сериализация по PID
//! - проверка границ параметров и «свежесть» снапшота
//! - жизненный цикл мониторинга

use std::sync::Arc;
use std::time::Duration;

use smartsched_core::config::Config;
use smartsched_core::controller::backend::SimulatedBackend;
use smartsched_core::controller::CommandOutcome;
use smartsched_core::metrics::foreground::StaticForegroundDetector;
use smartsched_core::metrics::process::{RawProcess, StaticProcessSource};
use smartsched_core::metrics::system::{ProcPaths, SystemMetrics};
use smartsched_core::monitor::ProcessStatus;
use smartsched_core::policy::classes::{Algorithm, Mode};
use smartsched_core::scheduler::{Scheduler, SchedulerParts};
use smartsched_core::SchedError;

const MB: u64 = 1024 * 1024;

fn create_test_process(pid: i32, name: &str, rss_mb: u64) -> RawProcess {
    let mut p = RawProcess::new(pid, name);
    p.rss_bytes = rss_mb * MB;
    p
}

struct Harness {
    source: Arc<StaticProcessSource>,
    backend: Arc<SimulatedBackend>,
    detector: Arc<StaticForegroundDetector>,
    scheduler: Scheduler,
}

/// Обёртка, чтобы тест мог менять передний план после создания планировщика.
struct SharedDetector(Arc<StaticForegroundDetector>);

impl smartsched_core::metrics::foreground::ForegroundDetector for SharedDetector {
    fn name(&self) -> &'static str {
        "shared-static"
    }

    fn foreground_pids(
        &self,
        processes: &[RawProcess],
    ) -> anyhow::Result<std::collections::HashSet<i32>> {
        self.0.foreground_pids(processes)
    }
}

fn create_test_harness(processes: Vec<RawProcess>, config: Config) -> Harness {
    let source = Arc::new(StaticProcessSource::new(processes));
    let backend = Arc::new(SimulatedBackend::new(source.clone()));
    let detector = Arc::new(StaticForegroundDetector::new([]));
    let parts = SchedulerParts {
        source: source.clone(),
        detector: Box::new(SharedDetector(detector.clone())),
        backend: backend.clone(),
        system_metrics: SystemMetrics::with_paths(ProcPaths::new("/nonexistent-proc")),
    };
    let scheduler = Scheduler::new(&config, parts).expect("scheduler");
    Harness {
        source,
        backend,
        detector,
        scheduler,
    }
}

fn fast_config() -> Config {
    Config {
        polling_interval_ms: 50,
        ..Config::default()
    }
}

#[tokio::test]
async fn mode_switch_productivity_power_saving_and_back() {
    let h = create_test_harness(
        vec![
            create_test_process(2000, "bigapp", 300),
            create_test_process(2001, "shell", 10),
        ],
        fast_config(),
    );
    let scheduler = &h.scheduler;

    // Productivity: только приоритеты
    scheduler.run_cycle().await.unwrap();
    let decisions = scheduler.last_decisions().unwrap();
    assert_eq!(decisions.suspension_candidates().count(), 0);
    assert!(!h.source.get(2000).unwrap().stopped);

    scheduler.set_custom_params(5, 200.0).unwrap();
    scheduler.set_mode(Mode::PowerSaving);
    scheduler.run_cycle().await.unwrap();

    let decisions = scheduler.last_decisions().unwrap();
    let candidates: Vec<i32> = decisions.suspension_candidates().collect();
    assert_eq!(candidates, vec![2000]);
    assert!(h.source.get(2000).unwrap().stopped);
    assert!(!h.source.get(2001).unwrap().stopped);

    // следующий снапшот видит результат
    scheduler.run_cycle().await.unwrap();
    assert_eq!(
        scheduler.get_processes().get(2000).unwrap().status,
        ProcessStatus::Suspended
    );

    scheduler.set_mode(Mode::Productivity);
    scheduler.run_cycle().await.unwrap();
    assert!(!h.source.get(2000).unwrap().stopped);

    scheduler.run_cycle().await.unwrap();
    assert!(!h.source.get(2000).unwrap().stopped, "must not re-suspend");
    assert!(scheduler.resume(2000).await.is_ok());
}

#[tokio::test]
async fn gaming_keeps_foreground_running() {
    let h = create_test_harness(
        vec![
            create_test_process(3000, "game", 2000),
            create_test_process(3001, "browser", 500),
            create_test_process(3002, "sshd", 5),
        ],
        fast_config(),
    );
    h.detector.set([3000]);
    h.scheduler.set_mode(Mode::Gaming);
    h.scheduler.run_cycle().await.unwrap();

    assert!(!h.source.get(3000).unwrap().stopped);
    assert!(h.source.get(3001).unwrap().stopped);
    assert!(!h.source.get(3002).unwrap().stopped, "protected names are never auto-suspended");

    // смена переднего плана: игра уходит в фон, браузер возвращается
    h.detector.set([3001]);
    h.scheduler.run_cycle().await.unwrap();
    assert!(h.source.get(3000).unwrap().stopped);
    assert!(!h.source.get(3001).unwrap().stopped);
}

#[tokio::test]
async fn terminate_protected_without_override_is_refused() {
    let h = create_test_harness(vec![create_test_process(4000, "systemd", 50)], fast_config());
    h.scheduler.run_cycle().await.unwrap();

    let err = h.scheduler.terminate(4000, false).await.unwrap_err();
    assert!(matches!(err, SchedError::ProtectedProcess { pid: 4000, .. }));
    assert!(h.source.get(4000).is_some(), "process must keep running");
    assert!(h.scheduler.controller().is_protected("systemd"));

    assert_eq!(
        h.scheduler.terminate(4000, true).await.unwrap(),
        CommandOutcome::Applied
    );
    assert!(h.source.get(4000).is_none());
}

#[tokio::test]
async fn suspend_twice_is_idempotent() {
    let h = create_test_harness(vec![create_test_process(5000, "editor", 50)], fast_config());

    assert_eq!(h.scheduler.suspend(5000, false).await.unwrap(), CommandOutcome::Applied);
    assert_eq!(h.scheduler.suspend(5000, false).await.unwrap(), CommandOutcome::NoOp);

    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(
        h.scheduler.get_processes().get(5000).unwrap().status,
        ProcessStatus::Suspended
    );
}

#[tokio::test]
async fn user_suspension_survives_productivity_cycles() {
    let h = create_test_harness(vec![create_test_process(5100, "editor", 50)], fast_config());
    h.scheduler.suspend(5100, false).await.unwrap();
    h.scheduler.run_cycle().await.unwrap();
    h.scheduler.run_cycle().await.unwrap();
    assert!(h.source.get(5100).unwrap().stopped);
}

#[tokio::test]
async fn per_pid_commands_are_serialized() {
    let h = create_test_harness(vec![create_test_process(6000, "worker", 50)], fast_config());
    let controller = h.scheduler.controller();

    let mut tasks = Vec::new();
    for i in 0..40 {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                (true, controller.suspend(6000, false).await)
            } else {
                (false, controller.resume(6000).await)
            }
        }));
    }

    let mut suspends = 0i32;
    let mut resumes = 0i32;
    for task in tasks {
        let (is_suspend, result) = task.await.unwrap();
        if result.unwrap() == CommandOutcome::Applied {
            if is_suspend {
                suspends += 1;
            } else {
                resumes += 1;
            }
        }
    }

    let diff = suspends - resumes;
    assert!(diff == 0 || diff == 1, "suspends={suspends} resumes={resumes}");
    assert_eq!(h.source.get(6000).unwrap().stopped, diff == 1);
    assert_eq!(h.backend.signals().len() as i32, suspends + resumes);
}

#[tokio::test]
async fn permission_denied_does_not_stop_the_cycle() {
    let h = create_test_harness(
        vec![
            create_test_process(7000, "root-owned", 50),
            create_test_process(7001, "mine", 50),
        ],
        fast_config(),
    );
    h.backend.deny(7000);
    h.scheduler.set_mode(Mode::Gaming);

    h.scheduler.run_cycle().await.unwrap();
    assert!(!h.source.get(7000).unwrap().stopped);
    assert!(h.source.get(7001).unwrap().stopped);

    let stats = h.scheduler.cycle_stats();
    assert_eq!(stats.successful_cycles, 1);
    assert!(stats.command_errors >= 1);
}

#[tokio::test]
async fn invalid_params_are_rejected_without_state_change() {
    let h = create_test_harness(vec![], fast_config());
    h.scheduler.set_custom_params(250, 800.0).unwrap();
    let before = h.scheduler.params();

    assert!(matches!(
        h.scheduler.set_custom_params(0, 800.0),
        Err(SchedError::InvalidParameter(_))
    ));
    assert!(matches!(
        h.scheduler.set_custom_params(250, 20.0),
        Err(SchedError::InvalidParameter(_))
    ));
    assert!(matches!(
        h.scheduler.set_custom_params(1001, 800.0),
        Err(SchedError::InvalidParameter(_))
    ));
    assert!(matches!(
        h.scheduler.set_custom_params(250, f64::NAN),
        Err(SchedError::InvalidParameter(_))
    ));
    assert_eq!(h.scheduler.params(), before);
}

#[tokio::test]
async fn get_processes_is_stable_between_cycles() {
    let h = create_test_harness(vec![create_test_process(8000, "editor", 50)], fast_config());
    h.scheduler.run_cycle().await.unwrap();

    let first = h.scheduler.get_processes();
    h.source.set(vec![create_test_process(8001, "other", 50)]);
    let second = h.scheduler.get_processes();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*first, *second);

    h.scheduler.run_cycle().await.unwrap();
    let third = h.scheduler.get_processes();
    assert!(third.get(8001).is_some());
    assert!(third.get(8000).is_none());
    assert!(third.sequence > first.sequence);
}

#[tokio::test]
async fn explicit_algorithm_is_used_until_mode_changes() {
    let h = create_test_harness(vec![create_test_process(9000, "editor", 50)], fast_config());
    h.scheduler.set_algorithm(Algorithm::Fcfs);
    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(h.scheduler.last_decisions().unwrap().algorithm, Algorithm::Fcfs);

    h.scheduler.set_mode(Mode::PowerSaving);
    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(h.scheduler.last_decisions().unwrap().algorithm, Algorithm::Hybrid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitoring_lifecycle() {
    let h = create_test_harness(vec![create_test_process(9100, "editor", 50)], fast_config());

    assert!(!h.scheduler.is_monitoring());
    assert!(h.scheduler.start_monitoring());
    assert!(!h.scheduler.start_monitoring(), "second start is a no-op");

    // читатели не блокируются циклом
    let mut seen = false;
    for _ in 0..40 {
        if !h.scheduler.get_processes().is_empty() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(seen, "monitoring loop must publish a snapshot");

    h.scheduler.stop_monitoring().await;
    h.scheduler.stop_monitoring().await;
    assert!(!h.scheduler.is_monitoring());

    let cycles = h.scheduler.cycle_stats().total_cycles;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.scheduler.cycle_stats().total_cycles, cycles);

    // после остановки можно запустить снова
    assert!(h.scheduler.start_monitoring());
    h.scheduler.stop_monitoring().await;
}
