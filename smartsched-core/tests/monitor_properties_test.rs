//! Свойства снапшотов монитора и порядка решений движка.

use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use smartsched_core::metrics::foreground::StaticForegroundDetector;
use smartsched_core::metrics::process::{RawProcess, StaticProcessSource};
use smartsched_core::monitor::{MonitorSettings, ProcessMonitor};
use smartsched_core::policy::classes::{Algorithm, Mode};
use smartsched_core::policy::engine::SchedulingEngine;
use smartsched_core::policy::params::SchedulingParameters;
use smartsched_core::policy::protection::ProtectionList;

fn create_test_monitor(source: Arc<StaticProcessSource>) -> ProcessMonitor {
    ProcessMonitor::new(
        source,
        Box::new(StaticForegroundDetector::new([])),
        MonitorSettings::default(),
    )
}

fn proc_with_ticks(pid: i32, ticks: u64, stopped: bool) -> RawProcess {
    let mut p = RawProcess::new(pid, &format!("proc{pid}"));
    p.cpu_ticks = ticks;
    p.stopped = stopped;
    p
}

proptest! {
    #[test]
    fn snapshots_never_report_negative_values(
        samples in prop::collection::vec(
            prop::collection::vec((100i32..120, 0u64..10_000, any::<bool>()), 0..12),
            1..6,
        ),
        step_ms in 0u64..2000,
    ) {
        let source = Arc::new(StaticProcessSource::new(Vec::new()));
        let mut monitor = create_test_monitor(source.clone());
        let start = Instant::now();

        for (i, sample) in samples.iter().enumerate() {
            let mut processes: Vec<RawProcess> = sample
                .iter()
                .map(|&(pid, ticks, stopped)| proc_with_ticks(pid, ticks, stopped))
                .collect();
            processes.sort_by_key(|p| p.pid);
            processes.dedup_by_key(|p| p.pid);
            source.set(processes);

            let now = start + Duration::from_millis(step_ms * i as u64);
            let snapshot = monitor.sample_at(now).unwrap();

            prop_assert_eq!(snapshot.sequence, i as u64 + 1);
            for window in snapshot.processes.windows(2) {
                prop_assert!(window[0].pid < window[1].pid);
            }
            for record in &snapshot.processes {
                prop_assert!(record.cpu_usage_percent.is_finite());
                prop_assert!(record.cpu_usage_percent >= 0.0);
            }
        }
    }
}

#[test]
fn stopped_process_cpu_does_not_grow() {
    let source = Arc::new(StaticProcessSource::new(vec![proc_with_ticks(200, 0, false)]));
    let mut monitor = create_test_monitor(source.clone());
    let start = Instant::now();

    monitor.sample_at(start).unwrap();
    source.update(200, |p| p.cpu_ticks = 50);
    let running = monitor.sample_at(start + Duration::from_secs(1)).unwrap();
    let busy = running.get(200).unwrap().cpu_usage_percent;
    assert!(busy > 0.0);

    // тики продолжают расти, но процесс уже остановлен
    source.update(200, |p| {
        p.cpu_ticks = 200;
        p.stopped = true;
    });
    let stopped = monitor.sample_at(start + Duration::from_secs(2)).unwrap();
    assert!(stopped.get(200).unwrap().cpu_usage_percent <= busy);
    assert!(stopped.get(200).unwrap().is_suspended());
}

#[test]
fn fcfs_follows_observation_order() {
    let source = Arc::new(StaticProcessSource::new(vec![proc_with_ticks(300, 0, false)]));
    let mut monitor = create_test_monitor(source.clone());
    let start = Instant::now();

    monitor.sample_at(start).unwrap();
    source.set(vec![proc_with_ticks(300, 0, false), proc_with_ticks(50, 0, false)]);
    monitor.sample_at(start + Duration::from_secs(1)).unwrap();
    source.set(vec![
        proc_with_ticks(300, 0, false),
        proc_with_ticks(50, 0, false),
        proc_with_ticks(10, 0, false),
    ]);
    let snapshot = monitor.sample_at(start + Duration::from_secs(2)).unwrap();

    let engine = SchedulingEngine::new(ProtectionList::default());
    let decisions = engine.decide(
        &snapshot,
        Mode::Productivity,
        Algorithm::Fcfs,
        &SchedulingParameters::default(),
    );
    let order: Vec<i32> = decisions.decisions.iter().map(|d| d.pid).collect();
    assert_eq!(order, vec![300, 50, 10]);
    assert!(decisions.score(300) > decisions.score(50));
    assert!(decisions.score(50) > decisions.score(10));
}

#[test]
fn sjf_prefers_less_cpu_time() {
    let source = Arc::new(StaticProcessSource::new(vec![
        proc_with_ticks(400, 900, false),
        proc_with_ticks(401, 10, false),
        proc_with_ticks(402, 300, false),
    ]));
    let mut monitor = create_test_monitor(source);
    let snapshot = monitor.sample_at(Instant::now()).unwrap();

    let engine = SchedulingEngine::new(ProtectionList::default());
    let decisions = engine.decide(
        &snapshot,
        Mode::Productivity,
        Algorithm::Sjf,
        &SchedulingParameters::default(),
    );
    let order: Vec<i32> = decisions.decisions.iter().map(|d| d.pid).collect();
    assert_eq!(order, vec![401, 402, 400]);
}
