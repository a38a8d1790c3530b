//! Скользящая статистика нагрузки системы.
//!
//! Планировщик раз в цикл передаёт сюда загрузку CPU и памяти вместе со
//! снапшотом; анализатор хранит последние [`SAMPLE_CAPACITY`] замеров и
//! распределение процессов последнего цикла.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::monitor::Snapshot;
use crate::policy::classes::Classification;
use crate::policy::protection::ProtectionList;

/// Сколько последних замеров хранится.
pub const SAMPLE_CAPACITY: usize = 100;

/// Сводка по окну замеров.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub avg_cpu: f64,
    pub max_cpu: f64,
    pub avg_memory: f64,
    pub max_memory: f64,
    pub total_processes: usize,
    pub suspended_processes: usize,
}

/// Распределение процессов последнего цикла.
///
/// `system`, `foreground` и `background` не пересекаются; `suspended`
/// считается поверх них.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDistribution {
    pub foreground: usize,
    pub background: usize,
    pub system: usize,
    pub suspended: usize,
}

impl ProcessDistribution {
    pub fn total(&self) -> usize {
        self.foreground + self.background + self.system
    }
}

#[derive(Debug, Default)]
pub struct PerformanceAnalyzer {
    cpu: VecDeque<f64>,
    memory: VecDeque<f64>,
    distribution: ProcessDistribution,
}

impl PerformanceAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавить замер системной загрузки и пересчитать распределение.
    pub fn collect_sample(
        &mut self,
        snapshot: &Snapshot,
        protection: &ProtectionList,
        memory_percent: f64,
        cpu_percent: f64,
    ) {
        push_bounded(&mut self.cpu, cpu_percent);
        push_bounded(&mut self.memory, memory_percent);

        let mut dist = ProcessDistribution::default();
        for record in &snapshot.processes {
            if protection.is_os_critical(record) {
                dist.system += 1;
            } else if record.classification == Classification::Foreground {
                dist.foreground += 1;
            } else {
                dist.background += 1;
            }
            if record.is_suspended() {
                dist.suspended += 1;
            }
        }
        self.distribution = dist;
    }

    pub fn stats(&self) -> PerformanceStats {
        let (avg_cpu, max_cpu) = avg_max(&self.cpu);
        let (avg_memory, max_memory) = avg_max(&self.memory);
        PerformanceStats {
            avg_cpu,
            max_cpu,
            avg_memory,
            max_memory,
            total_processes: self.distribution.total(),
            suspended_processes: self.distribution.suspended,
        }
    }

    pub fn distribution(&self) -> ProcessDistribution {
        self.distribution
    }

    pub fn sample_count(&self) -> usize {
        self.cpu.len()
    }

    pub fn reset(&mut self) {
        self.cpu.clear();
        self.memory.clear();
        self.distribution = ProcessDistribution::default();
    }
}

fn push_bounded(samples: &mut VecDeque<f64>, value: f64) {
    if samples.len() == SAMPLE_CAPACITY {
        samples.pop_front();
    }
    samples.push_back(value);
}

fn avg_max(samples: &VecDeque<f64>) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let sum: f64 = samples.iter().sum();
    let max = samples.iter().copied().fold(f64::MIN, f64::max);
    (sum / samples.len() as f64, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ProcessRecord, ProcessStatus};
    use chrono::Utc;

    fn record(pid: i32, name: &str, class: Classification, suspended: bool) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid: 1,
            name: name.to_string(),
            priority: 0,
            status: if suspended {
                ProcessStatus::Suspended
            } else {
                ProcessStatus::Running
            },
            memory_usage_bytes: 0,
            cpu_usage_percent: 0.0,
            cpu_time_ticks: 0,
            first_seen: 0,
            classification: class,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            sequence: 1,
            taken_at: Utc::now(),
            processes: vec![
                record(1, "systemd", Classification::IoBound, false),
                record(500, "sshd", Classification::IoBound, false),
                record(1000, "game", Classification::Foreground, false),
                record(1001, "indexer", Classification::CpuBound, true),
                record(1002, "mail", Classification::IoBound, false),
            ],
        }
    }

    #[test]
    fn empty_analyzer_reports_zeros() {
        let analyzer = PerformanceAnalyzer::new();
        assert_eq!(analyzer.stats(), PerformanceStats::default());
        assert_eq!(analyzer.distribution(), ProcessDistribution::default());
    }

    #[test]
    fn distribution_splits_system_foreground_background() {
        let mut analyzer = PerformanceAnalyzer::new();
        analyzer.collect_sample(&snapshot(), &ProtectionList::default(), 40.0, 10.0);

        let dist = analyzer.distribution();
        assert_eq!(dist.system, 2);
        assert_eq!(dist.foreground, 1);
        assert_eq!(dist.background, 2);
        assert_eq!(dist.suspended, 1);

        let stats = analyzer.stats();
        assert_eq!(stats.total_processes, 5);
        assert_eq!(stats.suspended_processes, 1);
    }

    #[test]
    fn averages_and_maxima() {
        let mut analyzer = PerformanceAnalyzer::new();
        let protection = ProtectionList::default();
        analyzer.collect_sample(&Snapshot::default(), &protection, 30.0, 10.0);
        analyzer.collect_sample(&Snapshot::default(), &protection, 50.0, 30.0);

        let stats = analyzer.stats();
        assert_eq!(stats.avg_cpu, 20.0);
        assert_eq!(stats.max_cpu, 30.0);
        assert_eq!(stats.avg_memory, 40.0);
        assert_eq!(stats.max_memory, 50.0);
    }

    #[test]
    fn window_keeps_last_hundred_samples() {
        let mut analyzer = PerformanceAnalyzer::new();
        let protection = ProtectionList::default();
        for i in 0..150 {
            analyzer.collect_sample(&Snapshot::default(), &protection, 0.0, i as f64);
        }
        assert_eq!(analyzer.sample_count(), SAMPLE_CAPACITY);
        let stats = analyzer.stats();
        assert_eq!(stats.max_cpu, 149.0);
        // окно 50..=149
        assert_eq!(stats.avg_cpu, 99.5);
    }

    #[test]
    fn reset_clears_everything() {
        let mut analyzer = PerformanceAnalyzer::new();
        analyzer.collect_sample(&snapshot(), &ProtectionList::default(), 40.0, 10.0);
        analyzer.reset();
        assert_eq!(analyzer.sample_count(), 0);
        assert_eq!(analyzer.stats(), PerformanceStats::default());
    }
}
