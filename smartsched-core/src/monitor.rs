//! Монитор процессов: периодические снапшоты с оценкой CPU и классификацией.
//!
//! [`ProcessMonitor::sample`] превращает сырое перечисление из
//! [`ProcessSource`] и историю предыдущих замеров в согласованный
//! [`Snapshot`]. Монитор никогда не меняет состояние процессов ОС.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::foreground::ForegroundDetector;
use crate::metrics::process::{ProcessSource, RawProcess};
use crate::policy::classes::Classification;

/// Состояние выполнения процесса, как его видит ОС.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Running,
    Suspended,
}

/// Один отслеживаемый процесс в снапшоте.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub ppid: i32,
    pub name: String,
    /// Текущий nice процесса.
    pub priority: i32,
    pub status: ProcessStatus,
    pub memory_usage_bytes: u64,
    /// Сглаженная загрузка CPU в процентах одного ядра.
    pub cpu_usage_percent: f64,
    /// Накопленное CPU-время в тиках (для SJF).
    pub cpu_time_ticks: u64,
    /// Порядковый номер первого наблюдения (для FCFS).
    pub first_seen: u64,
    pub classification: Classification,
}

impl ProcessRecord {
    pub fn is_suspended(&self) -> bool {
        self.status == ProcessStatus::Suspended
    }
}

/// Неизменяемый снимок всех процессов за один цикл мониторинга.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Номер цикла, 0 — пустой снапшот до первого цикла.
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    /// Процессы, упорядоченные по PID.
    pub processes: Vec<ProcessRecord>,
}

impl Snapshot {
    pub fn get(&self, pid: i32) -> Option<&ProcessRecord> {
        self.processes
            .binary_search_by_key(&pid, |p| p.pid)
            .ok()
            .map(|i| &self.processes[i])
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn suspended_count(&self) -> usize {
        self.processes.iter().filter(|p| p.is_suspended()).count()
    }

    pub fn pids(&self) -> impl Iterator<Item = i32> + '_ {
        self.processes.iter().map(|p| p.pid)
    }
}

/// Настройки оценки CPU и классификации.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    /// Ниже этого сглаженного CPU% процесс считается IOBound.
    pub io_bound_cpu_percent: f64,
    /// Вес нового замера в EWMA (1.0 — без сглаживания).
    pub cpu_smoothing: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            io_bound_cpu_percent: 5.0,
            cpu_smoothing: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct History {
    ticks: u64,
    at: Instant,
    start_time: u64,
    smoothed: f64,
    first_seen: u64,
}

/// Монитор процессов.
pub struct ProcessMonitor {
    source: Arc<dyn ProcessSource>,
    detector: Box<dyn ForegroundDetector>,
    settings: MonitorSettings,
    history: HashMap<i32, History>,
    // порядковые номера, выданные новым процессам текущего скана
    pending: HashMap<i32, u64>,
    next_order: u64,
    sequence: u64,
    max_cpu_percent: f64,
}

impl ProcessMonitor {
    pub fn new(
        source: Arc<dyn ProcessSource>,
        detector: Box<dyn ForegroundDetector>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            source,
            detector,
            settings,
            history: HashMap::new(),
            pending: HashMap::new(),
            next_order: 0,
            sequence: 0,
            max_cpu_percent: 100.0 * num_cpus::get().max(1) as f64,
        }
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings
    }

    /// Снять новый снапшот.
    ///
    /// Ошибка возвращается только если не удалось перечислить процессы вообще;
    /// процессы, исчезнувшие во время сканирования, просто не попадают в снапшот.
    pub fn sample(&mut self) -> Result<Snapshot> {
        self.sample_at(Instant::now())
    }

    /// То же, что [`Self::sample`], но с явным моментом замера.
    pub fn sample_at(&mut self, now: Instant) -> Result<Snapshot> {
        let mut raw = self
            .source
            .enumerate()
            .context("process enumeration failed")?;
        raw.sort_by_key(|p| p.pid);

        let foreground = match self.detector.foreground_pids(&raw) {
            Ok(pids) => pids,
            Err(e) => {
                debug!(detector = self.detector.name(), error = %e, "Foreground detection failed");
                HashSet::new()
            }
        };

        self.assign_first_seen(&raw);

        let tps = self.source.ticks_per_second().max(1) as f64;
        let mut processes = Vec::with_capacity(raw.len());
        let mut next_history = HashMap::with_capacity(raw.len());

        for proc in &raw {
            let prev = self
                .history
                .get(&proc.pid)
                .filter(|h| h.start_time == proc.start_time);
            let first_seen = match prev {
                Some(h) => h.first_seen,
                None => self.pending_order(proc.pid),
            };

            let (smoothed, classification) = match prev {
                None => (
                    0.0,
                    if foreground.contains(&proc.pid) {
                        Classification::Foreground
                    } else {
                        Classification::Background
                    },
                ),
                Some(h) => {
                    let smoothed = self.smooth(h, proc, now, tps);
                    (smoothed, self.classify(proc.pid, smoothed, &foreground))
                }
            };

            next_history.insert(
                proc.pid,
                History {
                    ticks: proc.cpu_ticks,
                    at: now,
                    start_time: proc.start_time,
                    smoothed,
                    first_seen,
                },
            );

            processes.push(ProcessRecord {
                pid: proc.pid,
                ppid: proc.ppid,
                name: proc.name.clone(),
                priority: proc.nice,
                status: if proc.stopped {
                    ProcessStatus::Suspended
                } else {
                    ProcessStatus::Running
                },
                memory_usage_bytes: proc.rss_bytes,
                cpu_usage_percent: smoothed,
                cpu_time_ticks: proc.cpu_ticks,
                first_seen,
                classification,
            });
        }

        // исчезнувшие процессы забываются
        self.history = next_history;
        self.pending.clear();
        self.sequence += 1;

        Ok(Snapshot {
            sequence: self.sequence,
            taken_at: Utc::now(),
            processes,
        })
    }

    fn smooth(&self, prev: &History, proc: &RawProcess, now: Instant, tps: f64) -> f64 {
        let wall = now.saturating_duration_since(prev.at).as_secs_f64();
        if wall <= 0.0 {
            return prev.smoothed;
        }
        let delta_ticks = proc.cpu_ticks.saturating_sub(prev.ticks) as f64;
        let raw = (delta_ticks / tps / wall * 100.0).clamp(0.0, self.max_cpu_percent);
        let alpha = self.settings.cpu_smoothing;
        let smoothed = (alpha * raw + (1.0 - alpha) * prev.smoothed).max(0.0);
        if proc.stopped {
            smoothed.min(prev.smoothed)
        } else {
            smoothed
        }
    }

    fn classify(&self, pid: i32, smoothed: f64, foreground: &HashSet<i32>) -> Classification {
        if foreground.contains(&pid) {
            Classification::Foreground
        } else if smoothed < self.settings.io_bound_cpu_percent {
            Classification::IoBound
        } else {
            Classification::CpuBound
        }
    }

    /// Новые процессы одного скана получают номера по времени старта, затем по PID.
    fn assign_first_seen(&mut self, raw: &[RawProcess]) {
        let mut fresh: Vec<&RawProcess> = raw
            .iter()
            .filter(|p| {
                !matches!(self.history.get(&p.pid), Some(h) if h.start_time == p.start_time)
            })
            .collect();
        fresh.sort_by_key(|p| (p.start_time, p.pid));
        for p in fresh {
            self.pending.insert(p.pid, self.next_order);
            self.next_order += 1;
        }
    }

    fn pending_order(&self, pid: i32) -> u64 {
        self.pending.get(&pid).copied().unwrap_or(self.next_order)
    }
}
