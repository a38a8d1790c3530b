//! Реакция на нехватку памяти.
//!
//! Независимо от режима: при высокой загрузке памяти или swap приостанавливаются
//! несколько самых «тяжёлых» фоновых процессов сверх порога памяти; когда
//! давление спадает, они возобновляются.

use crate::metrics::system::MemoryInfo;
use crate::monitor::{ProcessRecord, Snapshot};
use crate::policy::classes::Classification;
use crate::policy::params::SchedulingParameters;
use crate::policy::protection::ProtectionList;

/// Уровень давления на память.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    /// Память или swap выше верхних порогов: пора приостанавливать.
    High,
    /// Между порогами: ничего не меняется.
    Elevated,
    /// Память и swap ниже нижних порогов: приостановленное можно вернуть.
    Relieved,
}

/// Пороги в процентах и лимит приостановок за цикл.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPressurePolicy {
    pub suspend_memory_percent: f64,
    pub suspend_swap_percent: f64,
    pub resume_memory_percent: f64,
    pub resume_swap_percent: f64,
    pub max_suspensions_per_cycle: usize,
}

impl Default for MemoryPressurePolicy {
    fn default() -> Self {
        Self {
            suspend_memory_percent: 90.0,
            suspend_swap_percent: 70.0,
            resume_memory_percent: 70.0,
            resume_swap_percent: 50.0,
            max_suspensions_per_cycle: 3,
        }
    }
}

impl MemoryPressurePolicy {
    pub fn level(&self, memory: &MemoryInfo) -> PressureLevel {
        let mem = memory.mem_used_percent();
        let swap = memory.swap_used_percent();
        if mem > self.suspend_memory_percent || swap > self.suspend_swap_percent {
            PressureLevel::High
        } else if mem < self.resume_memory_percent && swap < self.resume_swap_percent {
            PressureLevel::Relieved
        } else {
            PressureLevel::Elevated
        }
    }

    /// Кого приостановить при высоком давлении: не более
    /// `max_suspensions_per_cycle` работающих, не критичных и не активных
    /// процессов сверх порога памяти, от самых больших к меньшим.
    pub fn candidates(
        &self,
        snapshot: &Snapshot,
        params: &SchedulingParameters,
        protection: &ProtectionList,
    ) -> Vec<i32> {
        let threshold = params.memory_threshold_bytes();
        let mut heavy: Vec<&ProcessRecord> = snapshot
            .processes
            .iter()
            .filter(|p| {
                !p.is_suspended()
                    && p.classification != Classification::Foreground
                    && p.memory_usage_bytes > threshold
                    && !protection.is_os_critical(p)
            })
            .collect();
        heavy.sort_by(|a, b| {
            b.memory_usage_bytes
                .cmp(&a.memory_usage_bytes)
                .then(a.pid.cmp(&b.pid))
        });
        heavy
            .into_iter()
            .take(self.max_suspensions_per_cycle)
            .map(|p| p.pid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ProcessStatus;
    use chrono::Utc;

    const MB: u64 = 1024 * 1024;

    fn memory(used_percent: u64, swap_used_percent: u64) -> MemoryInfo {
        MemoryInfo {
            mem_total_kb: 1000,
            mem_available_kb: 1000 - used_percent * 10,
            swap_total_kb: 1000,
            swap_free_kb: 1000 - swap_used_percent * 10,
        }
    }

    fn record(pid: i32, name: &str, mem_mb: u64, class: Classification) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid: 1,
            name: name.to_string(),
            priority: 0,
            status: ProcessStatus::Running,
            memory_usage_bytes: mem_mb * MB,
            cpu_usage_percent: 0.0,
            cpu_time_ticks: 0,
            first_seen: 0,
            classification: class,
        }
    }

    #[test]
    fn level_follows_thresholds() {
        let policy = MemoryPressurePolicy::default();
        assert_eq!(policy.level(&memory(95, 0)), PressureLevel::High);
        assert_eq!(policy.level(&memory(50, 80)), PressureLevel::High);
        assert_eq!(policy.level(&memory(80, 0)), PressureLevel::Elevated);
        assert_eq!(policy.level(&memory(50, 60)), PressureLevel::Elevated);
        assert_eq!(policy.level(&memory(60, 40)), PressureLevel::Relieved);
    }

    #[test]
    fn no_swap_counts_as_zero_swap() {
        let policy = MemoryPressurePolicy::default();
        let info = MemoryInfo {
            mem_total_kb: 1000,
            mem_available_kb: 900,
            swap_total_kb: 0,
            swap_free_kb: 0,
        };
        assert_eq!(policy.level(&info), PressureLevel::Relieved);
    }

    #[test]
    fn candidates_are_largest_eligible_processes() {
        let mut stopped = record(1005, "stopped", 2000, Classification::IoBound);
        stopped.status = ProcessStatus::Suspended;
        let snapshot = Snapshot {
            sequence: 1,
            taken_at: Utc::now(),
            processes: vec![
                record(500, "sshd", 5000, Classification::IoBound),
                record(1000, "small", 100, Classification::CpuBound),
                record(1001, "a", 400, Classification::IoBound),
                record(1002, "b", 800, Classification::CpuBound),
                record(1003, "game", 3000, Classification::Foreground),
                record(1004, "c", 600, Classification::Background),
                stopped,
                record(1006, "d", 300, Classification::IoBound),
            ],
        };

        let pids = MemoryPressurePolicy::default().candidates(
            &snapshot,
            &SchedulingParameters::default(),
            &ProtectionList::default(),
        );
        assert_eq!(pids, vec![1002, 1004, 1001]);
    }
}
