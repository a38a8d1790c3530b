//! Системные метрики: загрузка CPU, памяти и swap.
//!
//! Значения читаются из `/proc/stat` и `/proc/meminfo` при каждом вызове.
//! Для CPU хранится предыдущий снимок счётчиков, чтобы считать загрузку за
//! интервал между вызовами.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{SchedError, SchedResult};

/// Сырые счётчики CPU из `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user
            .saturating_add(self.nice)
            .saturating_add(self.system)
            .saturating_add(self.idle)
            .saturating_add(self.iowait)
            .saturating_add(self.irq)
            .saturating_add(self.softirq)
            .saturating_add(self.steal)
    }

    fn idle_total(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    /// Доля занятого CPU в процентах относительно предыдущего снимка.
    ///
    /// Возвращает `None`, если счётчики пошли назад (переполнение, некорректные
    /// данные) или за интервал не прошло ни одного тика.
    ///
    /// ```rust
    /// use smartsched_core::metrics::system::CpuTimes;
    ///
    /// let prev = CpuTimes { user: 100, idle: 300, ..Default::default() };
    /// let cur = CpuTimes { user: 150, idle: 350, ..Default::default() };
    /// assert_eq!(cur.busy_percent_since(&prev), Some(50.0));
    /// assert_eq!(prev.busy_percent_since(&cur), None);
    /// ```
    pub fn busy_percent_since(&self, prev: &CpuTimes) -> Option<f64> {
        let total = self.total().checked_sub(prev.total())?;
        let idle = self.idle_total().checked_sub(prev.idle_total())?;
        if total == 0 || idle > total {
            return None;
        }
        Some(((total - idle) as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }

    /// Доля занятого CPU с момента загрузки.
    pub fn busy_percent_since_boot(&self) -> Option<f64> {
        self.busy_percent_since(&CpuTimes::default())
    }
}

/// Основные метрики памяти (значения в килобайтах).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MemoryInfo {
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

impl MemoryInfo {
    pub fn mem_used_kb(&self) -> u64 {
        self.mem_total_kb.saturating_sub(self.mem_available_kb)
    }

    pub fn swap_used_kb(&self) -> u64 {
        self.swap_total_kb.saturating_sub(self.swap_free_kb)
    }

    /// Занятая память в процентах; 0, если MemTotal неизвестен.
    pub fn mem_used_percent(&self) -> f64 {
        percent(self.mem_used_kb(), self.mem_total_kb)
    }

    /// Занятый swap в процентах; 0 без swap.
    pub fn swap_used_percent(&self) -> f64 {
        percent(self.swap_used_kb(), self.swap_total_kb)
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Пути к файлам /proc (подменяются в тестах).
#[derive(Debug, Clone)]
pub struct ProcPaths {
    pub stat: PathBuf,
    pub meminfo: PathBuf,
}

impl ProcPaths {
    /// Создаёт ProcPaths с указанным корнем (например, "/proc" или временный каталог).
    pub fn new(proc_root: impl AsRef<Path>) -> Self {
        let root = proc_root.as_ref();
        Self {
            stat: root.join("stat"),
            meminfo: root.join("meminfo"),
        }
    }
}

impl Default for ProcPaths {
    fn default() -> Self {
        Self::new("/proc")
    }
}

/// Системные метрики, вычисляемые по запросу.
///
/// Не требует повышенных привилегий. Все три запроса независимы и возвращают
/// значения в диапазоне [0, 100] либо [`SchedError::MetricsUnavailable`].
#[derive(Debug, Default)]
pub struct SystemMetrics {
    paths: ProcPaths,
    prev_cpu: Mutex<Option<CpuTimes>>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        Self::with_paths(ProcPaths::default())
    }

    pub fn with_paths(paths: ProcPaths) -> Self {
        Self {
            paths,
            prev_cpu: Mutex::new(None),
        }
    }

    /// Загрузка CPU за интервал с предыдущего вызова.
    ///
    /// Первый вызов считает загрузку с момента загрузки системы. Если за
    /// интервал счётчики не изменились, возвращается значение с момента загрузки.
    pub fn cpu_usage_percent(&self) -> SchedResult<f64> {
        let contents = read_file(&self.paths.stat).map_err(unavailable)?;
        let current = parse_cpu_times(&contents).map_err(unavailable)?;

        let mut prev = self.prev_cpu.lock().unwrap_or_else(|e| e.into_inner());
        let usage = prev
            .as_ref()
            .and_then(|p| current.busy_percent_since(p))
            .or_else(|| current.busy_percent_since_boot())
            .unwrap_or(0.0);
        *prev = Some(current);
        Ok(usage)
    }

    /// Доля занятой памяти (MemTotal − MemAvailable).
    pub fn memory_usage_percent(&self) -> SchedResult<f64> {
        Ok(self.memory_info()?.mem_used_percent())
    }

    /// Доля занятого swap.
    pub fn swap_usage_percent(&self) -> SchedResult<f64> {
        Ok(self.memory_info()?.swap_used_percent())
    }

    /// Прочитать `/proc/meminfo` целиком.
    pub fn memory_info(&self) -> SchedResult<MemoryInfo> {
        let contents = read_file(&self.paths.meminfo).map_err(unavailable)?;
        parse_meminfo(&contents).map_err(unavailable)
    }
}

fn unavailable(e: anyhow::Error) -> SchedError {
    SchedError::MetricsUnavailable(format!("{e:#}"))
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn parse_cpu_times(contents: &str) -> Result<CpuTimes> {
    let line = contents
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| anyhow!("no aggregate 'cpu ' line in /proc/stat"))?;

    let mut fields = line.split_whitespace().skip(1);
    let mut parse_field = |name: &str| -> Result<u64> {
        match fields.next() {
            // старые ядра не сообщают steal
            None if name == "steal" => Ok(0),
            None => Err(anyhow!("field '{name}' missing from /proc/stat cpu line")),
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("field '{name}' in /proc/stat is not an integer")),
        }
    };

    Ok(CpuTimes {
        user: parse_field("user")?,
        nice: parse_field("nice")?,
        system: parse_field("system")?,
        idle: parse_field("idle")?,
        iowait: parse_field("iowait")?,
        irq: parse_field("irq")?,
        softirq: parse_field("softirq")?,
        steal: parse_field("steal")?,
    })
}

fn parse_meminfo(contents: &str) -> Result<MemoryInfo> {
    let mut values: HashMap<&str, u64> = HashMap::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let key = match parts.next() {
            Some(k) => k.trim_end_matches(':'),
            None => continue,
        };
        let value = match parts.next() {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("field '{key}' in /proc/meminfo is not an integer"))?,
            None => continue,
        };
        values.insert(key, value);
    }

    let take = |name: &str| -> Result<u64> {
        values
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("/proc/meminfo has no '{name}' field"))
    };

    Ok(MemoryInfo {
        mem_total_kb: take("MemTotal")?,
        mem_available_kb: take("MemAvailable")?,
        swap_total_kb: values.get("SwapTotal").copied().unwrap_or(0),
        swap_free_kb: values.get("SwapFree").copied().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROC_STAT: &str = "cpu  100 20 50 200 10 5 5 0 0 0\ncpu0 50 10 25 100 5 2 2 0 0 0\n";

    const MEMINFO: &str = "\
MemTotal:       16000000 kB
MemFree:         1000000 kB
MemAvailable:   12000000 kB
Buffers:          345678 kB
Cached:          2345678 kB
SwapTotal:       8000000 kB
SwapFree:        6000000 kB
";

    fn fake_proc(stat: &str, meminfo: &str) -> TempDir {
        let tmp = TempDir::new().expect("tmp");
        fs::write(tmp.path().join("stat"), stat).unwrap();
        fs::write(tmp.path().join("meminfo"), meminfo).unwrap();
        tmp
    }

    #[test]
    fn memory_and_swap_percent_from_fake_proc() {
        let tmp = fake_proc(PROC_STAT, MEMINFO);
        let metrics = SystemMetrics::with_paths(ProcPaths::new(tmp.path()));
        assert!((metrics.memory_usage_percent().unwrap() - 25.0).abs() < 1e-9);
        assert!((metrics.swap_usage_percent().unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_uses_delta_between_calls() {
        let tmp = fake_proc(PROC_STAT, MEMINFO);
        let metrics = SystemMetrics::with_paths(ProcPaths::new(tmp.path()));

        // с момента загрузки: busy = 390 - 210 = 180 из 390
        let first = metrics.cpu_usage_percent().unwrap();
        assert!((first - 180.0 / 390.0 * 100.0).abs() < 1e-9);

        // +100 тиков, из них 25 idle
        fs::write(
            tmp.path().join("stat"),
            "cpu  175 20 50 225 10 5 5 0 0 0\n",
        )
        .unwrap();
        let second = metrics.cpu_usage_percent().unwrap();
        assert!((second - 75.0).abs() < 1e-9);
    }

    #[test]
    fn missing_files_report_unavailable() {
        let tmp = TempDir::new().unwrap();
        let metrics = SystemMetrics::with_paths(ProcPaths::new(tmp.path()));
        assert!(matches!(
            metrics.cpu_usage_percent(),
            Err(SchedError::MetricsUnavailable(_))
        ));
        assert!(matches!(
            metrics.memory_usage_percent(),
            Err(SchedError::MetricsUnavailable(_))
        ));
    }

    #[test]
    fn malformed_meminfo_reports_unavailable() {
        let tmp = fake_proc(PROC_STAT, "MemTotal: lots kB\n");
        let metrics = SystemMetrics::with_paths(ProcPaths::new(tmp.path()));
        assert!(matches!(
            metrics.swap_usage_percent(),
            Err(SchedError::MetricsUnavailable(_))
        ));
    }

    #[test]
    fn no_swap_means_zero_percent() {
        let tmp = fake_proc(PROC_STAT, "MemTotal: 100 kB\nMemAvailable: 50 kB\n");
        let metrics = SystemMetrics::with_paths(ProcPaths::new(tmp.path()));
        assert_eq!(metrics.swap_usage_percent().unwrap(), 0.0);
    }

    #[test]
    fn cpu_delta_handles_counter_reset() {
        let prev = CpuTimes {
            user: 200,
            ..Default::default()
        };
        let cur = CpuTimes {
            user: 100,
            ..Default::default()
        };
        assert!(cur.busy_percent_since(&prev).is_none());
        assert!(prev.busy_percent_since(&prev).is_none());
    }

    #[test]
    fn real_proc_values_are_in_range() {
        let metrics = SystemMetrics::new();
        for value in [
            metrics.cpu_usage_percent().unwrap(),
            metrics.memory_usage_percent().unwrap(),
            metrics.swap_usage_percent().unwrap(),
        ] {
            assert!((0.0..=100.0).contains(&value), "value out of range: {value}");
        }
    }
}
