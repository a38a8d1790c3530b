//! Перевод очков движка в конкретные значения nice.
//!
//! Этот модуль вычисляет, каким процессам нужно изменить приоритет, и
//! возвращает список [`PriorityAdjustment`]. Применяет их
//! [`super::ProcessController::apply_adjustments`].

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::backend::{NICE_MAX, NICE_MIN};
use crate::error::{SchedError, SchedResult};
use crate::monitor::{ProcessRecord, Snapshot};
use crate::policy::classes::Algorithm;
use crate::policy::engine::DecisionSet;
use crate::policy::params::SchedulingParameters;
use crate::policy::protection::ProtectionList;

/// Базовый nice для «равных» процессов (RoundRobin, одинаковые очки).
pub const BASELINE_NICE: i32 = 0;
/// Nice процессов в текущем окне ротации RoundRobin.
pub const ROTATION_BOOST_NICE: i32 = -2;

/// Запрошенное изменение приоритета для процесса.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityAdjustment {
    pub pid: i32,
    pub current_nice: i32,
    pub target_nice: i32,
    /// Очки движка, из которых получен target_nice.
    pub score: i64,
}

/// Диапазон nice, на который отображаются очки ранжирующих алгоритмов.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiceBand {
    pub favored: i32,
    pub demoted: i32,
}

impl Default for NiceBand {
    fn default() -> Self {
        Self {
            favored: -5,
            demoted: 10,
        }
    }
}

impl NiceBand {
    pub fn new(favored: i32, demoted: i32) -> SchedResult<Self> {
        let band = Self { favored, demoted };
        band.validate()?;
        Ok(band)
    }

    pub fn validate(&self) -> SchedResult<()> {
        let range = NICE_MIN..=NICE_MAX;
        if !range.contains(&self.favored) || !range.contains(&self.demoted) {
            return Err(SchedError::InvalidParameter(format!(
                "nice band {}..{} outside {}..={}",
                self.favored, self.demoted, NICE_MIN, NICE_MAX
            )));
        }
        if self.favored >= self.demoted {
            return Err(SchedError::InvalidParameter(format!(
                "favored nice {} must be lower than demoted nice {}",
                self.favored, self.demoted
            )));
        }
        Ok(())
    }

    /// Nice для уровня `level` из `levels` различных значений очков
    /// (уровень 0 — наибольшие очки).
    ///
    /// ```rust
    /// use smartsched_core::controller::planner::NiceBand;
    ///
    /// let band = NiceBand::new(-5, 10).unwrap();
    /// assert_eq!(band.nice_for_level(0, 4), -5);
    /// assert_eq!(band.nice_for_level(3, 4), 10);
    /// assert_eq!(band.nice_for_level(0, 1), 0);
    /// ```
    pub fn nice_for_level(&self, level: usize, levels: usize) -> i32 {
        if levels <= 1 {
            return BASELINE_NICE.clamp(self.favored, self.demoted);
        }
        let span = (self.demoted - self.favored) as i64;
        let level = level.min(levels - 1) as i64;
        let offset = span * level / (levels as i64 - 1);
        self.favored + offset as i32
    }
}

/// Может ли процесс получить новый nice в этом цикле.
fn is_eligible(record: &ProcessRecord, decisions: &DecisionSet, protection: &ProtectionList) -> bool {
    !record.is_suspended()
        && !protection.is_os_critical(record)
        && !decisions.get(record.pid).is_some_and(|d| d.should_suspend)
}

/// Построить список изменений для ранжирующих алгоритмов (FCFS, SJF, Hybrid).
///
/// Различные значения очков упорядочиваются по убыванию и равномерно
/// раскладываются по `band`; равные очки получают равный nice. Для Priority
/// и RoundRobin возвращается пустой список.
pub fn plan_priority_changes(
    snapshot: &Snapshot,
    decisions: &DecisionSet,
    band: NiceBand,
    protection: &ProtectionList,
) -> Vec<PriorityAdjustment> {
    if matches!(decisions.algorithm, Algorithm::Priority | Algorithm::RoundRobin) {
        return Vec::new();
    }

    let eligible: Vec<(&ProcessRecord, i64)> = decisions
        .decisions
        .iter()
        .filter_map(|d| snapshot.get(d.pid).map(|r| (r, d.score)))
        .filter(|(r, _)| is_eligible(r, decisions, protection))
        .collect();

    // решения уже отсортированы по убыванию очков
    let mut levels: Vec<i64> = eligible.iter().map(|(_, s)| *s).collect();
    levels.dedup();

    let mut adjustments = Vec::new();
    let mut level = 0;
    for (record, score) in eligible {
        while levels[level] != score {
            level += 1;
        }
        let target = band.nice_for_level(level, levels.len());
        if needs_change(record.priority, target) {
            adjustments.push(PriorityAdjustment {
                pid: record.pid,
                current_nice: record.priority,
                target_nice: target,
                score,
            });
        }
    }

    adjustments
}

fn needs_change(current_nice: i32, target_nice: i32) -> bool {
    current_nice != target_nice
}

/// Ротация окна «привилегированных» процессов для RoundRobin.
#[derive(Debug, Default, Clone)]
pub struct RoundRobinRotator {
    offset: usize,
}

impl RoundRobinRotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Размер окна: сколько квантов укладывается в интервал опроса.
    pub fn window_size(polling_interval: Duration, params: &SchedulingParameters) -> usize {
        let interval_ms = polling_interval.as_millis().max(1) as u64;
        let slice_ms = u64::from(params.time_slice_ms.max(1));
        interval_ms.div_ceil(slice_ms) as usize
    }

    /// PID текущего окна; окно сдвигается на свой размер при каждом вызове.
    fn next_window(&mut self, eligible: &[i32], window: usize) -> HashSet<i32> {
        let n = eligible.len();
        if n == 0 {
            return HashSet::new();
        }
        let window = window.clamp(1, n);
        let start = self.offset % n;
        self.offset = (start + window) % n;
        (0..window).map(|i| eligible[(start + i) % n]).collect()
    }

    /// Изменения nice для RoundRobin: все на базовом nice, окно с бонусом.
    pub fn plan(
        &mut self,
        snapshot: &Snapshot,
        decisions: &DecisionSet,
        polling_interval: Duration,
        params: &SchedulingParameters,
        protection: &ProtectionList,
    ) -> Vec<PriorityAdjustment> {
        // снапшот упорядочен по PID, поэтому ротация стабильна
        let eligible: Vec<&ProcessRecord> = snapshot
            .processes
            .iter()
            .filter(|r| is_eligible(r, decisions, protection))
            .collect();
        let pids: Vec<i32> = eligible.iter().map(|r| r.pid).collect();
        let boosted = self.next_window(&pids, Self::window_size(polling_interval, params));

        eligible
            .into_iter()
            .filter_map(|record| {
                let target = if boosted.contains(&record.pid) {
                    ROTATION_BOOST_NICE
                } else {
                    BASELINE_NICE
                };
                needs_change(record.priority, target).then(|| PriorityAdjustment {
                    pid: record.pid,
                    current_nice: record.priority,
                    target_nice: target,
                    score: 0,
                })
            })
            .collect()
    }
}

/// Результат применения изменений приоритетов.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Количество успешно применённых изменений.
    pub applied: usize,
    /// Процесс уже был в нужном состоянии или исчез.
    pub skipped: usize,
    /// Количество ошибок при применении.
    pub errors: usize,
}
