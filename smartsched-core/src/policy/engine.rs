//! Движок планирования — чистое отображение снапшота в решения.
//!
//! Для каждого процесса снапшота движок вычисляет очки (чем выше, тем больше
//! CPU процесс должен получить) и флаг приостановки по правилу режима. Движок
//! не делает ввода-вывода и детерминирован: одинаковые входы дают одинаковый
//! список решений.

use serde::{Deserialize, Serialize};

use crate::monitor::{ProcessRecord, Snapshot};
use crate::policy::classes::{Algorithm, Mode};
use crate::policy::mode::ModePolicy;
use crate::policy::params::SchedulingParameters;
use crate::policy::protection::ProtectionList;

/// Решение по одному процессу.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub pid: i32,
    /// Очки алгоритма; не значение nice.
    pub score: i64,
    pub should_suspend: bool,
    /// Причина приостановки (для логирования).
    pub reason: Option<String>,
}

/// Результат одного вызова [`SchedulingEngine::decide`].
///
/// Решения упорядочены по убыванию очков, при равенстве — по возрастанию PID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSet {
    pub mode: Mode,
    pub algorithm: Algorithm,
    pub decisions: Vec<Decision>,
}

impl DecisionSet {
    pub fn get(&self, pid: i32) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.pid == pid)
    }

    pub fn score(&self, pid: i32) -> Option<i64> {
        self.get(pid).map(|d| d.score)
    }

    /// PID кандидатов на приостановку.
    pub fn suspension_candidates(&self) -> impl Iterator<Item = i32> + '_ {
        self.decisions
            .iter()
            .filter(|d| d.should_suspend)
            .map(|d| d.pid)
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

/// Движок планирования.
#[derive(Debug, Clone, Default)]
pub struct SchedulingEngine {
    protection: ProtectionList,
}

impl SchedulingEngine {
    pub fn new(protection: ProtectionList) -> Self {
        Self { protection }
    }

    pub fn protection(&self) -> &ProtectionList {
        &self.protection
    }

    /// Вычислить решения для снапшота.
    ///
    /// # Примеры
    ///
    /// ```rust
    /// use smartsched_core::monitor::Snapshot;
    /// use smartsched_core::policy::classes::{Algorithm, Mode};
    /// use smartsched_core::policy::engine::SchedulingEngine;
    /// use smartsched_core::policy::params::SchedulingParameters;
    ///
    /// let engine = SchedulingEngine::default();
    /// let set = engine.decide(
    ///     &Snapshot::default(),
    ///     Mode::Productivity,
    ///     Algorithm::Hybrid,
    ///     &SchedulingParameters::default(),
    /// );
    /// assert!(set.is_empty());
    /// ```
    pub fn decide(
        &self,
        snapshot: &Snapshot,
        mode: Mode,
        algorithm: Algorithm,
        params: &SchedulingParameters,
    ) -> DecisionSet {
        let policy = ModePolicy::for_mode(mode);

        let mut decisions: Vec<Decision> = snapshot
            .processes
            .iter()
            .map(|record| {
                let reason = policy.suspension_reason(record, params, &self.protection);
                Decision {
                    pid: record.pid,
                    score: score(algorithm, record),
                    should_suspend: reason.is_some(),
                    reason: reason.map(str::to_string),
                }
            })
            .collect();

        decisions.sort_by(|a, b| b.score.cmp(&a.score).then(a.pid.cmp(&b.pid)));

        DecisionSet {
            mode,
            algorithm,
            decisions,
        }
    }
}

/// Очки процесса для алгоритма.
pub fn score(algorithm: Algorithm, record: &ProcessRecord) -> i64 {
    match algorithm {
        Algorithm::Fcfs => -(i64::try_from(record.first_seen).unwrap_or(i64::MAX)),
        Algorithm::Sjf => -(i64::try_from(record.cpu_time_ticks).unwrap_or(i64::MAX)),
        Algorithm::Priority => record.priority as i64,
        Algorithm::RoundRobin => 0,
        Algorithm::Hybrid => record.classification.hybrid_tier(),
    }
}
