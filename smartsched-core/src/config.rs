//! Конфигурация планировщика (YAML).
//!
//! Файл только задаёт начальные значения режима, алгоритма и параметров;
//! во время работы они живут в памяти [`crate::scheduler::Scheduler`].
//! Все поля имеют значения по умолчанию, поэтому пустой файл допустим.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::controller::backend::{NICE_MAX, NICE_MIN};
use crate::controller::planner::NiceBand;
use crate::controller::ControllerSettings;
use crate::monitor::MonitorSettings;
use crate::policy::classes::{Algorithm, Mode};
use crate::policy::params::SchedulingParameters;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Интервал цикла мониторинга.
    pub polling_interval_ms: u64,
    pub mode: Mode,
    /// Явный алгоритм; `None` — алгоритм режима по умолчанию.
    pub algorithm: Option<Algorithm>,
    pub params: SchedulingParameters,
    pub thresholds: Thresholds,
    pub controller: ControllerConfig,
    /// Только логировать действия, не трогая процессы.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_interval_ms: 1000,
            mode: Mode::Productivity,
            algorithm: None,
            params: SchedulingParameters::default(),
            thresholds: Thresholds::default(),
            controller: ControllerConfig::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Ниже этого сглаженного CPU% процесс считается IOBound.
    pub io_bound_cpu_percent: f64,
    /// Вес нового замера в EWMA загрузки CPU, (0, 1].
    pub cpu_smoothing: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        let defaults = MonitorSettings::default();
        Self {
            io_bound_cpu_percent: defaults.io_bound_cpu_percent,
            cpu_smoothing: defaults.cpu_smoothing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Максимальное время одного системного вызова над процессом.
    pub op_timeout_ms: u64,
    /// Имена, добавляемые к встроенному защищённому набору.
    pub extra_protected: Vec<String>,
    /// Размер журнала аудита команд.
    pub audit_capacity: usize,
    /// Nice для процессов с наибольшими очками.
    pub nice_favored: i32,
    /// Nice для процессов с наименьшими очками.
    pub nice_demoted: i32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let band = NiceBand::default();
        let settings = ControllerSettings::default();
        Self {
            op_timeout_ms: settings.op_timeout.as_millis() as u64,
            extra_protected: Vec::new(),
            audit_capacity: settings.audit_capacity,
            nice_favored: band.favored,
            nice_demoted: band.demoted,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        Self::from_yaml(&data)
            .with_context(|| format!("invalid config at {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        // пустой документ YAML разбирается как null
        let cfg: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(data).context("failed to parse YAML config")?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (50..=60000).contains(&self.polling_interval_ms),
            "polling_interval_ms must be in 50..=60000 (got {})",
            self.polling_interval_ms
        );
        self.params.validate()?;
        self.thresholds.validate()?;
        self.controller.validate()?;
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            io_bound_cpu_percent: self.thresholds.io_bound_cpu_percent,
            cpu_smoothing: self.thresholds.cpu_smoothing,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            op_timeout: Duration::from_millis(self.controller.op_timeout_ms),
            audit_capacity: self.controller.audit_capacity,
        }
    }

    pub fn nice_band(&self) -> NiceBand {
        NiceBand {
            favored: self.controller.nice_favored,
            demoted: self.controller.nice_demoted,
        }
    }
}

impl Thresholds {
    fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=100.0).contains(&self.io_bound_cpu_percent),
            "thresholds.io_bound_cpu_percent must be in the [0, 100] range (got {})",
            self.io_bound_cpu_percent
        );
        ensure!(
            self.cpu_smoothing > 0.0 && self.cpu_smoothing <= 1.0,
            "thresholds.cpu_smoothing must be in the (0, 1] range (got {})",
            self.cpu_smoothing
        );
        Ok(())
    }
}

impl ControllerConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=10000).contains(&self.op_timeout_ms),
            "controller.op_timeout_ms must be in 1..=10000 (got {})",
            self.op_timeout_ms
        );
        ensure!(
            (1..=100_000).contains(&self.audit_capacity),
            "controller.audit_capacity must be in 1..=100000 (got {})",
            self.audit_capacity
        );
        ensure!(
            (NICE_MIN..=NICE_MAX).contains(&self.nice_favored)
                && (NICE_MIN..=NICE_MAX).contains(&self.nice_demoted),
            "controller.nice_favored/nice_demoted must be in {NICE_MIN}..={NICE_MAX}"
        );
        ensure!(
            self.nice_favored < self.nice_demoted,
            "controller.nice_favored ({}) must be lower than nice_demoted ({})",
            self.nice_favored,
            self.nice_demoted
        );
        ensure!(
            self.extra_protected.iter().all(|n| !n.trim().is_empty()),
            "controller.extra_protected must not contain empty names"
        );
        Ok(())
    }
}
