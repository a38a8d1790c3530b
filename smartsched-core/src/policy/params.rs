//! Пользовательские параметры планирования.

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Допустимый диапазон кванта Round-Robin (мс).
pub const TIME_SLICE_MS_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;

/// Допустимый диапазон порога памяти (МБ).
pub const MEMORY_THRESHOLD_MB_RANGE: std::ops::RangeInclusive<f64> = 50.0..=10000.0;

/// Параметры, которые пользователь может менять на лету.
///
/// `time_slice_ms` задаёт квант ротации для Round-Robin, `memory_threshold_mb`
/// используется правилами приостановки агрессивных режимов.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulingParameters {
    #[serde(default = "default_time_slice_ms")]
    pub time_slice_ms: u32,
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: f64,
}

fn default_time_slice_ms() -> u32 {
    5
}

fn default_memory_threshold_mb() -> f64 {
    200.0
}

impl Default for SchedulingParameters {
    fn default() -> Self {
        Self {
            time_slice_ms: default_time_slice_ms(),
            memory_threshold_mb: default_memory_threshold_mb(),
        }
    }
}

impl SchedulingParameters {
    /// Создать параметры с проверкой границ.
    ///
    /// Оба значения проверяются до создания, так что при ошибке вызывающий код
    /// может оставить прежние параметры нетронутыми.
    pub fn new(time_slice_ms: i64, memory_threshold_mb: f64) -> SchedResult<Self> {
        let start = *TIME_SLICE_MS_RANGE.start() as i64;
        let end = *TIME_SLICE_MS_RANGE.end() as i64;
        if !(start..=end).contains(&time_slice_ms) {
            return Err(SchedError::InvalidParameter(format!(
                "time_slice_ms must be in [{start}, {end}] (got {time_slice_ms})"
            )));
        }
        if memory_threshold_mb.is_nan() || !MEMORY_THRESHOLD_MB_RANGE.contains(&memory_threshold_mb) {
            return Err(SchedError::InvalidParameter(format!(
                "memory_threshold_mb must be in [{}, {}] (got {memory_threshold_mb})",
                MEMORY_THRESHOLD_MB_RANGE.start(),
                MEMORY_THRESHOLD_MB_RANGE.end()
            )));
        }
        Ok(Self {
            time_slice_ms: time_slice_ms as u32,
            memory_threshold_mb,
        })
    }

    /// Проверить уже построенные параметры (например, из конфига).
    pub fn validate(&self) -> SchedResult<()> {
        Self::new(self.time_slice_ms as i64, self.memory_threshold_mb).map(|_| ())
    }

    /// Порог памяти в байтах.
    pub fn memory_threshold_bytes(&self) -> u64 {
        (self.memory_threshold_mb * 1024.0 * 1024.0) as u64
    }
}
