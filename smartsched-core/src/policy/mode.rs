//! Политика режимов: алгоритм по умолчанию и правило приостановки.

use crate::monitor::ProcessRecord;
use crate::policy::classes::{Algorithm, Classification, Mode};
use crate::policy::params::SchedulingParameters;
use crate::policy::protection::ProtectionList;

/// Агрессивность автоматической приостановки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionRule {
    /// Только переупорядочивание приоритетов.
    Never,
    /// Приостанавливается всё, кроме переднего плана и критичных процессов.
    NonForeground,
    /// Приостанавливаются процессы сверх порога памяти или CPUBound.
    ResourceHeavy,
}

/// То, что режим сообщает движку.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePolicy {
    pub mode: Mode,
    pub default_algorithm: Algorithm,
    pub rule: SuspensionRule,
}

impl ModePolicy {
    pub fn for_mode(mode: Mode) -> Self {
        let rule = match mode {
            Mode::Gaming => SuspensionRule::NonForeground,
            Mode::Productivity => SuspensionRule::Never,
            Mode::PowerSaving => SuspensionRule::ResourceHeavy,
        };
        Self {
            mode,
            default_algorithm: Algorithm::Hybrid,
            rule,
        }
    }

    /// Причина приостановки, если правило режима срабатывает для процесса.
    ///
    /// Системно-критичные процессы никогда не становятся кандидатами.
    pub fn suspension_reason(
        &self,
        record: &ProcessRecord,
        params: &SchedulingParameters,
        protection: &ProtectionList,
    ) -> Option<&'static str> {
        if protection.is_os_critical(record) {
            return None;
        }
        match self.rule {
            SuspensionRule::Never => None,
            SuspensionRule::NonForeground => {
                (record.classification != Classification::Foreground).then_some("not foreground")
            }
            SuspensionRule::ResourceHeavy => {
                if record.memory_usage_bytes > params.memory_threshold_bytes() {
                    Some("memory above threshold")
                } else if record.classification == Classification::CpuBound {
                    Some("cpu bound")
                } else {
                    None
                }
            }
        }
    }
}
