//! Режимы, алгоритмы и классы процессов.
//!
//! Перечисления, которые разделяют монитор, движок и координатор.

use serde::{Deserialize, Serialize};

use crate::error::SchedError;

/// Пользовательский режим работы системы.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Всё ради активного приложения: фон приостанавливается.
    Gaming,
    /// Только переупорядочивание приоритетов, без приостановки.
    Productivity,
    /// Экономия ресурсов: тяжёлые по памяти и CPU процессы приостанавливаются.
    PowerSaving,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Gaming => "gaming",
            Mode::Productivity => "productivity",
            Mode::PowerSaving => "power-saving",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaming" => Ok(Mode::Gaming),
            "productivity" => Ok(Mode::Productivity),
            "power-saving" | "power_saving" | "powersaving" => Ok(Mode::PowerSaving),
            other => Err(SchedError::InvalidParameter(format!("unknown mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Алгоритм вычисления очков приоритета.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// First-Come-First-Served: раньше замеченные процессы впереди.
    Fcfs,
    /// Shortest-Job-First: меньше потраченного CPU — выше очки.
    Sjf,
    /// Сквозная передача приоритета ОС без изменений.
    Priority,
    /// Все на равных, ротация по кванту времени.
    RoundRobin,
    /// Ярусы по классификации: Foreground > IOBound > CPUBound.
    Hybrid,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::Fcfs,
        Algorithm::Sjf,
        Algorithm::Priority,
        Algorithm::RoundRobin,
        Algorithm::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Fcfs => "fcfs",
            Algorithm::Sjf => "sjf",
            Algorithm::Priority => "priority",
            Algorithm::RoundRobin => "round-robin",
            Algorithm::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fcfs" => Ok(Algorithm::Fcfs),
            "sjf" => Ok(Algorithm::Sjf),
            "priority" => Ok(Algorithm::Priority),
            "round-robin" | "round_robin" | "rr" => Ok(Algorithm::RoundRobin),
            "hybrid" => Ok(Algorithm::Hybrid),
            other => Err(SchedError::InvalidParameter(format!(
                "unknown algorithm '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Поведенческий класс процесса, пересчитывается каждый цикл.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Владеет фокусом ввода.
    Foreground,
    /// Низкое сглаженное потребление CPU.
    IoBound,
    /// Высокое сглаженное потребление CPU.
    CpuBound,
    /// Ещё не классифицирован (первое наблюдение).
    Background,
}

impl Classification {
    /// Ярус для Hybrid: больше — выше.
    pub fn hybrid_tier(&self) -> i64 {
        match self {
            Classification::Foreground => 3,
            Classification::IoBound => 2,
            Classification::Background => 1,
            Classification::CpuBound => 0,
        }
    }
}
