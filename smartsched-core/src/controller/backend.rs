//! Бэкенды, через которые контроллер обращается к процессам ОС.
//!
//! - [`NixBackend`] — настоящие сигналы (nix) и `setpriority` (libc).
//! - [`DryRunBackend`] — читает состояние как обычно, но только логирует
//!   изменяющие вызовы.
//! - [`SimulatedBackend`] — процессы в памяти поверх
//!   [`StaticProcessSource`], для тестов и симуляций.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use procfs::ProcError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SchedError, SchedResult};
use crate::metrics::process::{read_process, StaticProcessSource};

/// Минимальное и максимальное значение nice в Linux.
pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

/// Управляющий сигнал процессу.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlSignal {
    Stop,
    Continue,
    Terminate,
}

impl ControlSignal {
    fn as_nix(self) -> Signal {
        match self {
            ControlSignal::Stop => Signal::SIGSTOP,
            ControlSignal::Continue => Signal::SIGCONT,
            ControlSignal::Terminate => Signal::SIGTERM,
        }
    }

    fn op(self) -> &'static str {
        match self {
            ControlSignal::Stop => "suspend",
            ControlSignal::Continue => "resume",
            ControlSignal::Terminate => "terminate",
        }
    }
}

/// То, что контроллеру нужно знать о процессе перед действием.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessState {
    pub name: String,
    pub stopped: bool,
    pub nice: i32,
}

/// Доступ к процессам ОС.
///
/// Все методы блокирующие и вызываются из `spawn_blocking`.
pub trait ProcessBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Текущее состояние процесса; `Ok(None)`, если процесса нет.
    fn query(&self, pid: i32) -> SchedResult<Option<ProcessState>>;

    fn send_signal(&self, pid: i32, signal: ControlSignal) -> SchedResult<()>;

    /// Установить nice; значение уже приведено к `NICE_MIN..=NICE_MAX`.
    fn set_priority(&self, pid: i32, nice: i32) -> SchedResult<()>;
}

/// Реальный бэкенд: `kill(2)` и `setpriority(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixBackend;

impl ProcessBackend for NixBackend {
    fn name(&self) -> &'static str {
        "nix"
    }

    fn query(&self, pid: i32) -> SchedResult<Option<ProcessState>> {
        match read_process(pid) {
            Ok(raw) => Ok(Some(ProcessState {
                name: raw.name,
                stopped: raw.stopped,
                nice: raw.nice,
            })),
            Err(ProcError::NotFound(_)) => Ok(None),
            Err(ProcError::PermissionDenied(_)) => Err(SchedError::PermissionDenied { pid, op: "query" }),
            Err(e) => Err(SchedError::Io(std::io::Error::other(e.to_string()))),
        }
    }

    fn send_signal(&self, pid: i32, signal: ControlSignal) -> SchedResult<()> {
        kill(Pid::from_raw(pid), signal.as_nix())
            .map_err(|errno| SchedError::from_errno(errno, pid, signal.op()))?;
        debug!(pid = pid, signal = ?signal, "Sent signal");
        Ok(())
    }

    fn set_priority(&self, pid: i32, nice: i32) -> SchedResult<()> {
        let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
        if result < 0 {
            return Err(SchedError::from_errno(nix::errno::Errno::last(), pid, "renice"));
        }
        debug!(pid = pid, nice = nice, "Applied nice priority");
        Ok(())
    }
}

/// Бэкенд «сухого прогона»: состояние читается через вложенный бэкенд,
/// изменения только логируются.
pub struct DryRunBackend {
    inner: Arc<dyn ProcessBackend>,
}

impl DryRunBackend {
    pub fn new(inner: Arc<dyn ProcessBackend>) -> Self {
        Self { inner }
    }
}

impl ProcessBackend for DryRunBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn query(&self, pid: i32) -> SchedResult<Option<ProcessState>> {
        self.inner.query(pid)
    }

    fn send_signal(&self, pid: i32, signal: ControlSignal) -> SchedResult<()> {
        info!(pid = pid, signal = ?signal, "Dry-run: would send signal");
        Ok(())
    }

    fn set_priority(&self, pid: i32, nice: i32) -> SchedResult<()> {
        info!(pid = pid, nice = nice, "Dry-run: would apply nice");
        Ok(())
    }
}

/// Бэкенд в памяти: сигналы и nice меняют записи [`StaticProcessSource`],
/// так что следующий цикл монитора видит результат.
pub struct SimulatedBackend {
    source: Arc<StaticProcessSource>,
    denied: Mutex<HashSet<i32>>,
    stalls: Mutex<HashMap<i32, Duration>>,
    signals: Mutex<Vec<(i32, ControlSignal)>>,
}

impl SimulatedBackend {
    pub fn new(source: Arc<StaticProcessSource>) -> Self {
        Self {
            source,
            denied: Mutex::new(HashSet::new()),
            stalls: Mutex::new(HashMap::new()),
            signals: Mutex::new(Vec::new()),
        }
    }

    /// Все изменяющие вызовы для `pid` будут завершаться `PermissionDenied`.
    pub fn deny(&self, pid: i32) {
        self.denied.lock().unwrap_or_else(|e| e.into_inner()).insert(pid);
    }

    /// Изменяющие вызовы для `pid` будут «зависать» на `delay`.
    pub fn stall(&self, pid: i32, delay: Duration) {
        self.stalls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, delay);
    }

    /// Все отправленные сигналы в порядке отправки.
    pub fn signals(&self) -> Vec<(i32, ControlSignal)> {
        self.signals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn before_mutation(&self, pid: i32, op: &'static str) -> SchedResult<()> {
        let delay = self
            .stalls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.denied.lock().unwrap_or_else(|e| e.into_inner()).contains(&pid) {
            return Err(SchedError::PermissionDenied { pid, op });
        }
        if self.source.get(pid).is_none() {
            return Err(SchedError::NoSuchProcess { pid });
        }
        Ok(())
    }
}

impl ProcessBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn query(&self, pid: i32) -> SchedResult<Option<ProcessState>> {
        Ok(self.source.get(pid).map(|raw| ProcessState {
            name: raw.name,
            stopped: raw.stopped,
            nice: raw.nice,
        }))
    }

    fn send_signal(&self, pid: i32, signal: ControlSignal) -> SchedResult<()> {
        self.before_mutation(pid, signal.op())?;
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((pid, signal));
        match signal {
            ControlSignal::Stop => self.source.update(pid, |p| p.stopped = true),
            ControlSignal::Continue => self.source.update(pid, |p| p.stopped = false),
            // остановленный процесс завершится только после SIGCONT
            ControlSignal::Terminate => {
                if self.source.get(pid).is_some_and(|p| !p.stopped) {
                    self.source.remove(pid);
                }
            }
        }
        Ok(())
    }

    fn set_priority(&self, pid: i32, nice: i32) -> SchedResult<()> {
        self.before_mutation(pid, "renice")?;
        self.source.update(pid, |p| p.nice = nice);
        Ok(())
    }
}
