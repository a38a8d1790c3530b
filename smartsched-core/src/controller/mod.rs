//! Контроллер процессов: применение решений и команд пользователя к ОС.
//!
//! Каждое изменяющее действие оформлено как [`ControlCommand`] — обычное
//! значение, которое можно выполнить, записать в журнал и повторить.
//! Контроллер:
//! - сериализует все изменяющие операции над одним PID;
//! - ограничивает время каждого системного вызова (`op_timeout`), зависший
//!   вызов не останавливает цикл;
//! - отказывает в приостановке и завершении защищённых процессов без явного
//!   override;
//! - считает повторную команду в уже достигнутом состоянии успешной (no-op).

pub mod backend;
pub mod planner;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SchedError, SchedResult};
use crate::monitor::Snapshot;
use crate::policy::protection::ProtectionList;

use self::backend::{ControlSignal, ProcessBackend, ProcessState, NICE_MAX, NICE_MIN};
use self::planner::{ApplyResult, PriorityAdjustment};

/// Вид управляющей команды.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum CommandKind {
    Suspend,
    Resume,
    Terminate,
    SetPriority { nice: i32 },
}

impl CommandKind {
    /// Требует ли команда override для защищённых имён.
    fn is_guarded(&self) -> bool {
        matches!(self, CommandKind::Suspend | CommandKind::Terminate)
    }
}

/// Изменяющее действие над одним процессом.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub pid: i32,
    pub kind: CommandKind,
    /// Явное разрешение трогать защищённый процесс.
    pub override_protection: bool,
}

impl ControlCommand {
    pub fn suspend(pid: i32, override_protection: bool) -> Self {
        Self {
            pid,
            kind: CommandKind::Suspend,
            override_protection,
        }
    }

    pub fn resume(pid: i32) -> Self {
        Self {
            pid,
            kind: CommandKind::Resume,
            override_protection: false,
        }
    }

    pub fn terminate(pid: i32, override_protection: bool) -> Self {
        Self {
            pid,
            kind: CommandKind::Terminate,
            override_protection,
        }
    }

    pub fn set_priority(pid: i32, nice: i32) -> Self {
        Self {
            pid,
            kind: CommandKind::SetPriority { nice },
            override_protection: false,
        }
    }
}

/// Успешный результат команды.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandOutcome {
    /// Системный вызов выполнен.
    Applied,
    /// Процесс уже был в нужном состоянии.
    NoOp,
}

/// Итог команды в журнале аудита.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "result")]
pub enum AuditOutcome {
    Applied,
    NoOp,
    Failed { error: String },
}

/// Запись журнала аудита.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub command: ControlCommand,
    pub outcome: AuditOutcome,
}

/// Настройки контроллера.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub op_timeout: Duration,
    pub audit_capacity: usize,
}

/// Сколько исчезнувших или опрошенных PID контроллер помнит.
const KNOWN_PIDS_CAPACITY: usize = 4096;

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(200),
            audit_capacity: 256,
        }
    }
}

/// Контроллер процессов.
pub struct ProcessController {
    backend: Arc<dyn ProcessBackend>,
    protection: Arc<ProtectionList>,
    settings: ControllerSettings,
    known: Mutex<KnownPids>,
    locks: Mutex<HashMap<i32, Arc<tokio::sync::Mutex<()>>>>,
    audit: Mutex<VecDeque<CommandRecord>>,
    next_id: AtomicU64,
}

/// PID, которые контроллер когда-либо видел: живые из последнего снапшота
/// плюс ограниченная очередь исчезнувших и опрошенных напрямую.
#[derive(Debug, Default)]
struct KnownPids {
    live: HashSet<i32>,
    recent: VecDeque<i32>,
    recent_set: HashSet<i32>,
}

impl KnownPids {
    fn contains(&self, pid: i32) -> bool {
        self.live.contains(&pid) || self.recent_set.contains(&pid)
    }

    fn remember(&mut self, pid: i32) {
        if !self.recent_set.insert(pid) {
            return;
        }
        self.recent.push_back(pid);
        while self.recent.len() > KNOWN_PIDS_CAPACITY {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
    }

    fn replace_live(&mut self, live: HashSet<i32>) {
        let gone: Vec<i32> = self.live.difference(&live).copied().collect();
        for pid in gone {
            self.remember(pid);
        }
        self.live = live;
    }
}

impl ProcessController {
    pub fn new(
        backend: Arc<dyn ProcessBackend>,
        protection: ProtectionList,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            backend,
            protection: Arc::new(protection),
            settings,
            known: Mutex::new(KnownPids::default()),
            locks: Mutex::new(HashMap::new()),
            audit: Mutex::new(VecDeque::with_capacity(settings.audit_capacity.min(1024))),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn protection(&self) -> &ProtectionList {
        &self.protection
    }

    /// Имя входит в защищённый набор: вызывающий код должен предупредить
    /// пользователя и передать override явно.
    pub fn is_protected(&self, name: &str) -> bool {
        self.protection.is_protected_name(name)
    }

    /// Запомнить PID нового снапшота.
    ///
    /// Завершение процесса, который контроллер уже видел (в снапшоте или
    /// при выполнении команды) и который исчез, считается no-op; для PID,
    /// которого контроллер не видел, возвращается `NoSuchProcess`.
    pub fn observe(&self, snapshot: &Snapshot) {
        let live: HashSet<i32> = snapshot.pids().collect();

        // блокировки исчезнувших PID больше не нужны
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|pid, lock| live.contains(pid) || Arc::strong_count(lock) > 1);
        drop(locks);

        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace_live(live);
    }

    pub async fn suspend(&self, pid: i32, override_protection: bool) -> SchedResult<CommandOutcome> {
        self.execute(ControlCommand::suspend(pid, override_protection)).await
    }

    pub async fn resume(&self, pid: i32) -> SchedResult<CommandOutcome> {
        self.execute(ControlCommand::resume(pid)).await
    }

    pub async fn terminate(&self, pid: i32, override_protection: bool) -> SchedResult<CommandOutcome> {
        self.execute(ControlCommand::terminate(pid, override_protection)).await
    }

    /// Установить nice (значение приводится к -20..=19).
    pub async fn apply_priority(&self, pid: i32, nice: i32) -> SchedResult<CommandOutcome> {
        self.execute(ControlCommand::set_priority(pid, nice)).await
    }

    /// Выполнить команду и записать результат в журнал аудита.
    pub async fn execute(&self, command: ControlCommand) -> SchedResult<CommandOutcome> {
        let result = self.run_serialized(command).await;

        match &result {
            Ok(outcome) => debug!(pid = command.pid, kind = ?command.kind, outcome = ?outcome, "Command executed"),
            // отказы по отдельным процессам в цикле ожидаемы и не шумят
            Err(e) if e.is_recoverable() => {
                debug!(pid = command.pid, kind = ?command.kind, error = %e, "Command failed")
            }
            Err(e) => warn!(pid = command.pid, kind = ?command.kind, error = %e, "Command refused"),
        }
        self.record(command, &result);
        result
    }

    /// Повторить команду из журнала аудита.
    pub async fn retry(&self, record_id: u64) -> SchedResult<CommandOutcome> {
        let command = self
            .audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id == record_id)
            .map(|r| r.command)
            .ok_or_else(|| {
                SchedError::InvalidParameter(format!("no audit record with id {record_id}"))
            })?;
        info!(record_id = record_id, pid = command.pid, "Retrying command");
        self.execute(command).await
    }

    /// Копия журнала аудита, от старых записей к новым.
    pub fn audit_log(&self) -> Vec<CommandRecord> {
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Применить список изменений приоритетов.
    ///
    /// Ошибки по отдельным процессам (`PermissionDenied`, `NoSuchProcess`)
    /// логируются и не прерывают применение остальных.
    pub async fn apply_adjustments(&self, adjustments: &[PriorityAdjustment]) -> ApplyResult {
        let mut result = ApplyResult::default();

        for adj in adjustments {
            match self.apply_priority(adj.pid, adj.target_nice).await {
                Ok(CommandOutcome::Applied) => result.applied += 1,
                Ok(CommandOutcome::NoOp) => result.skipped += 1,
                Err(SchedError::NoSuchProcess { .. }) => result.skipped += 1,
                Err(e) => {
                    debug!(pid = adj.pid, error = %e, "Failed to apply nice");
                    result.errors += 1;
                }
            }
        }

        result
    }

    fn pid_lock(&self, pid: i32) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(pid)
            .or_default()
            .clone()
    }

    async fn run_serialized(&self, command: ControlCommand) -> SchedResult<CommandOutcome> {
        // один срок на ожидание блокировки PID и на сам системный вызов
        let deadline = tokio::time::Instant::now() + self.settings.op_timeout;

        // guard живёт до конца системного вызова, даже если мы перестали его ждать
        let guard = tokio::time::timeout_at(deadline, self.pid_lock(command.pid).lock_owned())
            .await
            .map_err(|_| self.timed_out(command, "waiting for a previous command"))?;
        let backend = self.backend.clone();
        let protection = self.protection.clone();
        let known = self
            .known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(command.pid);

        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            run_command(backend.as_ref(), &protection, command, known)
        });

        let result = match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SchedError::Io(std::io::Error::other(format!(
                "control task failed: {join_error}"
            )))),
            Err(_) => Err(self.timed_out(command, "in the system call")),
        };

        if !matches!(result, Err(SchedError::NoSuchProcess { .. })) {
            self.known
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remember(command.pid);
        }
        result
    }

    fn timed_out(&self, command: ControlCommand, stage: &str) -> SchedError {
        SchedError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!(
                "{:?} on pid {} did not finish within {:?} ({stage})",
                command.kind, command.pid, self.settings.op_timeout
            ),
        ))
    }

    fn record(&self, command: ControlCommand, result: &SchedResult<CommandOutcome>) {
        let outcome = match result {
            Ok(CommandOutcome::Applied) => AuditOutcome::Applied,
            Ok(CommandOutcome::NoOp) => AuditOutcome::NoOp,
            Err(e) => AuditOutcome::Failed {
                error: e.to_string(),
            },
        };
        let record = CommandRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            command,
            outcome,
        };

        let mut audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        while audit.len() >= self.settings.audit_capacity.max(1) {
            audit.pop_front();
        }
        audit.push_back(record);
    }
}

/// Выполнить команду синхронно (внутри `spawn_blocking`).
fn run_command(
    backend: &dyn ProcessBackend,
    protection: &ProtectionList,
    command: ControlCommand,
    known: bool,
) -> SchedResult<CommandOutcome> {
    let pid = command.pid;
    let terminate = command.kind == CommandKind::Terminate;

    let state: ProcessState = match backend.query(pid)? {
        Some(state) => state,
        None if terminate && known => return Ok(CommandOutcome::NoOp),
        None => return Err(SchedError::NoSuchProcess { pid }),
    };

    if command.kind.is_guarded()
        && !command.override_protection
        && protection.is_protected_name(&state.name)
    {
        return Err(SchedError::ProtectedProcess {
            pid,
            name: state.name,
        });
    }

    match command.kind {
        CommandKind::Suspend => {
            if state.stopped {
                return Ok(CommandOutcome::NoOp);
            }
            backend.send_signal(pid, ControlSignal::Stop)?;
        }
        CommandKind::Resume => {
            if !state.stopped {
                return Ok(CommandOutcome::NoOp);
            }
            backend.send_signal(pid, ControlSignal::Continue)?;
        }
        CommandKind::Terminate => {
            match backend.send_signal(pid, ControlSignal::Terminate) {
                Err(SchedError::NoSuchProcess { .. }) => return Ok(CommandOutcome::NoOp),
                other => other?,
            }
            // остановленный процесс обработает SIGTERM только после SIGCONT
            if state.stopped {
                match backend.send_signal(pid, ControlSignal::Continue) {
                    Ok(()) | Err(SchedError::NoSuchProcess { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        CommandKind::SetPriority { nice } => {
            let nice = nice.clamp(NICE_MIN, NICE_MAX);
            if state.nice == nice {
                return Ok(CommandOutcome::NoOp);
            }
            backend.set_priority(pid, nice)?;
        }
    }

    Ok(CommandOutcome::Applied)
}
