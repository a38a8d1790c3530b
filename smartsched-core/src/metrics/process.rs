//! Сбор сырых атрибутов процессов из /proc.
//!
//! Этот модуль только перечисляет процессы и читает их счётчики. Дельты CPU,
//! сглаживание и классификация выполняются в [`crate::monitor`].
//! Используется библиотека procfs для удобного доступа к данным процессов.

use std::sync::Mutex;

use anyhow::{Context, Result};
use procfs::process::Process;
use procfs::ProcError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Сырые атрибуты процесса на момент перечисления.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProcess {
    pub pid: i32,
    pub ppid: i32,
    /// Имя образа (comm).
    pub name: String,
    /// Текущий nice (-20..19).
    pub nice: i32,
    /// Процесс остановлен (состояние `T` или `t`).
    pub stopped: bool,
    /// Резидентная память в байтах.
    pub rss_bytes: u64,
    /// utime + stime в тиках.
    pub cpu_ticks: u64,
    /// Время старта в тиках с момента загрузки.
    pub start_time: u64,
    pub tty_nr: i32,
    pub pgrp: i32,
    /// Группа процессов, владеющая терминалом (или -1).
    pub tpgid: i32,
}

/// Источник перечисления процессов.
pub trait ProcessSource: Send + Sync {
    /// Перечислить все видимые процессы.
    ///
    /// Процессы, завершившиеся во время сканирования, должны молча пропускаться.
    fn enumerate(&self) -> Result<Vec<RawProcess>>;

    /// Частота тиков CPU-времени (обычно 100).
    fn ticks_per_second(&self) -> u64;
}

/// Реальный источник поверх `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsSource;

impl ProcfsSource {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSource for ProcfsSource {
    fn enumerate(&self) -> Result<Vec<RawProcess>> {
        let all: Vec<Process> = procfs::process::all_processes()
            .context("failed to list /proc: is procfs mounted?")?
            .filter_map(|p| p.ok())
            .collect();

        let processes = all
            .par_iter()
            .filter_map(|proc| match read_raw(proc) {
                Ok(raw) => Some(raw),
                Err(ProcError::NotFound(_)) => None,
                Err(e) => {
                    tracing::debug!(pid = proc.pid(), error = %e, "Skipping unreadable process");
                    None
                }
            })
            .collect();

        Ok(processes)
    }

    fn ticks_per_second(&self) -> u64 {
        clock_ticks()
    }
}

/// Прочитать один процесс по PID.
pub fn read_process(pid: i32) -> procfs::ProcResult<RawProcess> {
    let proc = Process::new(pid)?;
    read_raw(&proc)
}

fn read_raw(proc: &Process) -> procfs::ProcResult<RawProcess> {
    let stat = proc.stat()?;
    // у потоков ядра нет VmRSS
    let rss_kb = match proc.status() {
        Ok(status) => status.vmrss.unwrap_or(0),
        Err(ProcError::NotFound(p)) => return Err(ProcError::NotFound(p)),
        Err(_) => 0,
    };

    Ok(RawProcess {
        pid: stat.pid,
        ppid: stat.ppid,
        name: stat.comm.clone(),
        nice: stat.nice as i32,
        stopped: matches!(stat.state, 'T' | 't'),
        rss_bytes: rss_kb.saturating_mul(1024),
        cpu_ticks: stat.utime.saturating_add(stat.stime),
        start_time: stat.starttime,
        tty_nr: stat.tty_nr,
        pgrp: stat.pgrp,
        tpgid: stat.tpgid,
    })
}

/// Количество тиков в секунду (`_SC_CLK_TCK`), 100 при ошибке.
pub fn clock_ticks() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        100
    }
}

/// Источник с заданным вручную списком процессов (для тестов и симуляций).
#[derive(Debug, Default)]
pub struct StaticProcessSource {
    processes: Mutex<Vec<RawProcess>>,
    ticks_per_second: u64,
}

impl StaticProcessSource {
    pub fn new(processes: Vec<RawProcess>) -> Self {
        Self {
            processes: Mutex::new(processes),
            ticks_per_second: 100,
        }
    }

    /// Заменить список процессов, который вернёт следующее перечисление.
    pub fn set(&self, processes: Vec<RawProcess>) {
        *self.processes.lock().unwrap_or_else(|e| e.into_inner()) = processes;
    }

    /// Изменить процесс на месте, если он есть.
    pub fn update(&self, pid: i32, f: impl FnOnce(&mut RawProcess)) {
        let mut guard = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = guard.iter_mut().find(|p| p.pid == pid) {
            f(p);
        }
    }

    /// Удалить процесс из списка.
    pub fn remove(&self, pid: i32) {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.pid != pid);
    }

    /// Текущее состояние процесса.
    pub fn get(&self, pid: i32) -> Option<RawProcess> {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
    }
}

impl ProcessSource for StaticProcessSource {
    fn enumerate(&self) -> Result<Vec<RawProcess>> {
        Ok(self.processes.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }
}

impl RawProcess {
    /// Упрощённый конструктор для тестов.
    pub fn new(pid: i32, name: &str) -> Self {
        Self {
            pid,
            ppid: 1,
            name: name.to_string(),
            nice: 0,
            stopped: false,
            rss_bytes: 0,
            cpu_ticks: 0,
            start_time: pid as u64,
            tty_nr: 0,
            pgrp: pid,
            tpgid: -1,
        }
    }
}
