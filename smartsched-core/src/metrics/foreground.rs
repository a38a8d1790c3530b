//! Определение процессов переднего плана.
//!
//! Сигнал «пользователь сейчас работает с этим процессом» зависит от
//! платформы, поэтому он спрятан за трейтом [`ForegroundDetector`]:
//!
//! - [`X11ForegroundDetector`] — владелец активного окна (`_NET_ACTIVE_WINDOW` + `_NET_WM_PID`);
//! - [`TerminalForegroundDetector`] — foreground-группа процессов управляющего терминала;
//! - [`StaticForegroundDetector`] — фиксированный набор PID (тесты, симуляции);
//! - [`CompositeForegroundDetector`] — объединение нескольких детекторов.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{Atom, AtomEnum, ConnectionExt, Window};
use x11rb::rust_connection::RustConnection;

use crate::metrics::process::RawProcess;

/// Общий интерфейс детекторов переднего плана.
pub trait ForegroundDetector: Send + Sync {
    /// Короткое имя бекенда для логов.
    fn name(&self) -> &'static str;

    /// Вернуть PID процессов переднего плана среди перечисленных.
    fn foreground_pids(&self, processes: &[RawProcess]) -> Result<HashSet<i32>>;
}

/// Foreground-группа управляющего терминала.
///
/// Процесс считается активным, если у него есть терминал и его группа
/// процессов совпадает с `tpgid` терминала (то, что сейчас получает ввод).
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalForegroundDetector;

impl ForegroundDetector for TerminalForegroundDetector {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn foreground_pids(&self, processes: &[RawProcess]) -> Result<HashSet<i32>> {
        Ok(processes
            .iter()
            .filter(|p| p.tty_nr != 0 && p.tpgid > 0 && p.pgrp == p.tpgid)
            .map(|p| p.pid)
            .collect())
    }
}

/// Владелец активного окна X11 через EWMH.
pub struct X11ForegroundDetector {
    connection: Arc<RustConnection>,
    root: Window,
    net_active_window: Atom,
    net_wm_pid: Atom,
}

impl X11ForegroundDetector {
    /// Подключиться к X-серверу из `DISPLAY`.
    pub fn new() -> Result<Self> {
        let (connection, screen_num) = x11rb::connect(None)
            .context("failed to connect to X server: is DISPLAY set?")?;
        let root = connection
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .context("X server reported no screens")?;
        let net_active_window = intern_atom(&connection, b"_NET_ACTIVE_WINDOW")?;
        let net_wm_pid = intern_atom(&connection, b"_NET_WM_PID")?;

        Ok(Self {
            connection: Arc::new(connection),
            root,
            net_active_window,
            net_wm_pid,
        })
    }

    fn active_window(&self) -> Result<Option<Window>> {
        let reply = self
            .connection
            .get_property(false, self.root, self.net_active_window, AtomEnum::WINDOW, 0, 1)
            .context("failed to request _NET_ACTIVE_WINDOW")?
            .reply()
            .context("failed to read _NET_ACTIVE_WINDOW reply")?;
        Ok(reply
            .value32()
            .and_then(|mut it| it.next())
            .filter(|w| *w != 0))
    }

    fn window_pid(&self, window: Window) -> Result<Option<i32>> {
        let reply = self
            .connection
            .get_property(false, window, self.net_wm_pid, AtomEnum::CARDINAL, 0, 1)
            .context("failed to request _NET_WM_PID")?
            .reply()
            .ok();
        Ok(reply
            .and_then(|r| r.value32().and_then(|mut it| it.next()))
            .map(|pid| pid as i32))
    }
}

fn intern_atom(connection: &RustConnection, name: &[u8]) -> Result<Atom> {
    Ok(connection
        .intern_atom(false, name)
        .with_context(|| format!("failed to intern atom {}", String::from_utf8_lossy(name)))?
        .reply()
        .with_context(|| format!("no reply for atom {}", String::from_utf8_lossy(name)))?
        .atom)
}

impl ForegroundDetector for X11ForegroundDetector {
    fn name(&self) -> &'static str {
        "x11"
    }

    fn foreground_pids(&self, _processes: &[RawProcess]) -> Result<HashSet<i32>> {
        let mut pids = HashSet::new();
        if let Some(window) = self.active_window()? {
            if let Some(pid) = self.window_pid(window)? {
                pids.insert(pid);
            }
        }
        Ok(pids)
    }
}

/// Фиксированный набор PID переднего плана.
#[derive(Debug, Default)]
pub struct StaticForegroundDetector {
    pids: Mutex<HashSet<i32>>,
}

impl StaticForegroundDetector {
    pub fn new(pids: impl IntoIterator<Item = i32>) -> Self {
        Self {
            pids: Mutex::new(pids.into_iter().collect()),
        }
    }

    pub fn set(&self, pids: impl IntoIterator<Item = i32>) {
        *self.pids.lock().unwrap_or_else(|e| e.into_inner()) = pids.into_iter().collect();
    }
}

impl ForegroundDetector for StaticForegroundDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    fn foreground_pids(&self, _processes: &[RawProcess]) -> Result<HashSet<i32>> {
        Ok(self.pids.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Объединение нескольких детекторов.
///
/// Ошибка одного бекенда логируется и не мешает остальным.
#[derive(Default)]
pub struct CompositeForegroundDetector {
    detectors: Vec<Box<dyn ForegroundDetector>>,
}

impl CompositeForegroundDetector {
    pub fn new(detectors: Vec<Box<dyn ForegroundDetector>>) -> Self {
        Self { detectors }
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

impl ForegroundDetector for CompositeForegroundDetector {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn foreground_pids(&self, processes: &[RawProcess]) -> Result<HashSet<i32>> {
        let mut all = HashSet::new();
        for detector in &self.detectors {
            match detector.foreground_pids(processes) {
                Ok(pids) => all.extend(pids),
                Err(e) => debug!(detector = detector.name(), error = %e, "Foreground detector failed"),
            }
        }
        Ok(all)
    }
}

/// Детектор по умолчанию для текущей машины: X11 (если доступен) + терминал.
pub fn default_detector() -> Box<dyn ForegroundDetector> {
    let mut detectors: Vec<Box<dyn ForegroundDetector>> = Vec::new();
    match X11ForegroundDetector::new() {
        Ok(x11) => detectors.push(Box::new(x11)),
        Err(e) => warn!(error = %e, "X11 unavailable, foreground detection falls back to terminals"),
    }
    detectors.push(Box::new(TerminalForegroundDetector));
    Box::new(CompositeForegroundDetector::new(detectors))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingDetector;

    impl ForegroundDetector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn foreground_pids(&self, _processes: &[RawProcess]) -> Result<HashSet<i32>> {
            anyhow::bail!("no backend")
        }
    }

    fn tty_process(pid: i32, pgrp: i32, tpgid: i32) -> RawProcess {
        let mut p = RawProcess::new(pid, "sh");
        p.tty_nr = 34816;
        p.pgrp = pgrp;
        p.tpgid = tpgid;
        p
    }

    #[test]
    fn terminal_detector_picks_foreground_group() {
        let processes = vec![
            tty_process(100, 100, 200), // shell, ждёт
            tty_process(200, 200, 200), // vim на переднем плане
            tty_process(201, 200, 200), // дочерний процесс той же группы
            RawProcess::new(300, "daemon"),
        ];
        let pids = TerminalForegroundDetector.foreground_pids(&processes).unwrap();
        assert_eq!(pids, HashSet::from([200, 201]));
    }

    #[test]
    fn composite_skips_failing_backend() {
        let composite = CompositeForegroundDetector::new(vec![
            Box::new(FailingDetector),
            Box::new(StaticForegroundDetector::new([42])),
        ]);
        let pids = composite.foreground_pids(&[]).unwrap();
        assert_eq!(pids, HashSet::from([42]));
    }

    #[test]
    fn static_detector_can_be_updated() {
        let detector = StaticForegroundDetector::new([1]);
        detector.set([2, 3]);
        assert_eq!(detector.foreground_pids(&[]).unwrap(), HashSet::from([2, 3]));
    }
}
