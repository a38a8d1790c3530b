//! Защищённые и системно-критичные процессы.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::monitor::ProcessRecord;

/// Имена процессов, критичных для стабильности системы.
///
/// Вызывающий код должен предупредить пользователя перед приостановкой или
/// завершением такого процесса; контроллер без явного override откажет сам.
pub const PROTECTED_PROCESS_NAMES: [&str; 7] =
    ["systemd", "init", "kthreadd", "Xorg", "gdm", "sddm", "sshd"];

static DEFAULT_PROTECTED: Lazy<HashSet<String>> = Lazy::new(|| {
    PROTECTED_PROCESS_NAMES
        .iter()
        .map(|s| s.to_string())
        .collect()
});

/// PID потока ядра kthreadd: его дети — потоки ядра.
const KTHREADD_PID: i32 = 2;

/// Набор защищённых имён и правила «системно-критичного» процесса.
#[derive(Debug, Clone)]
pub struct ProtectionList {
    names: HashSet<String>,
    self_pid: i32,
}

impl Default for ProtectionList {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl ProtectionList {
    /// Базовый набор плюс дополнительные имена из конфигурации.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names = DEFAULT_PROTECTED.clone();
        names.extend(extra.into_iter().map(Into::into));
        Self {
            names,
            self_pid: std::process::id() as i32,
        }
    }

    /// Подменить «свой» PID (для симуляций).
    pub fn with_self_pid(mut self, pid: i32) -> Self {
        self.self_pid = pid;
        self
    }

    /// Имя входит в защищённый набор.
    pub fn is_protected_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Процесс нельзя трогать автоматически: защищённое имя, init/kthreadd,
    /// поток ядра или сам планировщик.
    pub fn is_os_critical(&self, record: &ProcessRecord) -> bool {
        record.pid <= KTHREADD_PID
            || record.ppid == KTHREADD_PID
            || record.pid == self.self_pid
            || self.is_protected_name(&record.name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ProcessStatus;
    use crate::policy::classes::Classification;

    fn record(pid: i32, ppid: i32, name: &str) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid,
            name: name.to_string(),
            priority: 0,
            status: ProcessStatus::Running,
            memory_usage_bytes: 0,
            cpu_usage_percent: 0.0,
            cpu_time_ticks: 0,
            first_seen: 0,
            classification: Classification::IoBound,
        }
    }

    #[test]
    fn base_names_are_protected() {
        let list = ProtectionList::default();
        for name in PROTECTED_PROCESS_NAMES {
            assert!(list.is_protected_name(name));
        }
        assert!(!list.is_protected_name("firefox"));
        // регистр имеет значение, как и в /proc/<pid>/comm
        assert!(!list.is_protected_name("SYSTEMD"));
    }

    #[test]
    fn extra_names_extend_the_set() {
        let list = ProtectionList::new(["pipewire"]);
        assert!(list.is_protected_name("pipewire"));
        assert!(list.is_protected_name("sshd"));
    }

    #[test]
    fn kernel_threads_and_self_are_critical() {
        let list = ProtectionList::default().with_self_pid(4242);
        assert!(list.is_os_critical(&record(1, 0, "whatever")));
        assert!(list.is_os_critical(&record(77, 2, "kworker/0:1")));
        assert!(list.is_os_critical(&record(4242, 1, "smartschedd")));
        assert!(list.is_os_critical(&record(900, 1, "Xorg")));
        assert!(!list.is_os_critical(&record(5000, 1, "firefox")));
    }
}
