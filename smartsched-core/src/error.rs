//! Типизированные ошибки ядра планировщика.
//!
//! Ошибки, которые возвращаются вызывающему коду (слою представления или
//! демону). Внутренние вспомогательные функции используют `anyhow`, а на
//! публичной границе всё сводится к [`SchedError`].

use thiserror::Error;

/// Ошибки операций планировщика и контроллера процессов.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SchedError {
    /// ОС отказала в изменяющем вызове.
    #[error("permission denied: cannot {op} pid {pid}")]
    PermissionDenied { pid: i32, op: &'static str },

    /// Процесс исчез до применения действия.
    #[error("no such process: pid {pid}")]
    NoSuchProcess { pid: i32 },

    /// Изменяющее действие над защищённым процессом без явного override.
    #[error("refusing to touch protected process {name} (pid {pid}) without override")]
    ProtectedProcess { pid: i32, name: String },

    /// Значение режима/алгоритма/параметра вне допустимых границ.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Системные счётчики не читаются.
    #[error("system metrics unavailable: {0}")]
    MetricsUnavailable(String),

    /// Прочая ошибка ОС, не попадающая в категории выше.
    #[error("os error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedError {
    /// Можно ли пропустить процесс и продолжить цикл планирования.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SchedError::PermissionDenied { .. } | SchedError::NoSuchProcess { .. } | SchedError::Io(_)
        )
    }

    /// Сопоставить errno системного вызова с таксономией ошибок.
    pub fn from_errno(errno: nix::errno::Errno, pid: i32, op: &'static str) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EPERM | Errno::EACCES => SchedError::PermissionDenied { pid, op },
            Errno::ESRCH => SchedError::NoSuchProcess { pid },
            other => SchedError::Io(std::io::Error::from_raw_os_error(other as i32)),
        }
    }
}

pub type SchedResult<T> = std::result::Result<T, SchedError>;
