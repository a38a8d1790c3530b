//! Интеграция с systemd через sd-notify.
//!
//! - `READY=1` — после запуска мониторинга;
//! - `STATUS=...` — периодическая строка состояния планировщика.
//!
//! Вне systemd уведомления молча не доставляются.

use anyhow::{Context, Result};
use libsystemd::daemon::NotifyState;

/// Максимальная длина статуса, рекомендуемая systemd.
const MAX_STATUS_LEN: usize = 200;

/// Отправить `READY=1`.
///
/// Ошибку можно игнорировать, если демон запущен не под systemd.
pub fn notify_ready() -> Result<()> {
    libsystemd::daemon::notify(false, &[NotifyState::Ready])
        .context("Failed to send READY notification to systemd")?;
    Ok(())
}

/// Отправить `STATUS=...`; видно в `systemctl status smartschedd`.
pub fn notify_status(status: &str) {
    let state = NotifyState::Status(truncate_status(status).to_string());
    let _ = libsystemd::daemon::notify(false, &[state]);
}

/// Обрезать статус по границе символа.
fn truncate_status(status: &str) -> &str {
    if status.len() <= MAX_STATUS_LEN {
        return status;
    }
    let mut end = MAX_STATUS_LEN;
    while !status.is_char_boundary(end) {
        end -= 1;
    }
    &status[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_ready_no_panic() {
        // вне systemd это ошибка, но не паника
        let _ = notify_ready();
    }

    #[test]
    fn test_notify_status_no_panic() {
        notify_status("mode=gaming processes=12");
        notify_status("");
        notify_status(&"x".repeat(500));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        assert_eq!(truncate_status("short"), "short");
        assert_eq!(truncate_status(&"x".repeat(500)).len(), MAX_STATUS_LEN);

        // «ж» занимает два байта: 201 байт не делится ровно на 200
        let status = format!("x{}", "ж".repeat(100));
        let truncated = truncate_status(&status);
        assert!(truncated.len() <= MAX_STATUS_LEN);
        assert!(status.starts_with(truncated));
    }
}
