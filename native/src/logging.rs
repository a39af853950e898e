use crate::error::BridgeError;
use log::{error, info, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const SENTRY_DSN_ENV: &str = "GMIC_BRIDGE_SENTRY_DSN";
const LOG_DIR_NAME: &str = "GmicBridge";
const CRASH_LOG_NAME: &str = "crash.log";

static CRASH_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static SENTRY_GUARD: Mutex<Option<sentry::ClientInitGuard>> = Mutex::new(None);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initialize Sentry from `GMIC_BRIDGE_SENTRY_DSN`. Disabled when unset or empty.
pub fn init_sentry_from_env() -> bool {
    let dsn = std::env::var(SENTRY_DSN_ENV).ok();
    init_sentry(dsn.as_deref())
}

pub fn init_sentry(dsn: Option<&str>) -> bool {
    let dsn = match dsn {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("[SENTRY] No DSN provided - Sentry disabled");
            return false;
        }
    };

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            attach_stacktrace: true,
            send_default_pii: false,
            ..Default::default()
        },
    ));

    if guard.is_enabled() {
        *lock(&SENTRY_GUARD) = Some(guard);
        info!("[SENTRY] Initialized");
        true
    } else {
        info!("[SENTRY] Failed to initialize");
        false
    }
}

pub fn is_sentry_enabled() -> bool {
    lock(&SENTRY_GUARD)
        .as_ref()
        .is_some_and(|guard| guard.is_enabled())
}

/// Flush pending events and end the Sentry session.
pub fn shutdown_sentry() {
    if let Some(guard) = lock(&SENTRY_GUARD).take() {
        info!("[SENTRY] Shutting down");
        drop(guard);
    }
}

/// Report an error that ended a filter run.
pub fn capture_critical_error(context: &str, error: &str) {
    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("error_type", "critical");
                scope.set_tag("context", context);
                scope.set_level(Some(sentry::Level::Fatal));
            },
            || {
                sentry::capture_message(
                    &format!("[CRITICAL] {}: {}", context, error),
                    sentry::Level::Fatal,
                );
            },
        );
    }
}

/// Initialize env_logger. Defaults to `Warn` unless `RUST_LOG` is set.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

/// `<local data dir>/GmicBridge/crash.log`.
pub fn crash_log_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(LOG_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CRASH_LOG_NAME)
}

/// Install a panic hook that appends reports to the crash log.
pub fn init_crash_logger() {
    let log_path = crash_log_path();
    if let Some(dir) = log_path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    *lock(&CRASH_LOG_PATH) = Some(log_path.clone());

    std::panic::set_hook(Box::new(move |panic_info| {
        let crash_msg = format_panic_message(panic_info);

        if is_sentry_enabled() {
            sentry::capture_message(&crash_msg, sentry::Level::Fatal);
        }

        if let Err(e) = write_crash_log(&crash_msg) {
            error!("[CRASH LOGGER] Failed to write crash log: {}", e);
        }

        error!("\n{}", crash_msg);
    }));

    info!("[CRASH LOGGER] Initialized - Log: {:?}", log_path);
}

fn format_panic_message(panic_info: &std::panic::PanicHookInfo) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    };

    let location = panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "Unknown location".to_string());

    format!(
        r#"
===== PANIC =====
Timestamp: {}
Location: {}
Message: {}
Thread: {:?}

Backtrace:
{:?}

"#,
        timestamp,
        location,
        payload,
        std::thread::current().name().unwrap_or("unnamed"),
        std::backtrace::Backtrace::capture()
    )
}

fn write_crash_log(message: &str) -> std::io::Result<()> {
    if let Some(ref log_path) = *lock(&CRASH_LOG_PATH) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        writeln!(file, "{}", message)?;
    }
    Ok(())
}

fn critical_report(context: &str, error: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    format!(
        r#"
===== CRITICAL ERROR =====
Timestamp: {}
Context: {}
Error: {}
Thread: {:?}

"#,
        timestamp,
        context,
        error,
        std::thread::current().name().unwrap_or("unnamed")
    )
}

/// Log a critical error to the crash log and Sentry without panicking.
pub fn log_critical_error(context: &str, error: &str) {
    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("context", context);
                scope.set_level(Some(sentry::Level::Error));
            },
            || {
                sentry::capture_message(error, sentry::Level::Error);
            },
        );
    }

    write_critical_report(context, error);
}

fn write_critical_report(context: &str, error: &str) {
    let message = critical_report(context, error);
    if let Err(e) = write_crash_log(&message) {
        error!("[CRASH LOGGER] Failed to write critical error: {}", e);
    }
    error!("{}", message);
}

/// Bridge failures worth a crash report. A closed filter UI or a failing filter is not one.
fn is_critical_session_error(error: &BridgeError) -> bool {
    matches!(
        error,
        BridgeError::ProtocolViolation(_) | BridgeError::ResourceFailure { .. }
    )
}

/// Record a failed filter run. Critical failures reach Sentry exactly once, as fatal.
pub fn report_session_error(error: &BridgeError) {
    if !is_critical_session_error(error) {
        error!("[SESSION] {}", error);
        return;
    }

    let message = error.to_string();
    capture_critical_error("filter session", &message);
    write_critical_report("filter session", &message);
}

pub fn get_crash_log_path() -> Option<String> {
    lock(&CRASH_LOG_PATH)
        .as_ref()
        .map(|p| p.to_string_lossy().to_string())
}

pub fn clear_crash_log() -> std::io::Result<()> {
    if let Some(ref log_path) = *lock(&CRASH_LOG_PATH) {
        if log_path.exists() {
            fs::remove_file(log_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_log_lives_in_the_bridge_directory() {
        let path = crash_log_path();
        assert!(path.ends_with("GmicBridge/crash.log"));
    }

    #[test]
    fn critical_report_names_context_and_error() {
        let report = critical_report("filter session", "pipe closed");
        assert!(report.contains("Context: filter session"));
        assert!(report.contains("Error: pipe closed"));
    }

    #[test]
    fn only_bridge_failures_are_critical() {
        assert!(is_critical_session_error(&BridgeError::ProtocolViolation(
            "bad frame".to_string()
        )));
        assert!(is_critical_session_error(&BridgeError::resource(
            "Creating pipe",
            std::io::Error::new(std::io::ErrorKind::Other, "busy"),
        )));
        assert!(!is_critical_session_error(
            &BridgeError::ExternalProcessFailure { code: Some(1) }
        ));
        assert!(!is_critical_session_error(&BridgeError::StateViolation(
            "session already started"
        )));
    }

    #[test]
    fn empty_dsn_disables_sentry() {
        assert!(!init_sentry(Some("")));
        assert!(!init_sentry(None));
    }
}
