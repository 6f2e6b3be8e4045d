// src/logging.rs
//
// Bridge log output. Every line goes to stderr with a local wall-clock stamp;
// with `--log-dir` (or `log_dir` in bridge.toml) it is mirrored into a
// per-run file so unattended runs can be inspected afterwards.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Local};

/// Open log file for the current run. When `Some`, `tlog!` mirrors into it.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Stable name pointing at the newest run's file.
const LATEST_LINK: &str = "ta612c-bridge.log";

/// Wall-clock prefix used on every log line.
pub(crate) fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Per-run file name, e.g. `20261019-164501-ta612c-bridge.log`.
fn run_file_name(started: DateTime<Local>) -> String {
    started.format("%Y%m%d-%H%M%S-ta612c-bridge.log").to_string()
}

/// Start mirroring log lines into a new file under `log_dir`.
/// On Unix, `ta612c-bridge.log` is repointed at the new file.
pub(crate) fn init_file_logging(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|e| {
        format!("Failed to create log directory {}: {}", log_dir.display(), e)
    })?;

    let filename = run_file_name(Local::now());
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to open {}: {}", log_path.display(), e))?;

    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("{} [logging] Could not link {}: {}", timestamp(), LATEST_LINK, e);
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // Not tlog!: the file should start with the bridge's own first line
    eprintln!("{} [logging] Writing log to {}", timestamp(), log_path.display());
    Ok(())
}

/// Close the run's log file, if one is open.
pub(crate) fn stop_file_logging() {
    let closed = LOG_FILE
        .lock()
        .map(|mut guard| guard.take().is_some())
        .unwrap_or(false);
    if closed {
        eprintln!("{} [logging] Log file closed", timestamp());
    }
}

/// Log one line to stderr, prefixed with `HH:MM:SS.mmm`, and to the run's
/// log file when one is open.
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", $crate::logging::timestamp(), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(f) = guard.as_mut() {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_run_file_name() {
        let started = Local.with_ymd_and_hms(2026, 10, 19, 16, 45, 1).unwrap();
        assert_eq!(run_file_name(started), "20261019-164501-ta612c-bridge.log");
    }

    #[test]
    fn test_file_logging_creates_file_and_link() {
        let dir = std::env::temp_dir().join(format!("ta612c-bridge-log-{}", std::process::id()));
        init_file_logging(&dir).unwrap();
        tlog!("[test] hello from the log test");
        stop_file_logging();

        let logs: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with("-ta612c-bridge.log"))
            .collect();
        assert!(!logs.is_empty());

        let contents = std::fs::read_to_string(logs[0].path()).unwrap();
        assert!(contents.contains("[test] hello from the log test"));

        #[cfg(unix)]
        assert!(dir.join(LATEST_LINK).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
