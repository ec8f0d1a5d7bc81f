//! Process-wide panic reporting.
//!
//! Prober panics are caught per probe by the scheduler; this hook only makes
//! sure every panic also lands in the log. Release builds abort on panic and
//! the non-blocking log writer dies with the process, so there the record is
//! appended straight to today's log file as well.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::thread;

use chrono::{DateTime, Local, Utc};

use crate::logging::daily_log_file;

/// What is known about one panic.
#[derive(Debug)]
pub struct PanicRecord {
    pub at: DateTime<Local>,
    pub thread: String,
    pub location: String,
    pub message: String,
    pub backtrace: Option<String>,
}

impl PanicRecord {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        Self {
            at: Local::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: payload_message(info.payload()),
            backtrace: (backtrace.status() == BacktraceStatus::Captured)
                .then(|| backtrace.to_string()),
        }
    }

    fn append_to(&self, path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{self}")?;
        file.flush()
    }
}

impl fmt::Display for PanicRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} PANIC thread={} location={} message={}",
            self.at.format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
            self.thread,
            self.location,
            self.message
        )?;
        if let Some(bt) = &self.backtrace {
            write!(f, "\nBacktrace:\n{bt}")?;
        }
        Ok(())
    }
}

/// Install the hook. The previously installed hook still runs afterwards.
pub fn install(log_dir: impl Into<PathBuf>) {
    let log_dir = log_dir.into();
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::capture(info);
            tracing::error!(
                target: "camwatch::panic",
                thread = %record.thread,
                location = %record.location,
                "{}",
                record.message
            );
            if cfg!(panic = "abort") {
                let _ = record.append_to(&daily_log_file(&log_dir, Utc::now().date_naive()));
            }
        }));
        previous(info);
    }));
}

/// Text of a panic payload, from the hook or from a caught unwind.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PanicRecord {
        PanicRecord {
            at: Local::now(),
            thread: "probe-worker".to_string(),
            location: "src/probe/pull_stream.rs:10:5".to_string(),
            message: "index out of bounds".to_string(),
            backtrace: None,
        }
    }

    #[test]
    fn test_payload_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(payload_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(payload_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(payload_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_record_display() {
        let text = record().to_string();
        assert!(text.contains("PANIC thread=probe-worker"));
        assert!(text.ends_with("message=index out of bounds"));
        assert!(!text.contains("Backtrace"));
    }

    #[test]
    fn test_append_to_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = daily_log_file(dir.path(), Utc::now().date_naive());
        record().append_to(&path).unwrap();
        record().append_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| l.contains("PANIC")).count(), 2);
    }
}
