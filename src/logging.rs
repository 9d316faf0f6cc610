use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static LOGGER: OnceLock<Logger> = OnceLock::new();
static DEBUG: OnceLock<bool> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Installs the process logger. Later calls keep the first file.
pub fn init_log_file(path: &Path) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let _ = LOGGER.set(Logger::open(path, true)?);
    Ok(())
}

/// `DROPSHARE_DEBUG=1`, read once per process.
pub fn debug_enabled() -> bool {
    *DEBUG.get_or_init(|| std::env::var("DROPSHARE_DEBUG").ok().as_deref() == Some("1"))
}

pub fn info(msg: impl AsRef<str>) {
    emit(Level::Info, msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    emit(Level::Error, msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, kv: &[(&str, &str)]) {
    emit(Level::Info, msg, kv);
}

pub fn warn_kv(msg: &str, kv: &[(&str, &str)]) {
    emit(Level::Warn, msg, kv);
}

pub fn error_kv(msg: &str, kv: &[(&str, &str)]) {
    emit(Level::Error, msg, kv);
}

pub fn debug_kv(msg: &str, kv: &[(&str, &str)]) {
    emit(Level::Debug, msg, kv);
}

fn emit(level: Level, msg: &str, kv: &[(&str, &str)]) {
    if level == Level::Debug && !debug_enabled() {
        return;
    }
    if let Some(logger) = LOGGER.get() {
        logger.record(level, msg, kv);
    }
}

struct Logger {
    file: Mutex<File>,
    stdout: bool,
}

impl Logger {
    fn open(path: &Path, stdout: bool) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        // Each run starts a fresh file.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            stdout,
        })
    }

    fn record(&self, level: Level, msg: &str, kv: &[(&str, &str)]) {
        let now = chrono::Utc::now();
        let line = slog_line(&now.to_rfc3339_opts(SecondsFormat::Millis, true), level, msg, kv);
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
        if self.stdout {
            let console = console_line(&now.format("%H:%M:%S%.3f").to_string(), level, msg, kv);
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(console.as_bytes());
            let _ = out.flush();
        }
    }
}

/// `time=… level=… msg="…" k=v`, quoting values only where needed.
fn slog_line(ts: &str, level: Level, msg: &str, kv: &[(&str, &str)]) -> String {
    let mut line = String::with_capacity(64 + msg.len());
    let _ = write!(line, "time={ts} level={} msg=\"{}\"", level.as_str(), escape(msg));
    for (key, value) in kv {
        if needs_quoting(value) {
            let _ = write!(line, " {key}=\"{}\"", escape(value));
        } else {
            let _ = write!(line, " {key}={value}");
        }
    }
    line.push('\n');
    line
}

fn console_line(clock: &str, level: Level, msg: &str, kv: &[(&str, &str)]) -> String {
    let mut line = format!("{clock} {:<5} {msg}", level.as_str());
    for (key, value) in kv {
        let _ = write!(line, " {key}={value}");
    }
    line.push('\n');
    line
}

fn needs_quoting(v: &str) -> bool {
    v.is_empty() || v.chars().any(|c| c.is_whitespace() || c == '"' || c == '=')
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
