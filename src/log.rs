//! Logging Infrastructure
//!
//! Structured, leveled logging for the runtime. Scheduler hot paths guard
//! every call with [`would_log`] so that tracing costs a single atomic load
//! when disabled.
//!
//! # Features
//!
//! - **Log Levels**: Trace, Debug, Info, Warn, Error
//! - **Structured Logging**: key-value pairs via [`LogBuilder`]
//! - **Output Formats**: plain text and JSON lines
//! - **Thread-Aware**: entries carry the worker thread's name
//!
//! # Example
//!
//! ```rust,ignore
//! use boc_runtime::log::{self, LogBuilder, LogLevel};
//!
//! log::info("scheduler started");
//!
//! LogBuilder::new(LogLevel::Debug)
//!     .message("work stolen")
//!     .field_uint("victim", 3)
//!     .field_uint("core", 0)
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Get the level from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Warn
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogFormat {
    /// Plain text format (human readable).
    Plain = 0,
    /// JSON format (machine readable).
    Json = 1,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Plain
    }
}

/// A value in a structured log entry.
#[derive(Debug, Clone)]
pub enum LogValue {
    /// String value.
    String(String),
    /// Signed integer value.
    Int(i64),
    /// Unsigned integer value.
    UInt(u64),
    /// Boolean value.
    Bool(bool),
    /// Pointer value, rendered in hex.
    Ptr(usize),
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::String(s) => write!(f, "{}", s),
            LogValue::Int(i) => write!(f, "{}", i),
            LogValue::UInt(u) => write!(f, "{}", u),
            LogValue::Bool(b) => write!(f, "{}", b),
            LogValue::Ptr(p) => write!(f, "{:#x}", p),
        }
    }
}

impl LogValue {
    fn to_json(&self) -> String {
        match self {
            LogValue::String(s) => format!("\"{}\"", escape_json(s)),
            LogValue::Int(i) => i.to_string(),
            LogValue::UInt(u) => u.to_string(),
            LogValue::Bool(b) => b.to_string(),
            LogValue::Ptr(p) => format!("\"{:#x}\"", p),
        }
    }
}

/// A log entry: level, message, structured fields.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured fields.
    pub fields: Vec<(String, LogValue)>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Thread name (if available).
    pub thread_name: Option<String>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            thread_name: std::thread::current().name().map(|s| s.to_string()),
        }
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "[{}.{:03}] {:<5} ",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str()
        ));
        if let Some(thread) = &self.thread_name {
            out.push_str(&format!("({}) ", thread));
        }
        out.push_str(&self.message);
        if !self.fields.is_empty() {
            out.push_str(" {");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format!("{}={}", key, value));
            }
            out.push('}');
        }
        out
    }

    /// Format as a JSON line.
    pub fn format_json(&self) -> String {
        let mut out = String::from("{");
        out.push_str(&format!("\"timestamp\":{}", self.timestamp));
        out.push_str(&format!(",\"level\":\"{}\"", self.level.as_str()));
        if let Some(thread) = &self.thread_name {
            out.push_str(&format!(",\"thread\":\"{}\"", escape_json(thread)));
        }
        out.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));
        if !self.fields.is_empty() {
            out.push_str(",\"fields\":{");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("\"{}\":{}", escape_json(key), value.to_json()));
            }
            out.push('}');
        }
        out.push('}');
        out
    }

    /// Format according to the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Minimum log level, atomic for cheap filtering on hot paths.
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

/// Output format, protected by the sink lock.
static SINK: OnceLock<Mutex<LogFormat>> = OnceLock::new();

fn sink() -> &'static Mutex<LogFormat> {
    SINK.get_or_init(|| Mutex::new(LogFormat::Plain))
}

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed)).unwrap_or(LogLevel::Warn)
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    if let Ok(mut sink) = sink().lock() {
        *sink = format;
    }
}

/// Check if a log at `level` would be emitted.
#[inline]
pub fn would_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
}

/// Emit a log entry.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }
    let format = match sink().lock() {
        Ok(f) => *f,
        Err(_) => return,
    };
    let _ = writeln!(std::io::stderr(), "{}", entry.format(format));
}

/// Log a message at trace level.
pub fn trace(message: &str) {
    if would_log(LogLevel::Trace) {
        emit(&LogEntry::new(LogLevel::Trace, message));
    }
}

/// Log a message at debug level.
pub fn debug(message: &str) {
    if would_log(LogLevel::Debug) {
        emit(&LogEntry::new(LogLevel::Debug, message));
    }
}

/// Log a message at info level.
pub fn info(message: &str) {
    if would_log(LogLevel::Info) {
        emit(&LogEntry::new(LogLevel::Info, message));
    }
}

/// Log a message at warn level.
pub fn warn(message: &str) {
    if would_log(LogLevel::Warn) {
        emit(&LogEntry::new(LogLevel::Warn, message));
    }
}

/// Log a message at error level.
pub fn error(message: &str) {
    if would_log(LogLevel::Error) {
        emit(&LogEntry::new(LogLevel::Error, message));
    }
}

/// Builder for structured log entries.
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Create a new log builder at the given level.
    pub fn new(level: LogLevel) -> Self {
        Self {
            entry: LogEntry::new(level, ""),
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.entry.message = msg.into();
        self
    }

    /// Add a string field.
    pub fn field_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry
            .fields
            .push((key.into(), LogValue::String(value.into())));
        self
    }

    /// Add an unsigned integer field.
    pub fn field_uint(mut self, key: impl Into<String>, value: u64) -> Self {
        self.entry.fields.push((key.into(), LogValue::UInt(value)));
        self
    }

    /// Add a pointer field.
    pub fn field_ptr(mut self, key: impl Into<String>, value: usize) -> Self {
        self.entry.fields.push((key.into(), LogValue::Ptr(value)));
        self
    }

    /// Emit the entry.
    pub fn emit(self) {
        emit(&self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn test_level_roundtrip() {
        for v in 0..=5u8 {
            let level = LogLevel::from_u8(v).unwrap();
            assert_eq!(level as u8, v);
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
    }

    #[test]
    fn test_plain_format() {
        let mut entry = LogEntry::new(LogLevel::Info, "work stolen");
        entry.fields.push(("victim".into(), LogValue::UInt(3)));
        let line = entry.format_plain();
        assert!(line.contains("INFO"));
        assert!(line.contains("work stolen"));
        assert!(line.contains("victim=3"));
    }

    #[test]
    fn test_json_format_escapes() {
        let mut entry = LogEntry::new(LogLevel::Error, "bad \"value\"");
        entry.fields.push(("flag".into(), LogValue::Bool(true)));
        let line = entry.format_json();
        assert!(line.contains("\\\"value\\\""));
        assert!(line.contains("\"flag\":true"));
    }
}
