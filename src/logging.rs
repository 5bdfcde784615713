//! Diagnostic log: a bounded in-memory ring buffer, optionally mirrored to a
//! JSONL file. Every entry is also forwarded to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }

    fn emit_tracing(&self) {
        let component = self.component.as_str();
        let message = self.message.as_str();
        match (self.level, &self.context) {
            (LogLevel::Debug, None) => tracing::debug!(component, "{message}"),
            (LogLevel::Debug, Some(ctx)) => tracing::debug!(component, context = %ctx, "{message}"),
            (LogLevel::Info, None) => tracing::info!(component, "{message}"),
            (LogLevel::Info, Some(ctx)) => tracing::info!(component, context = %ctx, "{message}"),
            (LogLevel::Warn, None) => tracing::warn!(component, "{message}"),
            (LogLevel::Warn, Some(ctx)) => tracing::warn!(component, context = %ctx, "{message}"),
            (LogLevel::Error, None) => tracing::error!(component, "{message}"),
            (LogLevel::Error, Some(ctx)) => tracing::error!(component, context = %ctx, "{message}"),
        }
    }
}

pub struct Logger {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(MAX_LOG_ENTRIES)),
            capacity,
            writer: None,
        }
    }

    /// Appends to `file_path`, creating it and its parent directory if needed.
    pub fn with_file(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        let mut logger = Self::in_memory(MAX_LOG_ENTRIES);
        logger.writer = Some(BufWriter::new(file));
        Ok(logger)
    }

    pub fn log(&mut self, entry: LogEntry) {
        entry.emit_tracing();

        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Logger::in_memory(MAX_LOG_ENTRIES))))
    }

    pub fn with_file(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::with_file(file_path)?))))
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn debug(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, component, message));
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(LogEntry::new(level, component, message).with_context(context));
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

impl Default for SharedLogger {
    fn default() -> Self {
        Self::in_memory()
    }
}
