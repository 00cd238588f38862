/// Structured log records emitted at the end of a query logging session.
///
/// Every record carries a `logtype` discriminator, the owning logger's name as
/// `class_name`, analysis-specific fields, and the caller's extra fields
/// merged last.
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogType {
    #[serde(rename = "querylog__duplicate")]
    Duplicate,
    #[serde(rename = "querylog__longrunning")]
    LongRunning,
    #[serde(rename = "querylog__summary")]
    Summary,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::Duplicate => "querylog__duplicate",
            LogType::LongRunning => "querylog__longrunning",
            LogType::Summary => "querylog__summary",
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
}

/// One finding or summary line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: Level,
    pub logtype: LogType,
    /// Name of the logger that produced the record.
    pub class_name: String,
    pub message: String,
    /// All structured fields, including `logtype` and `class_name`.
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// Build a record from analysis fields, then layer `extras` on top.
    /// Caller extras win on key collisions.
    pub fn new(
        level: Level,
        logtype: LogType,
        class_name: &str,
        message: String,
        fields: Map<String, Value>,
        extras: &Map<String, Value>,
    ) -> Self {
        let mut merged = fields;
        merged.insert("class_name".to_string(), Value::from(class_name));
        merged.insert("logtype".to_string(), Value::from(logtype.as_str()));
        for (k, v) in extras {
            merged.insert(k.clone(), v.clone());
        }
        Self {
            level,
            logtype,
            class_name: class_name.to_string(),
            message,
            fields: merged,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Destination for session records.
pub trait LogSink {
    fn emit(&self, record: &LogRecord);
}

/// Emits records as `tracing` events with `logtype` and `class_name` fields.
/// The merged field map is attached as a JSON `extra` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let extra = Value::Object(record.fields.clone());
        match record.level {
            Level::Warn => tracing::warn!(
                logtype = record.logtype.as_str(),
                class_name = %record.class_name,
                extra = %extra,
                "{}",
                record.message
            ),
            Level::Info => tracing::info!(
                logtype = record.logtype.as_str(),
                class_name = %record.class_name,
                extra = %extra,
                "{}",
                record.message
            ),
        }
    }
}

/// Keeps records in memory. Useful for hosts that forward findings elsewhere
/// and for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record emitted so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn of_type(&self, logtype: LogType) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.logtype == logtype)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut r) = self.records.lock() {
            r.clear();
        }
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        if let Ok(mut r) = self.records.lock() {
            r.push(record.clone());
        }
    }
}

impl<S: LogSink + ?Sized> LogSink for std::sync::Arc<S> {
    fn emit(&self, record: &LogRecord) {
        (**self).emit(record)
    }
}
