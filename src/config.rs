use crate::settings::Settings;
use serde::Serialize;
use serde_json::{Map, Value};

/// Per-call overrides for a query logging session.
///
/// Every `None` falls back to the process-wide [`Settings`].
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub connection_name: Option<String>,
    pub log_duplicates: Option<bool>,
    pub log_tracebacks: Option<bool>,
    pub long_running_threshold_ms: Option<u64>,
    /// Extra fields merged into every emitted log record.
    pub extra_fields: Map<String, Value>,
}

impl ConfigOverrides {
    pub fn connection(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn duplicates(mut self, enabled: bool) -> Self {
        self.log_duplicates = Some(enabled);
        self
    }

    pub fn tracebacks(mut self, enabled: bool) -> Self {
        self.log_tracebacks = Some(enabled);
        self
    }

    pub fn threshold_ms(mut self, ms: u64) -> Self {
        self.long_running_threshold_ms = Some(ms);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_fields.insert(key.into(), value.into());
        self
    }
}

/// Resolved configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogConfig {
    pub connection_name: String,
    pub log_duplicates: bool,
    pub log_tracebacks: bool,
    /// 0 disables the long-running check.
    pub long_running_threshold_ms: u64,
    pub extra_fields: Map<String, Value>,
    pub testing: bool,
}

impl LogConfig {
    /// Merge explicit overrides with the process-wide defaults.
    pub fn resolve(settings: &Settings, overrides: ConfigOverrides) -> Self {
        Self {
            connection_name: overrides
                .connection_name
                .unwrap_or_else(|| settings.connection.clone()),
            log_duplicates: overrides
                .log_duplicates
                .unwrap_or(settings.duplicate_queries),
            log_tracebacks: overrides.log_tracebacks.unwrap_or(settings.tracebacks),
            long_running_threshold_ms: overrides
                .long_running_threshold_ms
                .unwrap_or(settings.time_absolute_limit_ms),
            extra_fields: overrides.extra_fields,
            testing: settings.testing,
        }
    }
}
