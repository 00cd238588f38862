use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Environment variable that turns on test mode regardless of the config file.
pub const TESTING_ENV: &str = "QUERY_LOG_TESTING";

/// Process-wide defaults for query logging sessions.
///
/// Loaded from the `[query_log]` table of `query-logger.toml`. Each field is
/// the fallback for the matching per-call override in [`crate::config::ConfigOverrides`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Connection alias to capture when none is given.
    pub connection: String,
    /// Log one warning per group of repeated statements.
    pub duplicate_queries: bool,
    /// Capture a stack trace for every recorded statement. Expensive.
    pub tracebacks: bool,
    /// Per-statement time budget in milliseconds. 0 disables the check.
    pub time_absolute_limit_ms: u64,
    /// When set, `QueryLogger::stop` hands back the session report.
    pub testing: bool,
    /// Open connections in always-capture mode.
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: "default".to_string(),
            duplicate_queries: true,
            tracebacks: false,
            time_absolute_limit_ms: 1000,
            testing: false,
            debug: false,
        }
    }
}

/// On-disk layout: settings live under `[query_log]`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    query_log: Settings,
}

static GLOBAL: OnceLock<Settings> = OnceLock::new();

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let file: SettingsFile = toml::from_str(contents)?;
        Ok(file.query_log.with_env_overrides())
    }

    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents).map_err(|e| SettingsError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or unparseable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(SettingsError::Read { .. }) => Self::default().with_env_overrides(),
            Err(e) => {
                tracing::warn!(error = %e, "falling back to default query log settings");
                Self::default().with_env_overrides()
            }
        }
    }

    /// Settings installed for this process, or the defaults.
    pub fn global() -> &'static Settings {
        GLOBAL.get_or_init(|| Settings::default().with_env_overrides())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(TESTING_ENV) {
            self.testing = matches!(value.as_str(), "1" | "true" | "yes");
        }
        self
    }
}

/// Install process-wide settings. Only the first call wins; later calls
/// return the rejected settings.
pub fn install(settings: Settings) -> Result<(), Settings> {
    GLOBAL.set(settings)
}

/// Errors from loading the settings file.
#[derive(Debug)]
pub enum SettingsError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            SettingsError::Parse { path, source } => {
                write!(f, "failed to parse {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Read { source, .. } => Some(source),
            SettingsError::Parse { source, .. } => Some(source),
        }
    }
}
