//! Query instrumentation for SQLite sessions.
//!
//! Bracket a region of code with [`QueryLogger::start`] and
//! [`QueryLogger::stop`]: every statement run through the named
//! [`DebugConnection`] in between is captured, repeated statements are
//! reported, statements over the time budget are flagged, and a summary is
//! logged.
//!
//! ```no_run
//! use query_logger::{ConfigOverrides, Connections, DebugConnection, QueryLogger};
//!
//! let mut conns = Connections::new();
//! conns.insert("default", DebugConnection::open_in_memory(false)?);
//!
//! let mut logger = QueryLogger::new("ReportJob");
//! logger.start(&conns, ConfigOverrides::default().threshold_ms(250));
//! // ... run queries through conns.get("default") ...
//! logger.stop(&conns);
//! # Ok::<(), query_logger::DbError>(())
//! ```

pub mod analysis;
pub mod config;
pub mod db;
pub mod logger;
pub mod normalize;
pub mod settings;
pub mod sink;
pub mod traceback;

pub use analysis::QueryInfo;
pub use config::{ConfigOverrides, LogConfig};
pub use db::{Connections, DbError, DebugConnection, RawQuery};
pub use logger::{QueryLogger, SessionReport};
pub use settings::Settings;
pub use sink::{LogRecord, LogSink, LogType, MemorySink, TracingSink};
