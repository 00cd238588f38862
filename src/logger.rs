/// Query logging sessions.
///
/// A [`QueryLogger`] brackets a region of code: `start` forces the named
/// connection into capture mode, `stop` drains the statements captured since
/// then, logs duplicates, slow statements, and a summary, and restores the
/// connection. Sessions are not re-entrant: starting again while active
/// discards the previous window.
use crate::analysis::{self, QueryInfo};
use crate::config::{ConfigOverrides, LogConfig};
use crate::db::Connections;
use crate::settings::Settings;
use crate::sink::{Level, LogRecord, LogSink, LogType, TracingSink};
use crate::traceback;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

/// What a finished session found. Only handed back in test mode.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub started_at: DateTime<Utc>,
    pub queries: Vec<QueryInfo>,
    pub duplicates: usize,
    #[serde(with = "secs_f64")]
    pub total_elapsed: Duration,
}

/// Capture window of an active session.
#[derive(Debug)]
struct ActiveSession {
    config: LogConfig,
    started_at: DateTime<Utc>,
    start: Instant,
    query_count_at_start: usize,
}

pub struct QueryLogger {
    class_name: String,
    settings: Settings,
    sink: Box<dyn LogSink>,
    session: Option<ActiveSession>,
}

impl QueryLogger {
    /// Logger named `class_name` using the process-wide settings and `tracing`.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            settings: Settings::global().clone(),
            sink: Box::new(TracingSink),
            session: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Begin capturing on the configured connection.
    ///
    /// An unknown connection leaves the logger idle, discarding any session
    /// that was active.
    pub fn start(&mut self, connections: &Connections, overrides: ConfigOverrides) {
        let config = LogConfig::resolve(&self.settings, overrides);

        let conn = connections.get(&config.connection_name);

        if let Some(previous) = self.session.take() {
            tracing::debug!(class_name = %self.class_name, "discarding active query logging session");
            if conn.is_none() || previous.config.connection_name != config.connection_name {
                connections.disable_capture(&previous.config.connection_name);
            }
            if previous.config.log_tracebacks && (conn.is_none() || !config.log_tracebacks) {
                traceback::unpatch_cursor();
            }
        }

        let Some(conn) = conn else {
            tracing::debug!(
                connection = %config.connection_name,
                "query logging not started: unknown connection"
            );
            return;
        };

        connections.enable_capture(&config.connection_name);
        if config.log_tracebacks {
            traceback::patch_cursor();
        }

        self.session = Some(ActiveSession {
            query_count_at_start: conn.queries_len(),
            started_at: Utc::now(),
            start: Instant::now(),
            config,
        });
    }

    /// End the session, log findings, and restore the connection.
    ///
    /// Returns `None` when no session is active, when the connection has
    /// since disappeared, or outside test mode.
    pub fn stop(&mut self, connections: &Connections) -> Option<SessionReport> {
        let session = self.session.take()?;
        let config = &session.config;
        let Some(conn) = connections.get(&config.connection_name) else {
            if config.log_tracebacks {
                traceback::unpatch_cursor();
            }
            return None;
        };

        let total_elapsed = session.start.elapsed();
        let infos = analysis::get_query_infos(&conn.queries_since(session.query_count_at_start));

        let duplicates = self.check_duplicates(&infos, config);
        self.check_absolute_limit(&infos, config);
        self.output_stats(&infos, duplicates, total_elapsed, config);

        connections.disable_capture(&config.connection_name);
        if config.log_tracebacks {
            traceback::unpatch_cursor();
        }

        if config.testing {
            Some(SessionReport {
                started_at: session.started_at,
                queries: infos,
                duplicates,
                total_elapsed,
            })
        } else {
            None
        }
    }

    /// Run `f` inside a session.
    pub fn observe<R>(
        &mut self,
        connections: &Connections,
        overrides: ConfigOverrides,
        f: impl FnOnce() -> R,
    ) -> (R, Option<SessionReport>) {
        self.start(connections, overrides);
        let out = f();
        let report = self.stop(connections);
        (out, report)
    }

    /// Log each group of repeated statements and return the duplicate total.
    fn check_duplicates(&self, infos: &[QueryInfo], config: &LogConfig) -> usize {
        let dups = analysis::duplicate_groups(infos);
        let total = analysis::duplicate_total(&dups);

        if !config.log_duplicates {
            return total;
        }

        let groups = analysis::group_queries(infos);
        for (sql, num) in &dups {
            let mut fields = Map::new();
            if config.log_tracebacks {
                let first_trace = groups
                    .get(sql.as_str())
                    .and_then(|g| g.first())
                    .and_then(|qi| qi.trace.as_deref());
                if let Some(frames) = first_trace {
                    fields.insert(
                        "traceback".to_string(),
                        Value::from(traceback::format_list(frames)),
                    );
                }
            }
            fields.insert("num".to_string(), json!(num));
            fields.insert("sql".to_string(), json!(sql));

            self.emit(
                Level::Warn,
                LogType::Duplicate,
                format!("[SQL] repeated query ({num}x): {sql}"),
                fields,
                config,
            );
        }
        total
    }

    fn check_absolute_limit(&self, infos: &[QueryInfo], config: &LogConfig) {
        let limit_ms = config.long_running_threshold_ms as f64;
        for qi in analysis::long_running(infos, config.long_running_threshold_ms) {
            let time_ms = qi.elapsed_secs * 1000.0;
            let mut fields = Map::new();
            fields.insert("time".to_string(), json!(time_ms));
            fields.insert("limit".to_string(), json!(limit_ms));
            fields.insert("sql".to_string(), json!(qi.sql));

            self.emit(
                Level::Warn,
                LogType::LongRunning,
                format!(
                    "[SQL] query execution of {} ms over absolute limit of {} ms: {}",
                    time_ms as u64, limit_ms as u64, qi.sql
                ),
                fields,
                config,
            );
        }
    }

    fn output_stats(
        &self,
        infos: &[QueryInfo],
        duplicates: usize,
        total_elapsed: Duration,
        config: &LogConfig,
    ) {
        let sql_time = analysis::sql_time(infos);
        let total_time = total_elapsed.as_secs_f64();

        let mut fields = Map::new();
        fields.insert("num".to_string(), json!(duplicates));
        fields.insert("sqltime".to_string(), json!(sql_time));
        fields.insert("totaltime".to_string(), json!(total_time));

        self.emit(
            Level::Info,
            LogType::Summary,
            format!(
                "[SQL] {} queries ({} duplicates), {} ms SQL time, {} ms total processing time",
                infos.len(),
                duplicates,
                (sql_time * 1000.0) as u64,
                (total_time * 1000.0) as u64
            ),
            fields,
            config,
        );
    }

    fn emit(
        &self,
        level: Level,
        logtype: LogType,
        message: String,
        fields: Map<String, Value>,
        config: &LogConfig,
    ) {
        let record = LogRecord::new(
            level,
            logtype,
            &self.class_name,
            message,
            fields,
            &config.extra_fields,
        );
        self.sink.emit(&record);
    }
}

impl std::fmt::Debug for QueryLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLogger")
            .field("class_name", &self.class_name)
            .field("settings", &self.settings)
            .field("session", &self.session)
            .finish()
    }
}

mod secs_f64 {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DebugConnection;
    use crate::sink::MemorySink;
    use serial_test::serial;
    use std::sync::Arc;

    fn testing_settings() -> Settings {
        Settings {
            testing: true,
            ..Default::default()
        }
    }

    /// A registry with a `default` connection holding one author and two books.
    fn library(debug: bool) -> Connections {
        let conn = DebugConnection::open_in_memory(debug).unwrap();
        conn.inner()
            .execute_batch(
                "CREATE TABLE author (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 CREATE TABLE publisher (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 CREATE TABLE book (
                     id INTEGER PRIMARY KEY,
                     title TEXT NOT NULL,
                     author_id INTEGER REFERENCES author(id),
                     publisher_id INTEGER REFERENCES publisher(id)
                 );
                 INSERT INTO author (id, name) VALUES (1, 'John Doe');
                 INSERT INTO publisher (id, name) VALUES (1, 'Book Club');
                 INSERT INTO book (title, author_id, publisher_id) VALUES ('Book1', 1, 1), ('Book1', 1, 1);",
            )
            .unwrap();
        let mut conns = Connections::new();
        conns.insert("default", conn);
        conns
    }

    fn author_by_id(conns: &Connections, id: i64) -> Vec<String> {
        conns
            .get("default")
            .unwrap()
            .query_rows("SELECT name FROM author WHERE id = ?1", &[&id], |row| {
                row.get(0)
            })
            .unwrap()
    }

    fn all_books(conns: &Connections) -> Vec<String> {
        conns
            .get("default")
            .unwrap()
            .query_rows("SELECT title FROM book", &[], |row| row.get(0))
            .unwrap()
    }

    fn all_authors(conns: &Connections) -> Vec<String> {
        conns
            .get("default")
            .unwrap()
            .query_rows("SELECT name FROM author", &[], |row| row.get(0))
            .unwrap()
    }

    fn logger_with_sink() -> (QueryLogger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = QueryLogger::new("LibraryTest")
            .with_settings(testing_settings())
            .with_sink(Arc::clone(&sink));
        (logger, sink)
    }

    fn duplicates_detected(debug: bool) {
        let conns = library(debug);
        let (mut logger, _sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default());
        author_by_id(&conns, 1);
        all_books(&conns);
        all_books(&conns);
        let report = logger.stop(&conns).unwrap();
        assert_eq!(report.queries.len(), 3);
        assert_eq!(report.duplicates, 1);
        assert!(report.total_elapsed > Duration::ZERO);

        logger.start(&conns, ConfigOverrides::default());
        all_books(&conns);
        all_authors(&conns);
        let report = logger.stop(&conns).unwrap();
        assert_eq!(report.queries.len(), 2);
        assert_eq!(report.duplicates, 0);
        assert!(report.total_elapsed > Duration::ZERO);
    }

    #[test]
    fn test_duplicate_queries_detected() {
        duplicates_detected(true);
    }

    #[test]
    fn test_duplicate_queries_detected_with_debug_off() {
        duplicates_detected(false);
    }

    #[test]
    fn test_only_queries_inside_window_counted() {
        let conns = library(true);
        let (mut logger, _sink) = logger_with_sink();

        all_books(&conns);
        logger.start(&conns, ConfigOverrides::default());
        all_authors(&conns);
        let report = logger.stop(&conns).unwrap();
        all_books(&conns);

        assert_eq!(report.queries.len(), 1);
        assert_eq!(report.queries[0].sql, "SELECT name FROM author");
    }

    #[test]
    fn test_ids_normalized_into_duplicates() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default());
        author_by_id(&conns, 1);
        author_by_id(&conns, 2);
        author_by_id(&conns, 3);
        let report = logger.stop(&conns).unwrap();

        assert_eq!(report.duplicates, 2);
        let dups = sink.of_type(LogType::Duplicate);
        assert_eq!(dups.len(), 1);
        assert_eq!(
            dups[0].message,
            "[SQL] repeated query (3x): SELECT name FROM author WHERE id = ?"
        );
        assert_eq!(dups[0].field("num"), Some(&json!(3)));
        assert_eq!(dups[0].field("class_name"), Some(&json!("LibraryTest")));
        assert!(dups[0].field("traceback").is_none());
    }

    #[test]
    fn test_duplicate_logging_disabled_still_counts() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default().duplicates(false));
        all_books(&conns);
        all_books(&conns);
        let report = logger.stop(&conns).unwrap();

        assert_eq!(report.duplicates, 1);
        assert!(sink.of_type(LogType::Duplicate).is_empty());
        assert_eq!(sink.of_type(LogType::Summary).len(), 1);
    }

    #[test]
    fn test_summary_record() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        logger.start(
            &conns,
            ConfigOverrides::default().extra("request_id", "req-42"),
        );
        all_books(&conns);
        all_books(&conns);
        all_authors(&conns);
        logger.stop(&conns);

        let summaries = sink.of_type(LogType::Summary);
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.level, Level::Info);
        assert!(s.message.starts_with("[SQL] 3 queries (1 duplicates), "));
        assert!(s.message.ends_with(" ms total processing time"));
        assert_eq!(s.field("num"), Some(&json!(1)));
        assert!(s.field("sqltime").unwrap().as_f64().unwrap() >= 0.0);
        assert!(s.field("totaltime").unwrap().as_f64().unwrap() > 0.0);
        assert_eq!(s.field("logtype"), Some(&json!("querylog__summary")));
        assert_eq!(s.field("request_id"), Some(&json!("req-42")));

        // Extras reach the duplicate record too
        let dups = sink.of_type(LogType::Duplicate);
        assert_eq!(dups[0].field("request_id"), Some(&json!("req-42")));
    }

    #[test]
    fn test_long_running_warning_emitted() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        // Every statement takes longer than a nanosecond; use the smallest
        // non-zero threshold and a slow recursive query to cross it.
        logger.start(&conns, ConfigOverrides::default().threshold_ms(1));
        conns
            .get("default")
            .unwrap()
            .query_rows(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 2000000)
                 SELECT COUNT(*) FROM c",
                &[],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        logger.stop(&conns);

        let slow = sink.of_type(LogType::LongRunning);
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].level, Level::Warn);
        assert!(slow[0].message.starts_with("[SQL] query execution of "));
        assert!(slow[0]
            .message
            .contains(" ms over absolute limit of 1 ms: WITH RECURSIVE"));
        assert_eq!(slow[0].field("limit"), Some(&json!(1.0)));
        assert!(slow[0].field("time").unwrap().as_f64().unwrap() > 1.0);
    }

    #[test]
    fn test_zero_threshold_never_warns() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default().threshold_ms(0));
        conns
            .get("default")
            .unwrap()
            .query_rows(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000)
                 SELECT COUNT(*) FROM c",
                &[],
                |row| row.get::<_, i64>(0),
            )
            .unwrap();
        logger.stop(&conns);

        assert!(sink.of_type(LogType::LongRunning).is_empty());
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        assert!(logger.stop(&conns).is_none());
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_unknown_connection_start_is_noop() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default().connection("replica"));
        assert!(!logger.is_active());
        assert!(!conns.get("default").unwrap().force_debug());
        all_books(&conns);
        assert!(logger.stop(&conns).is_none());
        assert!(sink.records().is_empty());
    }

    #[test]
    #[serial]
    fn test_unknown_connection_restart_discards_active_session() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();
        traceback::unpatch_cursor();

        logger.start(&conns, ConfigOverrides::default().tracebacks(true));
        all_books(&conns);
        logger.start(&conns, ConfigOverrides::default().connection("replica"));

        assert!(!logger.is_active());
        assert!(!conns.get("default").unwrap().force_debug());
        assert!(!traceback::is_patched());
        assert!(logger.stop(&conns).is_none());
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_connection_removed_before_stop() {
        let mut conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default());
        conns.remove("default");
        assert!(logger.stop(&conns).is_none());
        assert!(!logger.is_active());
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_capture_flag_restored_on_stop() {
        let conns = library(false);
        let (mut logger, _sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default());
        assert!(conns.get("default").unwrap().force_debug());
        logger.stop(&conns);
        assert!(!conns.get("default").unwrap().force_debug());

        // Nothing recorded once capture is off
        all_books(&conns);
        assert_eq!(conns.get("default").unwrap().queries_len(), 0);
    }

    #[test]
    fn test_second_stop_is_noop() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default());
        all_books(&conns);
        assert!(logger.stop(&conns).is_some());
        let emitted = sink.records().len();

        assert!(logger.stop(&conns).is_none());
        assert_eq!(sink.records().len(), emitted);
    }

    #[test]
    fn test_restart_discards_previous_window() {
        let conns = library(false);
        let (mut logger, _sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default());
        all_books(&conns);
        all_books(&conns);
        logger.start(&conns, ConfigOverrides::default());
        all_authors(&conns);
        let report = logger.stop(&conns).unwrap();

        assert_eq!(report.queries.len(), 1);
        assert_eq!(report.duplicates, 0);
    }

    #[test]
    fn test_reset_during_session_yields_empty_report() {
        let conns = library(false);
        let (mut logger, _sink) = logger_with_sink();

        all_books(&conns);
        conns.get("default").unwrap().set_force_debug(true);
        all_books(&conns);
        logger.start(&conns, ConfigOverrides::default());
        conns.get("default").unwrap().reset_queries();
        let report = logger.stop(&conns).unwrap();
        assert!(report.queries.is_empty());
    }

    #[test]
    #[serial]
    fn test_restart_without_tracebacks_unpatches() {
        let conns = library(false);
        let (mut logger, _sink) = logger_with_sink();

        logger.start(&conns, ConfigOverrides::default().tracebacks(true));
        assert!(traceback::is_patched());
        logger.start(&conns, ConfigOverrides::default());
        assert!(!traceback::is_patched());
        logger.stop(&conns);
    }

    #[test]
    fn test_report_only_in_testing_mode() {
        let conns = library(false);
        let sink = Arc::new(MemorySink::new());
        let mut logger = QueryLogger::new("Production")
            .with_settings(Settings {
                testing: false,
                ..Default::default()
            })
            .with_sink(Arc::clone(&sink));

        logger.start(&conns, ConfigOverrides::default());
        all_books(&conns);
        assert!(logger.stop(&conns).is_none());
        // Findings are still logged
        assert_eq!(sink.of_type(LogType::Summary).len(), 1);
    }

    #[test]
    fn test_observe_wraps_closure() {
        let conns = library(false);
        let (mut logger, _sink) = logger_with_sink();

        let (titles, report) = logger.observe(&conns, ConfigOverrides::default(), || {
            all_books(&conns)
        });
        assert_eq!(titles, vec!["Book1".to_string(), "Book1".to_string()]);
        assert_eq!(report.unwrap().queries.len(), 1);
        assert!(!logger.is_active());
    }

    #[test]
    #[serial]
    fn test_tracebacks_patch_and_unpatch() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();
        traceback::unpatch_cursor();

        logger.start(&conns, ConfigOverrides::default().tracebacks(true));
        assert!(traceback::is_patched());
        all_books(&conns);
        all_books(&conns);
        let report = logger.stop(&conns).unwrap();
        assert!(!traceback::is_patched());

        assert!(report.queries.iter().all(|q| q.trace.is_some()));
        let dups = sink.of_type(LogType::Duplicate);
        assert_eq!(dups.len(), 1);
        let tb = dups[0].field("traceback").unwrap().as_str().unwrap();
        assert!(tb.contains("  File \""));
    }

    #[inline(never)]
    fn books_for_index_page(conns: &Connections) -> Vec<String> {
        all_books(conns)
    }

    #[inline(never)]
    fn books_for_detail_page(conns: &Connections) -> Vec<String> {
        all_books(conns)
    }

    #[test]
    #[serial]
    fn test_duplicate_traceback_names_first_call_site() {
        let conns = library(false);
        let (mut logger, sink) = logger_with_sink();
        traceback::unpatch_cursor();

        logger.start(&conns, ConfigOverrides::default().tracebacks(true));
        books_for_index_page(&conns);
        books_for_detail_page(&conns);
        logger.stop(&conns).unwrap();

        let dups = sink.of_type(LogType::Duplicate);
        assert_eq!(dups.len(), 1);
        let tb = dups[0].field("traceback").unwrap().as_str().unwrap();
        assert!(tb.contains("books_for_index_page"), "{tb}");
        assert!(!tb.contains("books_for_detail_page"), "{tb}");
    }

    #[test]
    #[serial]
    fn test_new_reads_process_settings() {
        let logger = QueryLogger::new("Global");
        assert_eq!(&logger.settings, Settings::global());
    }

    #[test]
    #[serial]
    fn test_tracebacks_off_leaves_patch_alone() {
        let conns = library(false);
        let (mut logger, _sink) = logger_with_sink();
        traceback::unpatch_cursor();

        logger.start(&conns, ConfigOverrides::default());
        assert!(!traceback::is_patched());
        all_books(&conns);
        let report = logger.stop(&conns).unwrap();
        assert!(report.queries[0].trace.is_none());
    }

    #[test]
    fn test_report_serializes() {
        let conns = library(false);
        let (mut logger, _sink) = logger_with_sink();
        logger.start(&conns, ConfigOverrides::default());
        all_books(&conns);
        let report = logger.stop(&conns).unwrap();

        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["duplicates"], json!(0));
        assert_eq!(v["queries"][0]["sql"], json!("SELECT title FROM book"));
        assert!(v["total_elapsed"].is_f64());
    }
}
