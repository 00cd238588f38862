use crate::traceback::{self, TraceFrame};
use rusqlite::{Batch, Connection, Row, Statement, ToSql};
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// One statement recorded while capture was on.
#[derive(Debug, Clone)]
pub struct RawQuery {
    /// SQL text with bound parameters expanded.
    pub sql: String,
    pub elapsed: Duration,
    /// Call stack that issued the statement, when traceback capture is patched in.
    pub trace: Option<Vec<TraceFrame>>,
}

/// A SQLite connection that can record every statement it runs.
///
/// Recording happens when either the connection was opened in `debug` mode or
/// the capture flag has been forced on with [`DebugConnection::set_force_debug`].
/// Not `Sync`: the flag and the query list use interior mutability and a
/// capture session belongs to one thread.
pub struct DebugConnection {
    conn: Connection,
    debug: bool,
    force_debug: Cell<bool>,
    queries: RefCell<Vec<RawQuery>>,
}

impl DebugConnection {
    /// Opens (or creates) the database at the given path.
    pub fn open(path: &Path, debug: bool) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Ok(Self::from_connection(conn, debug))
    }

    pub fn open_in_memory(debug: bool) -> Result<Self, DbError> {
        Ok(Self::from_connection(Connection::open_in_memory()?, debug))
    }

    pub fn from_connection(conn: Connection, debug: bool) -> Self {
        Self {
            conn,
            debug,
            force_debug: Cell::new(false),
            queries: RefCell::new(Vec::new()),
        }
    }

    /// The underlying connection. Statements run through it are never recorded.
    pub fn inner(&self) -> &Connection {
        &self.conn
    }

    /// Whether statements are currently being recorded.
    pub fn queries_logged(&self) -> bool {
        self.debug || self.force_debug.get()
    }

    pub fn force_debug(&self) -> bool {
        self.force_debug.get()
    }

    pub fn set_force_debug(&self, enabled: bool) {
        self.force_debug.set(enabled);
    }

    /// All statements recorded so far.
    pub fn queries(&self) -> Ref<'_, Vec<RawQuery>> {
        self.queries.borrow()
    }

    pub fn queries_len(&self) -> usize {
        self.queries.borrow().len()
    }

    /// Statements recorded at or after position `start`. Empty if the list has
    /// been reset below that point.
    pub fn queries_since(&self, start: usize) -> Vec<RawQuery> {
        self.queries
            .borrow()
            .get(start..)
            .map(<[RawQuery]>::to_vec)
            .unwrap_or_default()
    }

    pub fn reset_queries(&self) {
        self.queries.borrow_mut().clear();
    }

    /// Execute a single statement. Returns the number of rows changed.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        bind_all(&mut stmt, params)?;
        let recorded = expanded_or(&stmt, sql);
        self.record(recorded, || stmt.raw_execute())
    }

    /// Execute one statement once per parameter set. Recorded as a single
    /// entry reading `"{n} times {sql}"`.
    pub fn execute_many(&self, sql: &str, param_sets: &[&[&dyn ToSql]]) -> Result<usize, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let recorded = format!("{} times {sql}", param_sets.len());
        self.record(recorded, || {
            let mut changed = 0;
            for params in param_sets {
                bind_all(&mut stmt, params)?;
                changed += stmt.raw_execute()?;
            }
            Ok(changed)
        })
    }

    /// Run a row-returning statement and map every row.
    ///
    /// Recorded through the same path as [`DebugConnection::execute`].
    pub fn query_rows<T, F>(&self, sql: &str, params: &[&dyn ToSql], mut f: F) -> Result<Vec<T>, DbError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        bind_all(&mut stmt, params)?;
        let recorded = expanded_or(&stmt, sql);
        self.record(recorded, || {
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(f(row)?);
            }
            Ok(out)
        })
    }

    /// Run every statement of a script, recording each one separately.
    /// Returns the number of statements run.
    pub fn execute_script(&self, script: &str) -> Result<usize, DbError> {
        let mut batch = Batch::new(&self.conn, script);
        let mut count = 0;
        while let Some(mut stmt) = batch.next()? {
            let recorded = script_statement_sql(&stmt);
            if stmt.column_count() > 0 {
                self.record(recorded, || {
                    let mut rows = stmt.raw_query();
                    while rows.next()?.is_some() {}
                    Ok(())
                })?;
            } else {
                self.record(recorded, || stmt.raw_execute())?;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Run `run`, timing and recording it when capture is on. The entry is
    /// recorded even when the statement fails.
    fn record<T>(
        &self,
        sql: String,
        run: impl FnOnce() -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        if !self.queries_logged() {
            return Ok(run()?);
        }

        let start = Instant::now();
        let result = run();
        let elapsed = start.elapsed();
        let trace = traceback::capture_if_patched();

        tracing::trace!(sql = %sql, elapsed_us = elapsed.as_micros() as u64, "statement recorded");
        self.queries.borrow_mut().push(RawQuery {
            sql,
            elapsed,
            trace,
        });

        Ok(result?)
    }
}

impl std::fmt::Debug for DebugConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugConnection")
            .field("debug", &self.debug)
            .field("force_debug", &self.force_debug.get())
            .field("queries", &self.queries_len())
            .finish()
    }
}

fn bind_all(stmt: &mut Statement<'_>, params: &[&dyn ToSql]) -> rusqlite::Result<()> {
    let expected = stmt.parameter_count();
    if params.len() != expected {
        return Err(rusqlite::Error::InvalidParameterCount(params.len(), expected));
    }
    for (i, param) in params.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, *param)?;
    }
    Ok(())
}

/// Statement text from a script with the surrounding whitespace and the
/// terminating `;` removed, so position in the script doesn't affect it.
fn script_statement_sql(stmt: &Statement<'_>) -> String {
    let sql = stmt.expanded_sql().unwrap_or_default();
    sql.trim().trim_end_matches(';').trim_end().to_string()
}

fn expanded_or(stmt: &Statement<'_>, fallback: &str) -> String {
    stmt.expanded_sql().unwrap_or_else(|| fallback.to_string())
}

/// Named registry of capturing connections (`"default"`, `"replica"`, ...).
#[derive(Debug, Default)]
pub struct Connections {
    by_name: HashMap<String, DebugConnection>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `name`, returning any connection it replaces.
    pub fn insert(&mut self, name: impl Into<String>, conn: DebugConnection) -> Option<DebugConnection> {
        self.by_name.insert(name.into(), conn)
    }

    pub fn remove(&mut self, name: &str) -> Option<DebugConnection> {
        self.by_name.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&DebugConnection> {
        self.by_name.get(name)
    }

    /// Like [`Connections::get`] but reports unknown names as an error.
    pub fn connection(&self, name: &str) -> Result<&DebugConnection, DbError> {
        self.get(name)
            .ok_or_else(|| DbError::UnknownConnection(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Force statement recording on for `name`. Returns `false` when no such
    /// connection exists.
    pub fn enable_capture(&self, name: &str) -> bool {
        match self.get(name) {
            Some(conn) => {
                conn.set_force_debug(true);
                true
            }
            None => false,
        }
    }

    /// Drop the forced recording flag for `name`. Connections opened in
    /// `debug` mode keep recording.
    pub fn disable_capture(&self, name: &str) -> bool {
        match self.get(name) {
            Some(conn) => {
                conn.set_force_debug(false);
                true
            }
            None => false,
        }
    }
}

/// Errors from the capturing database layer.
#[derive(Debug)]
pub enum DbError {
    UnknownConnection(String),
    Sqlite(rusqlite::Error),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::UnknownConnection(name) => write!(f, "unknown database connection '{name}'"),
            DbError::Sqlite(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::UnknownConnection(_) => None,
            DbError::Sqlite(e) => Some(e),
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError::Sqlite(e)
    }
}
