use clap::Parser;
use query_logger::settings;
use query_logger::{
    ConfigOverrides, Connections, DebugConnection, LogConfig, QueryLogger, SessionReport, Settings,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Run SQL scripts against a SQLite database inside one query logging
/// session: report repeated statements, statements over the time budget,
/// and total SQL time.
#[derive(Parser, Debug)]
#[command(name = "query-logger", version, about)]
pub struct Cli {
    /// SQL script paths or glob patterns, run in order
    #[arg(value_name = "SCRIPT", required = true)]
    scripts: Vec<String>,

    /// Database file path
    #[arg(long)]
    db: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = "query-logger.toml")]
    config: PathBuf,

    /// Connection name to register the database under (overrides config)
    #[arg(long)]
    connection: Option<String>,

    /// Capture a stack trace per statement
    #[arg(long)]
    tracebacks: bool,

    /// Don't log repeated statements
    #[arg(long)]
    no_duplicates: bool,

    /// Per-statement time budget in ms, 0 disables (overrides config)
    #[arg(long)]
    limit_ms: Option<u64>,

    /// Extra field added to every log record, as key=value
    #[arg(long = "extra", value_parser = parse_extra)]
    extras: Vec<(String, String)>,

    /// Print resolved settings and matched scripts, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (per-statement traces)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_extra(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::default();
        if let Some(name) = &self.connection {
            overrides = overrides.connection(name.clone());
        }
        if self.tracebacks {
            overrides = overrides.tracebacks(true);
        }
        if self.no_duplicates {
            overrides = overrides.duplicates(false);
        }
        if let Some(ms) = self.limit_ms {
            overrides = overrides.threshold_ms(ms);
        }
        for (k, v) in &self.extras {
            overrides = overrides.extra(k.clone(), v.clone());
        }
        overrides
    }
}

/// Expand each argument as a glob; arguments matching nothing are taken as
/// literal paths.
fn resolve_scripts(patterns: &[String]) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let mut matched: Vec<PathBuf> = glob::glob(pattern)?.collect::<Result<_, _>>()?;
        if matched.is_empty() {
            paths.push(PathBuf::from(pattern));
        } else {
            matched.sort();
            paths.append(&mut matched);
        }
    }
    Ok(paths)
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "query-logger failed");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load_or_default(&cli.config);
    let config = LogConfig::resolve(&settings, cli.overrides());
    let scripts = resolve_scripts(&cli.scripts)?;

    if cli.dry_run {
        println!("{}", serde_json::to_string_pretty(&config)?);
        for script in &scripts {
            println!("script: {}", script.display());
        }
        return Ok(());
    }

    let mut connections = Connections::new();
    connections.insert(
        config.connection_name.clone(),
        DebugConnection::open(&cli.db, settings.debug)?,
    );

    if settings::install(settings).is_err() {
        tracing::debug!("process settings already installed, keeping them");
    }
    let mut logger = QueryLogger::new("query-logger");
    let overrides = cli.overrides().connection(config.connection_name.clone());

    if let Some(report) = run_session(&mut logger, &connections, overrides, &scripts)? {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Run every script inside one logging session. The session is stopped even
/// when a script fails, so the statements captured up to the failure are
/// still analyzed and logged.
fn run_session(
    logger: &mut QueryLogger,
    connections: &Connections,
    overrides: ConfigOverrides,
    scripts: &[PathBuf],
) -> Result<Option<SessionReport>, Box<dyn std::error::Error>> {
    let name = overrides.connection_name.clone().unwrap_or_default();
    let conn = connections.connection(&name)?;

    logger.start(connections, overrides);
    let outcome = run_scripts(conn, scripts);
    let report = logger.stop(connections);

    outcome.map(|()| report)
}

fn run_scripts(conn: &DebugConnection, scripts: &[PathBuf]) -> Result<(), Box<dyn std::error::Error>> {
    for script in scripts {
        let sql = std::fs::read_to_string(script)?;
        let n = conn.execute_script(&sql)?;
        tracing::info!(script = %script.display(), statements = n, "script finished");
    }
    Ok(())
}
