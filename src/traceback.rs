/// Stack capture for recorded queries.
///
/// Patching is process-wide: once [`patch_cursor`] runs, every statement that
/// goes through a capturing connection's `execute` or `execute_many` also
/// records the call stack that issued it. Resolving symbols for every
/// statement is slow, so this is meant for troubleshooting only and must be
/// paired with [`unpatch_cursor`].
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

static PATCHED: AtomicBool = AtomicBool::new(false);

/// One resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Make the execution entry points capture a stack trace per statement.
pub fn patch_cursor() {
    if !PATCHED.swap(true, Ordering::SeqCst) {
        tracing::debug!("query traceback capture enabled");
    }
}

/// Restore plain execution without stack capture.
pub fn unpatch_cursor() {
    if PATCHED.swap(false, Ordering::SeqCst) {
        tracing::debug!("query traceback capture disabled");
    }
}

/// Whether traceback capture is currently installed.
pub fn is_patched() -> bool {
    PATCHED.load(Ordering::SeqCst)
}

/// Capture the current stack if the patch is installed.
pub(crate) fn capture_if_patched() -> Option<Vec<TraceFrame>> {
    if is_patched() {
        Some(capture())
    } else {
        None
    }
}

/// Capture the current call stack, outermost frame first, without the
/// instrumentation's own frames.
pub fn capture() -> Vec<TraceFrame> {
    let bt = backtrace::Backtrace::new();
    let mut frames: Vec<TraceFrame> = bt
        .frames()
        .iter()
        .flat_map(|frame| frame.symbols())
        .map(|sym| TraceFrame {
            function: sym.name().map(|n| format!("{n:#}")),
            file: sym.filename().map(|p| p.display().to_string()),
            line: sym.lineno(),
        })
        .filter(should_include)
        .collect();
    frames.reverse();
    frames
}

/// Module paths whose frames belong to the instrumentation or the unwinder.
const OWN_MODULES: [&str; 3] = ["query_logger::traceback::", "query_logger::db::", "backtrace::"];

/// Absolute paths of the instrumentation's source files.
const OWN_FILES: [&str; 2] = [
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/traceback.rs"),
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/db.rs"),
];

fn should_include(frame: &TraceFrame) -> bool {
    if frame.function.is_none() && frame.file.is_none() {
        return false;
    }
    if let Some(name) = &frame.function {
        let name = name.trim_start_matches('<');
        if OWN_MODULES.iter().any(|own| name.starts_with(own)) {
            return false;
        }
    }
    if let Some(file) = &frame.file {
        let path = Path::new(file);
        if OWN_FILES.iter().any(|own| path == Path::new(own)) {
            return false;
        }
    }
    true
}

/// Render frames one per line in the familiar
/// `  File "path", line N, in function` layout.
pub fn format_list(frames: &[TraceFrame]) -> String {
    frames
        .iter()
        .map(|f| {
            format!(
                "  File \"{}\", line {}, in {}\n",
                f.file.as_deref().unwrap_or("<unknown>"),
                f.line.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
                f.function.as_deref().unwrap_or("<unknown>"),
            )
        })
        .collect()
}
