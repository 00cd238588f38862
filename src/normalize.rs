/// SQL text normalization for duplicate detection.
///
/// Literal integer comparisons (`id = 42`) are replaced by a placeholder so
/// that statements differing only in the id compare equal. This is a plain
/// regex substitution, not a SQL parser: it also rewrites matches inside
/// string literals and leaves other literal kinds alone.
use regex::Regex;
use std::sync::LazyLock;

static SQL_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"=\s*\d+").unwrap());

/// Replace every `= <digits>` in `sql` with `= ?`.
pub fn normalize_sql(sql: &str) -> String {
    SQL_ID_PATTERN.replace_all(sql, "= ?").into_owned()
}
