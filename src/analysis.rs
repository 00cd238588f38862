use crate::db::RawQuery;
use crate::normalize::normalize_sql;
use crate::traceback::TraceFrame;
use serde::Serialize;
use std::collections::HashMap;

/// Facts about one captured statement, ready for analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryInfo {
    /// Normalized SQL text.
    pub sql: String,
    pub elapsed_secs: f64,
    pub trace: Option<Vec<TraceFrame>>,
}

impl From<&RawQuery> for QueryInfo {
    fn from(q: &RawQuery) -> Self {
        Self {
            sql: normalize_sql(&q.sql),
            elapsed_secs: q.elapsed.as_secs_f64(),
            trace: q.trace.clone(),
        }
    }
}

pub fn get_query_infos(queries: &[RawQuery]) -> Vec<QueryInfo> {
    queries.iter().map(QueryInfo::from).collect()
}

/// Occurrences per normalized statement, most frequent first. Statements
/// with equal counts keep the order they were first seen in.
pub fn count_duplicates(infos: &[QueryInfo]) -> Vec<(String, usize)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut counts: Vec<(String, usize)> = Vec::new();
    for qi in infos {
        match index.get(qi.sql.as_str()) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(&qi.sql, counts.len());
                counts.push((qi.sql.clone(), 1));
            }
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}

/// Every occurrence per normalized statement, in execution order.
pub fn group_queries(infos: &[QueryInfo]) -> HashMap<&str, Vec<&QueryInfo>> {
    let mut groups: HashMap<&str, Vec<&QueryInfo>> = HashMap::new();
    for qi in infos {
        groups.entry(qi.sql.as_str()).or_default().push(qi);
    }
    groups
}

/// Statements seen more than once, least frequent first.
pub fn duplicate_groups(infos: &[QueryInfo]) -> Vec<(String, usize)> {
    let mut dups: Vec<(String, usize)> = count_duplicates(infos)
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .collect();
    dups.reverse();
    dups
}

/// Number of redundant executions: every repeat past the first.
pub fn duplicate_total(groups: &[(String, usize)]) -> usize {
    groups.iter().map(|(_, n)| n.saturating_sub(1)).sum()
}

/// Queries slower than `threshold_ms`. A threshold of 0 disables the check.
pub fn long_running(infos: &[QueryInfo], threshold_ms: u64) -> Vec<&QueryInfo> {
    if threshold_ms == 0 || infos.is_empty() {
        return Vec::new();
    }
    let limit_secs = threshold_ms as f64 / 1000.0;
    infos.iter().filter(|qi| qi.elapsed_secs > limit_secs).collect()
}

/// Sum of per-statement elapsed times, in seconds.
pub fn sql_time(infos: &[QueryInfo]) -> f64 {
    infos.iter().map(|qi| qi.elapsed_secs).sum()
}
