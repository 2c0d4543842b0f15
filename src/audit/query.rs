//! Query Engine
//!
//! Answers filtered, time-ranged, paginated reads. The in-memory cache is
//! consulted first; the persisted file is streamed whenever the requested
//! window could reach entries the cache no longer holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::time::Instant;
use tracing::{debug, warn};

use crate::audit::entry::LogEntry;
use crate::audit::ledger::AuditLedger;
use crate::audit::run_blocking;
use crate::audit::store;
use crate::error::LedgerError;

pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 1000;

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

/// Query as received over the wire, with times still as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filters: Map<String, Value>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            filters: Map::new(),
            start_time: None,
            end_time: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

impl QueryRequest {
    pub fn resolve(&self) -> Result<LogQuery, LedgerError> {
        Ok(LogQuery {
            filters: self.filters.clone(),
            start_time: parse_time("start_time", self.start_time.as_deref())?,
            end_time: parse_time("end_time", self.end_time.as_deref())?,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// Parse an optional RFC 3339 timestamp, accepting a trailing `Z`.
pub fn parse_time(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, LedgerError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| LedgerError::ValidationError(format!("Invalid {} format '{}': {}", field, raw, e))),
    }
}

/// Typed query: exact-match filters ANDed with an inclusive time window.
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    pub filters: Map<String, Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            filters: Map::new(),
            start_time: None,
            end_time: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

impl LogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.filters.insert(path.to_string(), value.into());
        self
    }

    pub fn with_time_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.limit == 0 || self.limit > MAX_QUERY_LIMIT {
            return Err(LedgerError::ValidationError(format!(
                "limit must be between 1 and {}, got {}",
                MAX_QUERY_LIMIT, self.limit
            )));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(LedgerError::ValidationError(format!(
                    "start_time {} is after end_time {}",
                    start, end
                )));
            }
        }
        if self.filters.keys().any(|k| k.trim().is_empty()) {
            return Err(LedgerError::ValidationError("Empty filter key".to_string()));
        }
        Ok(())
    }

    pub fn in_time_range(&self, entry: &LogEntry) -> bool {
        in_range(entry, self.start_time, self.end_time)
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.in_time_range(entry)
            && self.filters.iter().all(|(path, expected)| {
                let actual = match entry.field(path) {
                    Some(value) => Some(value),
                    // Bare keys fall back to the details map
                    None if !path.contains('.') => entry.field(&format!("details.{}", path)),
                    None => None,
                };
                actual.as_ref() == Some(expected)
            })
    }
}

fn in_range(entry: &LogEntry, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    start.map_or(true, |s| entry.timestamp >= s) && end.map_or(true, |e| entry.timestamp <= e)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub entries: Vec<LogEntry>,
    pub count: usize,
    pub total: usize,
    pub has_more: bool,
}

/// Outcome of a streaming scan over the persisted ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub scanned: usize,
    pub skipped: usize,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct QueryEngine {
    ledger: AuditLedger,
}

impl QueryEngine {
    pub fn new(ledger: AuditLedger) -> Self {
        Self { ledger }
    }

    pub async fn query(&self, query: &LogQuery) -> Result<QueryResult, LedgerError> {
        query.validate()?;
        let engine = self.clone();
        let request = query.clone();
        let matches = run_blocking(move || engine.collect(&request)).await?;
        let total = matches.len();
        let entries: Vec<LogEntry> = matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        let count = entries.len();

        debug!("Query matched {} entries, returning {}", total, count);
        Ok(QueryResult {
            has_more: query.offset + count < total,
            entries,
            count,
            total,
        })
    }

    /// Every match, de-duplicated by `log_id`, newest first. Pagination
    /// fields are ignored.
    pub fn collect(&self, query: &LogQuery) -> Result<Vec<LogEntry>, LedgerError> {
        query.validate()?;

        let cached = self.ledger.cache_snapshot();
        let oldest_cached = cached.first().map(|e| e.timestamp);

        let mut seen = HashSet::new();
        let mut matches = Vec::new();
        for entry in cached {
            if query.matches(&entry) && seen.insert(entry.log_id.clone()) {
                matches.push(entry);
            }
        }

        if self.needs_file_scan(query, oldest_cached) {
            self.scan(query.start_time, query.end_time, None, |entry| {
                if query.matches(&entry) && seen.insert(entry.log_id.clone()) {
                    matches.push(entry);
                }
                ControlFlow::Continue(())
            })?;
        }

        matches.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        Ok(matches)
    }

    fn needs_file_scan(&self, query: &LogQuery, oldest_cached: Option<DateTime<Utc>>) -> bool {
        if self.ledger.cache_is_complete() {
            return false;
        }
        match (query.start_time, oldest_cached) {
            (Some(start), Some(oldest)) => start <= oldest,
            _ => true,
        }
    }

    /// Stream persisted entries inside the window. Stops with
    /// `truncated = true` once `deadline` passes.
    pub fn scan<F>(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        deadline: Option<Instant>,
        mut visit: F,
    ) -> Result<ScanOutcome, LedgerError>
    where
        F: FnMut(LogEntry) -> ControlFlow<()>,
    {
        let mut outcome = ScanOutcome::default();
        let stats = store::for_each_entry(self.ledger.path(), 0, |entry| {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                outcome.truncated = true;
                return ControlFlow::Break(());
            }
            outcome.scanned += 1;
            if in_range(&entry, start, end) {
                visit(entry)
            } else {
                ControlFlow::Continue(())
            }
        })?;

        outcome.skipped = stats.skipped;
        if outcome.truncated {
            warn!("Ledger scan hit its deadline after {} entries", outcome.scanned);
        }
        Ok(outcome)
    }

    /// Look up an entry as it is persisted on disk, bypassing the cache.
    pub fn find_persisted(&self, log_id: &str) -> Result<Option<LogEntry>, LedgerError> {
        self.ledger.find(log_id)
    }
}
