//! Compliance reports over past evaluations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::audit::entry::LogEntry;
use crate::error::LedgerError;

pub const DEFAULT_REPORT_SAMPLE_SIZE: usize = 10;

/// Reporting window, either named relative to now or explicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPeriod {
    Day,
    Week,
    Month,
    Quarter,
    Year,
    Custom {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl ReportPeriod {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), LedgerError> {
        let days = match self {
            ReportPeriod::Day => 1,
            ReportPeriod::Week => 7,
            ReportPeriod::Month => 30,
            ReportPeriod::Quarter => 90,
            ReportPeriod::Year => 365,
            ReportPeriod::Custom { start, end } => {
                if start > end {
                    return Err(LedgerError::ValidationError(format!(
                        "Report period start {} is after end {}",
                        start, end
                    )));
                }
                return Ok((*start, *end));
            }
        };
        Ok((now - Duration::days(days), now))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReportPeriod::Day => "day",
            ReportPeriod::Week => "week",
            ReportPeriod::Month => "month",
            ReportPeriod::Quarter => "quarter",
            ReportPeriod::Year => "year",
            ReportPeriod::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub framework: String,
    pub period: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_checks: usize,
    pub compliant_checks: usize,
    pub violation_checks: usize,
    /// `overall_status` → number of evaluations.
    pub status_counts: BTreeMap<String, usize>,
    pub distinct_targets: usize,
    /// Share of compliant evaluations; 0.0 when there were none.
    pub compliance_rate: f64,
    pub sample_entries: Vec<LogEntry>,
    pub log_id: Option<String>,
}

/// Running totals over `compliance.check` entries, fed one at a time so a
/// report never holds more than its sample in memory.
#[derive(Debug, Clone)]
pub struct ReportTally {
    status_counts: BTreeMap<String, usize>,
    targets: BTreeSet<String>,
    total: usize,
    sample_size: usize,
    newest: VecDeque<LogEntry>,
}

impl ReportTally {
    pub fn new(sample_size: usize) -> Self {
        Self {
            status_counts: BTreeMap::new(),
            targets: BTreeSet::new(),
            total: 0,
            sample_size,
            newest: VecDeque::with_capacity(sample_size),
        }
    }

    /// Count one evaluation. Entries are expected in ledger order.
    pub fn add(&mut self, entry: LogEntry) {
        let status = entry
            .details
            .get("overall_status")
            .and_then(|v| v.as_str())
            .unwrap_or(entry.result.as_str());
        *self.status_counts.entry(status.to_string()).or_default() += 1;
        self.targets.insert(entry.target.clone());
        self.total += 1;

        if self.sample_size == 0 {
            return;
        }
        if self.newest.len() == self.sample_size {
            self.newest.pop_front();
        }
        self.newest.push_back(entry);
    }

    pub fn finish(
        self,
        framework: &str,
        period: &ReportPeriod,
        (start_time, end_time): (DateTime<Utc>, DateTime<Utc>),
    ) -> ComplianceReport {
        let total_checks = self.total;
        let compliant_checks = self.status_counts.get("compliant").copied().unwrap_or(0);
        let compliance_rate = if total_checks == 0 {
            0.0
        } else {
            compliant_checks as f64 / total_checks as f64
        };

        let mut sample_entries: Vec<LogEntry> = self.newest.into_iter().collect();
        sample_entries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });

        ComplianceReport {
            framework: framework.to_string(),
            period: period.label().to_string(),
            start_time,
            end_time,
            total_checks,
            compliant_checks,
            violation_checks: total_checks - compliant_checks,
            status_counts: self.status_counts,
            distinct_targets: self.targets.len(),
            compliance_rate,
            sample_entries,
            log_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn check_entry(sequence: u64, target: &str, status: &str) -> LogEntry {
        let mut details = Map::new();
        details.insert("compliance_type".to_string(), json!("gdpr"));
        details.insert("overall_status".to_string(), json!(status));
        LogEntry::new(
            sequence,
            "compliance.check".to_string(),
            "compliance_engine".to_string(),
            target.to_string(),
            status.to_string(),
            details,
            Map::new(),
            None,
        )
    }

    #[test]
    fn test_named_periods() {
        let now = Utc::now();
        let (start, end) = ReportPeriod::Week.resolve(now).unwrap();
        assert_eq!(end, now);
        assert_eq!(end - start, Duration::days(7));
        assert_eq!(ReportPeriod::Quarter.resolve(now).unwrap().0, now - Duration::days(90));
    }

    #[test]
    fn test_custom_period() {
        let now = Utc::now();
        let period = ReportPeriod::Custom {
            start: now - Duration::days(3),
            end: now,
        };
        assert_eq!(period.resolve(now).unwrap(), (now - Duration::days(3), now));

        let inverted = ReportPeriod::Custom {
            start: now,
            end: now - Duration::days(3),
        };
        assert!(matches!(inverted.resolve(now), Err(LedgerError::ValidationError(_))));
    }

    #[test]
    fn test_period_wire_format() {
        let named: ReportPeriod = serde_json::from_value(json!("month")).unwrap();
        assert_eq!(named, ReportPeriod::Month);

        let custom: ReportPeriod = serde_json::from_value(json!({
            "custom": {"start": "2025-01-01T00:00:00Z", "end": "2025-02-01T00:00:00Z"}
        }))
        .unwrap();
        assert_eq!(custom.label(), "custom");
    }

    #[test]
    fn test_tally_summary() {
        let mut tally = ReportTally::new(2);
        tally.add(check_entry(1, "doc-3", "low_violation"));
        tally.add(check_entry(2, "doc-1", "compliant"));
        tally.add(check_entry(3, "doc-2", "high_violation"));
        tally.add(check_entry(4, "doc-1", "compliant"));
        let now = Utc::now();
        let report = tally.finish("gdpr", &ReportPeriod::Day, (now, now));

        assert_eq!(report.total_checks, 4);
        assert_eq!(report.compliant_checks, 2);
        assert_eq!(report.violation_checks, 2);
        assert_eq!(report.status_counts["high_violation"], 1);
        assert_eq!(report.distinct_targets, 3);
        assert!((report.compliance_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.sample_entries.len(), 2);
        assert_eq!(report.sample_entries[0].sequence, 4);
    }

    #[test]
    fn test_tally_keeps_newest_sample() {
        let mut tally = ReportTally::new(3);
        for sequence in 1..=50 {
            let status = if sequence % 5 == 0 { "medium_violation" } else { "compliant" };
            tally.add(check_entry(sequence, &format!("doc-{}", sequence % 7), status));
        }
        let now = Utc::now();
        let report = tally.finish("gdpr", &ReportPeriod::Month, (now, now));

        assert_eq!(report.total_checks, 50);
        assert_eq!(report.compliant_checks, 40);
        assert_eq!(report.status_counts["medium_violation"], 10);
        assert_eq!(report.distinct_targets, 7);
        let sampled: Vec<u64> = report.sample_entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sampled, vec![50, 49, 48]);
    }

    #[test]
    fn test_empty_report() {
        let now = Utc::now();
        let report = ReportTally::new(10).finish("hipaa", &ReportPeriod::Year, (now, now));
        assert_eq!(report.total_checks, 0);
        assert_eq!(report.compliance_rate, 0.0);
        assert!(report.status_counts.is_empty());
    }
}
