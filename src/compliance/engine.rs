//! Compliance Engine
//!
//! Runs a framework's rules against caller-supplied parameters, reduces the
//! per-rule results to one status by strict severity priority, and records
//! every evaluation in the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::audit::ledger::AuditLedger;
use crate::audit::query::{LogQuery, QueryEngine};
use crate::audit::run_blocking;
use crate::compliance::report::{ComplianceReport, ReportPeriod, ReportTally, DEFAULT_REPORT_SAMPLE_SIZE};
use crate::compliance::rules::{ComplianceRuleSet, RuleCatalog, Severity};
use crate::error::LedgerError;

pub const COMPLIANCE_CHECK_ACTION: &str = "compliance.check";
pub const COMPLIANCE_REPORT_ACTION: &str = "compliance.report";
const COMPLIANCE_ACTOR: &str = "compliance_engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Compliant,
    LowViolation,
    MediumViolation,
    HighViolation,
    CriticalViolation,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Compliant => "compliant",
            OverallStatus::LowViolation => "low_violation",
            OverallStatus::MediumViolation => "medium_violation",
            OverallStatus::HighViolation => "high_violation",
            OverallStatus::CriticalViolation => "critical_violation",
        }
    }

    fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => OverallStatus::CriticalViolation,
            Severity::High => OverallStatus::HighViolation,
            Severity::Medium => OverallStatus::MediumViolation,
            Severity::Low => OverallStatus::LowViolation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCheck {
    pub rule_id: String,
    pub severity: Severity,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceCheckResult {
    pub framework: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<RuleCheck>,
    pub violations_by_severity: BTreeMap<Severity, Vec<String>>,
    pub overall_status: OverallStatus,
    pub log_id: String,
}

/// Run every rule of `rule_set` in order.
pub fn run_rules(rule_set: &ComplianceRuleSet, params: &Map<String, Value>, now: DateTime<Utc>) -> Vec<RuleCheck> {
    rule_set
        .rules
        .iter()
        .map(|rule| {
            let outcome = rule.checker.check(params, now);
            RuleCheck {
                rule_id: rule.id.clone(),
                severity: rule_set.severity_of(&rule.id),
                passed: outcome.passed,
                details: outcome.details,
            }
        })
        .collect()
}

/// Group failures by severity and pick the status of the most severe one.
/// The number of failures at each level plays no part.
pub fn aggregate(checks: &[RuleCheck]) -> (BTreeMap<Severity, Vec<String>>, OverallStatus) {
    let mut violations: BTreeMap<Severity, Vec<String>> =
        Severity::ALL.into_iter().map(|s| (s, Vec::new())).collect();
    for check in checks.iter().filter(|c| !c.passed) {
        violations.entry(check.severity).or_default().push(check.rule_id.clone());
    }

    let status = Severity::ALL
        .into_iter()
        .find(|s| violations.get(s).map_or(false, |ids| !ids.is_empty()))
        .map_or(OverallStatus::Compliant, OverallStatus::for_severity);

    (violations, status)
}

#[derive(Clone)]
pub struct ComplianceEngine {
    ledger: AuditLedger,
    query: QueryEngine,
    catalog: Arc<RwLock<Arc<RuleCatalog>>>,
    report_sample_size: usize,
}

impl ComplianceEngine {
    pub fn new(ledger: AuditLedger, catalog: RuleCatalog) -> Self {
        Self {
            query: QueryEngine::new(ledger.clone()),
            ledger,
            catalog: Arc::new(RwLock::new(Arc::new(catalog))),
            report_sample_size: DEFAULT_REPORT_SAMPLE_SIZE,
        }
    }

    pub fn with_report_sample_size(mut self, size: usize) -> Self {
        self.report_sample_size = size;
        self
    }

    pub fn catalog(&self) -> Arc<RuleCatalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Swap in a new rule catalog. Evaluations already running keep the
    /// catalog they started with.
    pub fn replace_catalog(&self, catalog: RuleCatalog) -> Result<(), LedgerError> {
        catalog.validate()?;
        *self.catalog.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(catalog);
        info!("Compliance rule catalog replaced");
        Ok(())
    }

    pub async fn evaluate(
        &self,
        framework: &str,
        target_id: &str,
        params: &Map<String, Value>,
    ) -> Result<ComplianceCheckResult, LedgerError> {
        if target_id.trim().is_empty() {
            return Err(LedgerError::missing_field("target_id"));
        }

        let catalog = self.catalog();
        let rule_set = catalog
            .get(framework)
            .ok_or_else(|| LedgerError::unknown_framework(framework))?;

        let now = Utc::now();
        let checks = run_rules(rule_set, params, now);
        let (violations_by_severity, overall_status) = aggregate(&checks);

        info!(
            "{} evaluation of {}: {}",
            framework,
            target_id,
            overall_status.as_str()
        );

        let mut details = Map::new();
        details.insert("compliance_type".to_string(), json!(framework));
        details.insert("overall_status".to_string(), json!(overall_status));
        details.insert("violations_by_severity".to_string(), json!(violations_by_severity));
        details.insert(
            "rules_checked".to_string(),
            json!(checks.len()),
        );

        let entry = self
            .ledger
            .log_action(
                COMPLIANCE_CHECK_ACTION,
                COMPLIANCE_ACTOR,
                target_id,
                overall_status.as_str(),
                details,
                Map::new(),
            )
            .await?;

        Ok(ComplianceCheckResult {
            framework: framework.to_string(),
            target_id: target_id.to_string(),
            timestamp: entry.timestamp,
            checks,
            violations_by_severity,
            overall_status,
            log_id: entry.log_id,
        })
    }

    pub async fn generate_report(
        &self,
        framework: &str,
        period: &ReportPeriod,
    ) -> Result<ComplianceReport, LedgerError> {
        if self.catalog().get(framework).is_none() {
            return Err(LedgerError::unknown_framework(framework));
        }

        let range = period.resolve(Utc::now())?;
        let query = LogQuery::new()
            .with_filter("action_type", COMPLIANCE_CHECK_ACTION)
            .with_filter("details.compliance_type", framework)
            .with_time_range(Some(range.0), Some(range.1));

        // Every acknowledged entry is on disk, so one pass over the file
        // sees each evaluation exactly once.
        let engine = self.query.clone();
        let sample_size = self.report_sample_size;
        let tally = run_blocking(move || {
            let mut tally = ReportTally::new(sample_size);
            engine.scan(query.start_time, query.end_time, None, |entry| {
                if query.matches(&entry) {
                    tally.add(entry);
                }
                ControlFlow::Continue(())
            })?;
            Ok(tally)
        })
        .await?;

        let mut report = tally.finish(framework, period, range);
        debug!("Report over {} {} evaluations", report.total_checks, framework);

        let mut details = Map::new();
        details.insert("compliance_type".to_string(), json!(framework));
        details.insert("period".to_string(), json!(report.period));
        details.insert("total_checks".to_string(), json!(report.total_checks));
        details.insert("compliance_rate".to_string(), json!(report.compliance_rate));

        let entry = self
            .ledger
            .log_action(
                COMPLIANCE_REPORT_ACTION,
                COMPLIANCE_ACTOR,
                framework,
                "generated",
                details,
                Map::new(),
            )
            .await?;
        report.log_id = Some(entry.log_id);

        Ok(report)
    }
}
