//! Compliance rule evaluation and reporting.

pub mod engine;
pub mod report;
pub mod rules;

pub use engine::{ComplianceCheckResult, ComplianceEngine, OverallStatus, RuleCheck};
pub use report::{ComplianceReport, ReportPeriod};
pub use rules::{Checker, ComplianceRuleSet, Rule, RuleCatalog, Severity};
