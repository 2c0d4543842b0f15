//! Compliance rule model
//!
//! A framework is an ordered list of rules plus a severity table. Each rule
//! carries one checker drawn from a fixed set of kinds.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::error::LedgerError;

/// Severity levels, declared in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl ComparisonOp {
    fn apply(&self, actual: f64, expected: f64) -> bool {
        match self {
            ComparisonOp::Lt => actual < expected,
            ComparisonOp::Lte => actual <= expected,
            ComparisonOp::Gt => actual > expected,
            ComparisonOp::Gte => actual >= expected,
            ComparisonOp::Eq => (actual - expected).abs() < f64::EPSILON,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::Lt => "<",
            ComparisonOp::Lte => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Gte => ">=",
            ComparisonOp::Eq => "==",
        }
    }
}

/// The supported checker kinds. Fields are dot-paths into the evaluation
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Checker {
    Threshold {
        field: String,
        operator: ComparisonOp,
        value: f64,
    },
    /// Passes when no value at `field` matches any pattern. An absent field
    /// has nothing to match and passes.
    PatternAbsence {
        field: String,
        patterns: Vec<String>,
    },
    RequiredFields {
        fields: Vec<String>,
    },
    /// `field` holds an RFC 3339 timestamp no older than `max_days`.
    MaxAge {
        field: String,
        max_days: i64,
    },
}

/// Result of running one checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub details: String,
}

impl CheckOutcome {
    fn pass(details: impl Into<String>) -> Self {
        Self { passed: true, details: details.into() }
    }

    fn fail(details: impl Into<String>) -> Self {
        Self { passed: false, details: details.into() }
    }
}

impl Checker {
    pub fn kind(&self) -> &'static str {
        match self {
            Checker::Threshold { .. } => "threshold",
            Checker::PatternAbsence { .. } => "pattern_absence",
            Checker::RequiredFields { .. } => "required_fields",
            Checker::MaxAge { .. } => "max_age",
        }
    }

    pub fn check(&self, params: &Map<String, Value>, now: DateTime<Utc>) -> CheckOutcome {
        match self {
            Checker::Threshold { field, operator, value } => match lookup(params, field) {
                None => CheckOutcome::fail(format!("{} is missing", field)),
                Some(actual) => match actual.as_f64() {
                    None => CheckOutcome::fail(format!("{} is not numeric: {}", field, actual)),
                    Some(actual) if operator.apply(actual, *value) => {
                        CheckOutcome::pass(format!("{} = {} {} {}", field, actual, operator.symbol(), value))
                    }
                    Some(actual) => CheckOutcome::fail(format!(
                        "{} = {} does not satisfy {} {}",
                        field,
                        actual,
                        operator.symbol(),
                        value
                    )),
                },
            },

            Checker::PatternAbsence { field, patterns } => {
                let values: Vec<String> = match lookup(params, field) {
                    None => return CheckOutcome::pass(format!("{} not present", field)),
                    Some(Value::Array(items)) => items.iter().map(value_text).collect(),
                    Some(other) => vec![value_text(other)],
                };

                let mut matched = Vec::new();
                for pattern in patterns {
                    let regex = match Regex::new(pattern) {
                        Ok(regex) => regex,
                        Err(e) => return CheckOutcome::fail(format!("invalid pattern '{}': {}", pattern, e)),
                    };
                    matched.extend(values.iter().filter(|v| regex.is_match(v)).cloned());
                }

                if matched.is_empty() {
                    CheckOutcome::pass(format!("no prohibited values in {}", field))
                } else {
                    matched.sort();
                    matched.dedup();
                    CheckOutcome::fail(format!("{} contains prohibited values: {}", field, matched.join(", ")))
                }
            }

            Checker::RequiredFields { fields } => {
                let missing: Vec<&str> = fields
                    .iter()
                    .filter(|f| !is_present(lookup(params, f)))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    CheckOutcome::pass("all required fields present")
                } else {
                    CheckOutcome::fail(format!("missing required fields: {}", missing.join(", ")))
                }
            }

            Checker::MaxAge { field, max_days } => {
                let Some(raw) = lookup(params, field) else {
                    return CheckOutcome::fail(format!("{} is missing", field));
                };
                let Some(parsed) = raw.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
                    return CheckOutcome::fail(format!("{} is not an RFC 3339 timestamp: {}", field, raw));
                };
                let age = now - parsed.with_timezone(&Utc);
                if age <= Duration::days(*max_days) {
                    CheckOutcome::pass(format!("{} is {} days old", field, age.num_days().max(0)))
                } else {
                    CheckOutcome::fail(format!(
                        "{} is {} days old, limit is {}",
                        field,
                        age.num_days(),
                        max_days
                    ))
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Checker::Threshold { field, value, .. } => {
                require_path(field)?;
                if !value.is_finite() {
                    return Err(format!("threshold for {} is not finite", field));
                }
            }
            Checker::PatternAbsence { field, patterns } => {
                require_path(field)?;
                if patterns.is_empty() {
                    return Err(format!("no patterns for {}", field));
                }
                for pattern in patterns {
                    Regex::new(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
                }
            }
            Checker::RequiredFields { fields } => {
                if fields.is_empty() {
                    return Err("required_fields lists no fields".to_string());
                }
                for field in fields {
                    require_path(field)?;
                }
            }
            Checker::MaxAge { field, max_days } => {
                require_path(field)?;
                if *max_days <= 0 {
                    return Err(format!("max_days for {} must be positive", field));
                }
            }
        }
        Ok(())
    }
}

fn require_path(path: &str) -> Result<(), String> {
    if path.split('.').any(|part| part.trim().is_empty()) {
        return Err(format!("invalid field path '{}'", path));
    }
    Ok(())
}

fn lookup<'a>(params: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = params.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub checker: Checker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRuleSet {
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub severity_levels: BTreeMap<Severity, Vec<String>>,
}

impl ComplianceRuleSet {
    /// Severity of `rule_id`; unlisted rules are low, and a rule listed at
    /// several levels takes the highest.
    pub fn severity_of(&self, rule_id: &str) -> Severity {
        Severity::ALL
            .into_iter()
            .find(|severity| {
                self.severity_levels
                    .get(severity)
                    .map_or(false, |ids| ids.iter().any(|id| id == rule_id))
            })
            .unwrap_or(Severity::Low)
    }

    pub fn validate(&self, framework: &str) -> Result<(), LedgerError> {
        let invalid = |msg: String| LedgerError::ConfigError(format!("Framework {}: {}", framework, msg));

        if self.rules.is_empty() {
            return Err(invalid("no rules defined".to_string()));
        }

        let mut ids = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(invalid("rule with empty id".to_string()));
            }
            if !ids.insert(rule.id.as_str()) {
                return Err(invalid(format!("duplicate rule id {}", rule.id)));
            }
            rule.checker
                .validate()
                .map_err(|e| invalid(format!("rule {}: {}", rule.id, e)))?;
        }

        for (severity, rule_ids) in &self.severity_levels {
            if let Some(unknown) = rule_ids.iter().find(|id| !ids.contains(id.as_str())) {
                return Err(invalid(format!(
                    "severity {} references unknown rule {}",
                    severity.as_str(),
                    unknown
                )));
            }
        }
        Ok(())
    }
}

/// Every configured framework by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCatalog {
    pub frameworks: BTreeMap<String, ComplianceRuleSet>,
}

impl RuleCatalog {
    pub fn get(&self, framework: &str) -> Option<&ComplianceRuleSet> {
        self.frameworks.get(framework)
    }

    pub fn framework_names(&self) -> Vec<String> {
        self.frameworks.keys().cloned().collect()
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.frameworks.is_empty() {
            return Err(LedgerError::ConfigError("No compliance frameworks defined".to_string()));
        }
        for (name, rule_set) in &self.frameworks {
            rule_set.validate(name)?;
        }
        Ok(())
    }

    /// The frameworks shipped with the service: `gdpr` and `hipaa`.
    pub fn builtin() -> Self {
        let mut frameworks = BTreeMap::new();
        frameworks.insert("gdpr".to_string(), gdpr());
        frameworks.insert("hipaa".to_string(), hipaa());
        Self { frameworks }
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn rule(id: &str, description: &str, checker: Checker) -> Rule {
    Rule {
        id: id.to_string(),
        description: description.to_string(),
        checker,
    }
}

fn levels(entries: &[(Severity, &[&str])]) -> BTreeMap<Severity, Vec<String>> {
    entries
        .iter()
        .map(|(severity, ids)| (*severity, ids.iter().map(|id| id.to_string()).collect()))
        .collect()
}

fn gdpr() -> ComplianceRuleSet {
    ComplianceRuleSet {
        rules: vec![
            rule(
                "data_minimization",
                "Only necessary data is collected",
                Checker::Threshold {
                    field: "unnecessary_fields".to_string(),
                    operator: ComparisonOp::Lte,
                    value: 0.0,
                },
            ),
            rule(
                "data_retention",
                "Personal data is not kept beyond the retention period",
                Checker::MaxAge {
                    field: "data_collected_at".to_string(),
                    max_days: 2555,
                },
            ),
            rule(
                "consent_tracking",
                "Consent is recorded for the processing",
                Checker::RequiredFields {
                    fields: vec!["consent_id".to_string(), "consent_timestamp".to_string()],
                },
            ),
            rule(
                "pii_detection",
                "No unmasked personal identifiers were detected",
                Checker::PatternAbsence {
                    field: "detected_patterns".to_string(),
                    patterns: vec![
                        r"(?i)^(ssn|social_security_number)$".to_string(),
                        r"(?i)^(credit_card|bank_account|iban)$".to_string(),
                        r"(?i)^(passport|national_id|drivers_license)$".to_string(),
                    ],
                },
            ),
            rule(
                "lawful_basis",
                "A lawful basis for processing is documented",
                Checker::RequiredFields {
                    fields: vec!["lawful_basis".to_string()],
                },
            ),
        ],
        severity_levels: levels(&[
            (Severity::High, &["pii_detection"]),
            (Severity::Medium, &["consent_tracking", "data_retention"]),
            (Severity::Low, &["data_minimization", "lawful_basis"]),
        ]),
    }
}

fn hipaa() -> ComplianceRuleSet {
    ComplianceRuleSet {
        rules: vec![
            rule(
                "phi_protection",
                "No protected health information was exposed",
                Checker::Threshold {
                    field: "phi_exposed_records".to_string(),
                    operator: ComparisonOp::Eq,
                    value: 0.0,
                },
            ),
            rule(
                "access_controls",
                "Role-based access controls are in place",
                Checker::RequiredFields {
                    fields: vec!["access_policy_id".to_string(), "role_based_access".to_string()],
                },
            ),
            rule(
                "audit_trail",
                "The audit trail was reviewed within the last year",
                Checker::MaxAge {
                    field: "last_audit_review".to_string(),
                    max_days: 365,
                },
            ),
            rule(
                "encryption",
                "Data is encrypted with keys of at least 128 bits",
                Checker::Threshold {
                    field: "encryption_key_bits".to_string(),
                    operator: ComparisonOp::Gte,
                    value: 128.0,
                },
            ),
        ],
        severity_levels: levels(&[
            (Severity::Critical, &["phi_protection"]),
            (Severity::High, &["access_controls", "encryption"]),
            (Severity::Medium, &["audit_trail"]),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_threshold() {
        let checker = Checker::Threshold {
            field: "metrics.errors".to_string(),
            operator: ComparisonOp::Lt,
            value: 5.0,
        };
        let now = Utc::now();
        assert!(checker.check(&params(json!({"metrics": {"errors": 2}})), now).passed);
        assert!(!checker.check(&params(json!({"metrics": {"errors": 5}})), now).passed);
        assert!(!checker.check(&params(json!({"metrics": {"errors": "two"}})), now).passed);
        assert!(!checker.check(&params(json!({})), now).passed);
    }

    #[test]
    fn test_pattern_absence() {
        let checker = Checker::PatternAbsence {
            field: "detected_patterns".to_string(),
            patterns: vec!["^ssn$".to_string()],
        };
        let now = Utc::now();
        assert!(checker.check(&params(json!({})), now).passed);
        assert!(checker.check(&params(json!({"detected_patterns": ["email"]})), now).passed);

        let outcome = checker.check(&params(json!({"detected_patterns": ["email", "ssn"]})), now);
        assert!(!outcome.passed);
        assert!(outcome.details.contains("ssn"));

        assert!(!checker.check(&params(json!({"detected_patterns": "ssn"})), now).passed);
    }

    #[test]
    fn test_required_fields() {
        let checker = Checker::RequiredFields {
            fields: vec!["consent_id".to_string(), "consent.timestamp".to_string()],
        };
        let now = Utc::now();
        let complete = params(json!({"consent_id": "c-1", "consent": {"timestamp": "2025-01-01T00:00:00Z"}}));
        assert!(checker.check(&complete, now).passed);

        let outcome = checker.check(&params(json!({"consent_id": "  "})), now);
        assert!(!outcome.passed);
        assert!(outcome.details.contains("consent_id"));
        assert!(outcome.details.contains("consent.timestamp"));
    }

    #[test]
    fn test_max_age() {
        let checker = Checker::MaxAge {
            field: "reviewed_at".to_string(),
            max_days: 30,
        };
        let now = Utc::now();
        let recent = (now - Duration::days(10)).to_rfc3339();
        let stale = (now - Duration::days(31)).to_rfc3339();

        assert!(checker.check(&params(json!({"reviewed_at": recent})), now).passed);
        assert!(!checker.check(&params(json!({"reviewed_at": stale})), now).passed);
        assert!(!checker.check(&params(json!({"reviewed_at": "last week"})), now).passed);
        assert!(!checker.check(&params(json!({})), now).passed);
    }

    #[test]
    fn test_severity_lookup() {
        let gdpr = gdpr();
        assert_eq!(gdpr.severity_of("pii_detection"), Severity::High);
        assert_eq!(gdpr.severity_of("consent_tracking"), Severity::Medium);
        assert_eq!(gdpr.severity_of("not_listed"), Severity::Low);

        let mut doubled = gdpr.clone();
        doubled
            .severity_levels
            .entry(Severity::Critical)
            .or_default()
            .push("consent_tracking".to_string());
        assert_eq!(doubled.severity_of("consent_tracking"), Severity::Critical);
    }

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = RuleCatalog::builtin();
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.framework_names(), vec!["gdpr", "hipaa"]);
        assert_eq!(catalog.get("hipaa").unwrap().severity_of("phi_protection"), Severity::Critical);
    }

    #[test]
    fn test_validation_catches_bad_rules() {
        let mut catalog = RuleCatalog::builtin();
        catalog
            .frameworks
            .get_mut("gdpr")
            .unwrap()
            .severity_levels
            .insert(Severity::Critical, vec!["ghost_rule".to_string()]);
        assert!(matches!(catalog.validate(), Err(LedgerError::ConfigError(_))));

        let bad_regex = ComplianceRuleSet {
            rules: vec![rule(
                "broken",
                "",
                Checker::PatternAbsence {
                    field: "x".to_string(),
                    patterns: vec!["(unclosed".to_string()],
                },
            )],
            severity_levels: BTreeMap::new(),
        };
        assert!(bad_regex.validate("custom").is_err());
    }

    #[test]
    fn test_checker_yaml_shape() {
        let yaml = r#"
id: pii_detection
checker:
  kind: pattern_absence
  field: detected_patterns
  patterns: ["^ssn$"]
"#;
        let parsed: Rule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.checker.kind(), "pattern_absence");
        assert_eq!(parsed.description, "");
    }
}
