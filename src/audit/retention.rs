//! Retention Manager
//!
//! Applies per-category retention windows. A purge can only remove a
//! contiguous prefix of the ledger: removing anything from the middle would
//! orphan every later `previous_hash`. The removed span is summarized in a
//! retention anchor so the retained chain still verifies from its new start.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{info, warn};

use crate::audit::entry::{format_timestamp, LogEntry, LOG_PURGE_ACTION};
use crate::audit::ledger::AuditLedger;
use crate::audit::query::QueryEngine;
use crate::audit::run_blocking;
use crate::audit::store::RetentionAnchor;
use crate::error::LedgerError;

const RETENTION_ACTOR: &str = "retention_manager";

/// Category → retention window in days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub categories: BTreeMap<String, u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        let categories = [
            ("auth", 365),
            ("document", 2555),
            ("orchestrator", 90),
            ("compliance", 2555),
            ("retention", 2555),
            ("general", 180),
        ]
        .into_iter()
        .map(|(name, days)| (name.to_string(), days))
        .collect();
        Self { categories }
    }
}

impl RetentionPolicy {
    pub fn retention_days(&self, category: &str) -> Option<u32> {
        self.categories.get(category).copied()
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.categories.is_empty() {
            return Err(LedgerError::ConfigError(
                "Retention policy defines no categories".to_string(),
            ));
        }
        for (category, days) in &self.categories {
            if category.trim().is_empty() {
                return Err(LedgerError::ConfigError("Empty retention category name".to_string()));
            }
            if *days == 0 {
                return Err(LedgerError::ConfigError(format!(
                    "Retention days for '{}' must be greater than zero",
                    category
                )));
            }
        }
        Ok(())
    }

    /// True when `entry` is past the window of its own category. Categories
    /// without a policy are never expired.
    pub fn is_expired(&self, entry: &LogEntry, now: DateTime<Utc>) -> bool {
        self.retention_days(entry.category())
            .map_or(false, |days| entry.timestamp < now - Duration::days(i64::from(days)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeOutcome {
    pub category: String,
    pub retention_days: u32,
    pub cutoff_date: String,
    /// Entries of the category older than the cutoff.
    pub count: usize,
    pub dry_run: bool,
    /// Entries physically removed; may include expired entries of other
    /// categories that sat in the same leading span.
    pub removed_total: usize,
    pub anchor: Option<RetentionAnchor>,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct RetentionManager {
    ledger: AuditLedger,
    query: QueryEngine,
    policy: Arc<RwLock<RetentionPolicy>>,
}

impl RetentionManager {
    pub fn new(ledger: AuditLedger, policy: RetentionPolicy) -> Self {
        Self {
            query: QueryEngine::new(ledger.clone()),
            ledger,
            policy: Arc::new(RwLock::new(policy)),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace_policy(&self, policy: RetentionPolicy) -> Result<(), LedgerError> {
        policy.validate()?;
        *self
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
        info!("Retention policy replaced");
        Ok(())
    }

    pub async fn purge(
        &self,
        category: &str,
        dry_run: bool,
        deadline: Option<Instant>,
    ) -> Result<PurgeOutcome, LedgerError> {
        self.purge_at(category, dry_run, deadline, Utc::now()).await
    }

    /// Apply the policy as of `now`.
    pub async fn purge_at(
        &self,
        category: &str,
        dry_run: bool,
        deadline: Option<Instant>,
        now: DateTime<Utc>,
    ) -> Result<PurgeOutcome, LedgerError> {
        let policy = self.policy();
        let retention_days = policy
            .retention_days(category)
            .ok_or_else(|| LedgerError::unknown_category(category))?;
        let cutoff = now - Duration::days(i64::from(retention_days));

        let query = self.query.clone();
        let scanned_category = category.to_string();
        let (count, scan) = run_blocking(move || {
            let mut count: usize = 0;
            let scan = query.scan(None, Some(cutoff), deadline, |entry| {
                if entry.category() == scanned_category && entry.timestamp < cutoff {
                    count += 1;
                }
                ControlFlow::Continue(())
            })?;
            Ok((count, scan))
        })
        .await?;

        let mut outcome = PurgeOutcome {
            category: category.to_string(),
            retention_days,
            cutoff_date: format_timestamp(&cutoff),
            count,
            dry_run,
            removed_total: 0,
            anchor: None,
            truncated: scan.truncated,
        };

        if dry_run {
            info!(
                "Retention preview for '{}': {} entries older than {}",
                category, count, outcome.cutoff_date
            );
            return Ok(outcome);
        }

        if scan.truncated {
            warn!("Retention scan for '{}' hit its deadline; nothing purged", category);
            return Ok(outcome);
        }

        let anchor = self
            .ledger
            .discard_prefix(category, |entry| {
                (entry.category() == category && entry.timestamp < cutoff)
                    || policy.is_expired(entry, now)
            })
            .await?;

        outcome.removed_total = anchor.as_ref().map_or(0, |a| a.removed_count);
        outcome.anchor = anchor;
        if outcome.removed_total < outcome.count {
            info!(
                "{} expired '{}' entries sit behind retained entries and were kept",
                outcome.count - outcome.removed_total,
                category
            );
        }

        self.record(&outcome).await?;
        Ok(outcome)
    }

    async fn record(&self, outcome: &PurgeOutcome) -> Result<(), LedgerError> {
        let mut details = Map::new();
        details.insert("category".to_string(), json!(outcome.category));
        details.insert("retention_days".to_string(), json!(outcome.retention_days));
        details.insert("cutoff_date".to_string(), json!(outcome.cutoff_date));
        details.insert("count".to_string(), json!(outcome.count));
        details.insert("dry_run".to_string(), json!(outcome.dry_run));
        details.insert("removed_total".to_string(), json!(outcome.removed_total));
        details.insert("truncated".to_string(), json!(outcome.truncated));
        details.insert(
            "anchor".to_string(),
            outcome
                .anchor
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?
                .unwrap_or(Value::Null),
        );

        self.ledger
            .log_action(LOG_PURGE_ACTION, RETENTION_ACTOR, &outcome.category, "purged", details, Map::new())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ledger::LedgerOptions;
    use crate::audit::store;
    use crate::audit::verify::ChainVerifier;
    use crate::crypto::signing::test_signer;
    use tempfile::tempdir;

    fn ledger(dir: &tempfile::TempDir) -> AuditLedger {
        AuditLedger::open(LedgerOptions::new(dir.path().join("audit.jsonl")), test_signer()).unwrap()
    }

    async fn log(ledger: &AuditLedger, action_type: &str, target: &str) {
        ledger
            .log_action(action_type, "tester", target, "success", Map::new(), Map::new())
            .await
            .unwrap();
    }

    fn persisted_count(ledger: &AuditLedger) -> usize {
        store::for_each_entry(ledger.path(), 0, |_| ControlFlow::Continue(()))
            .unwrap()
            .parsed
    }

    #[test]
    fn test_default_policy() {
        let policy = RetentionPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.retention_days("auth"), Some(365));
        assert_eq!(policy.retention_days("orchestrator"), Some(90));
        assert_eq!(policy.retention_days("unknown"), None);
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = RetentionPolicy::default();
        policy.categories.insert("auth".to_string(), 0);
        assert!(matches!(policy.validate(), Err(LedgerError::ConfigError(_))));

        let empty = RetentionPolicy { categories: BTreeMap::new() };
        assert!(empty.validate().is_err());
    }

    #[tokio::test]
    async fn test_unknown_category() {
        let dir = tempdir().unwrap();
        let manager = RetentionManager::new(ledger(&dir), RetentionPolicy::default());
        let err = manager.purge("payroll", true, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFoundError(_)));
    }

    #[tokio::test]
    async fn test_dry_run_only_counts() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);
        for target in ["a", "b", "c"] {
            log(&ledger, "orchestrator_job", target).await;
        }
        let manager = RetentionManager::new(ledger.clone(), RetentionPolicy::default());

        let now = Utc::now() + Duration::days(91);
        let outcome = manager.purge_at("orchestrator", true, None, now).await.unwrap();
        assert_eq!(outcome.count, 3);
        assert_eq!(outcome.retention_days, 90);
        assert_eq!(outcome.removed_total, 0);
        assert!(outcome.anchor.is_none());

        // A preview writes nothing
        assert_eq!(persisted_count(&ledger), 3);
        assert_eq!(ledger.cache_snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_expired_deadline_purges_nothing() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);
        for target in ["a", "b"] {
            log(&ledger, "orchestrator_job", target).await;
        }
        let manager = RetentionManager::new(ledger.clone(), RetentionPolicy::default());

        let now = Utc::now() + Duration::days(91);
        let outcome = manager
            .purge_at("orchestrator", false, Some(Instant::now()), now)
            .await
            .unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.removed_total, 0);
        assert!(outcome.anchor.is_none());
        assert_eq!(persisted_count(&ledger), 2);
        assert!(store::read_anchors(&ledger.anchors_path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_removes_prefix_and_keeps_chain_verifiable() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);
        log(&ledger, "orchestrator_job", "a").await;
        log(&ledger, "orchestrator_job", "b").await;
        log(&ledger, "auth_login", "user").await;
        log(&ledger, "orchestrator_job", "c").await;
        let manager = RetentionManager::new(ledger.clone(), RetentionPolicy::default());

        // Past the orchestrator window, inside the auth window
        let now = Utc::now() + Duration::days(100);
        let outcome = manager.purge_at("orchestrator", false, None, now).await.unwrap();

        assert_eq!(outcome.count, 3);
        assert_eq!(outcome.removed_total, 2);
        let anchor = outcome.anchor.clone().unwrap();
        assert_eq!((anchor.first_sequence, anchor.last_sequence), (1, 2));
        assert_eq!(store::read_anchors(&ledger.anchors_path()).unwrap(), vec![anchor.clone()]);

        let remaining: Vec<LogEntry> = {
            let mut entries = Vec::new();
            store::for_each_entry(ledger.path(), 0, |e| {
                entries.push(e);
                ControlFlow::Continue(())
            })
            .unwrap();
            entries
        };
        assert_eq!(remaining[0].action_type, "auth_login");
        assert_eq!(remaining[0].previous_hash, Some(anchor.anchor_hash.clone()));
        let purge_entry = remaining.last().unwrap();
        assert_eq!(purge_entry.action_type, LOG_PURGE_ACTION);
        assert_eq!(purge_entry.details["anchor"]["anchor_hash"], json!(anchor.anchor_hash));

        let report = ChainVerifier::new(ledger.clone()).verify_range(None, None, None).unwrap();
        assert!(report.chain_valid, "{:?}", report.broken_links);
        assert!(report.all_verified);
        assert_eq!(report.entries_checked, 3);
    }

    #[tokio::test]
    async fn test_expired_entries_of_other_categories_extend_prefix() {
        let dir = tempdir().unwrap();
        let ledger = ledger(&dir);
        log(&ledger, "general_event", "x").await;
        log(&ledger, "orchestrator_job", "a").await;
        log(&ledger, "document.parse", "doc").await;
        let manager = RetentionManager::new(ledger.clone(), RetentionPolicy::default());

        // general (180 days) has expired too; document (2555) has not
        let now = Utc::now() + Duration::days(200);
        let outcome = manager.purge_at("orchestrator", false, None, now).await.unwrap();
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.removed_total, 2);
    }

    #[tokio::test]
    async fn test_replace_policy_validates() {
        let dir = tempdir().unwrap();
        let manager = RetentionManager::new(ledger(&dir), RetentionPolicy::default());

        let mut policy = RetentionPolicy::default();
        policy.categories.insert("payroll".to_string(), 30);
        manager.replace_policy(policy).unwrap();
        assert_eq!(manager.policy().retention_days("payroll"), Some(30));

        let bad = RetentionPolicy { categories: BTreeMap::new() };
        assert!(manager.replace_policy(bad).is_err());
        assert_eq!(manager.policy().retention_days("payroll"), Some(30));
    }
}
