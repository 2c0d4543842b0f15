//! Queries and reports that span the cache and the ledger file

use audit_ledger::audit::query::{QueryRequest, QueryResult};
use audit_ledger::compliance::report::ReportPeriod;
use audit_ledger::service::ReportRequest;
use audit_ledger::LedgerService;
use serde_json::{json, Map};
use std::collections::HashSet;
use tempfile::TempDir;

mod common;
use common::*;

const FRAMEWORKS: [&str; 6] = ["gdpr", "hipaa", "gdpr", "gdpr", "hipaa", "gdpr"];

async fn record_checks(service: &LedgerService) -> Vec<String> {
    let mut gdpr_ids = Vec::new();
    for (i, framework) in FRAMEWORKS.iter().enumerate() {
        let status = if i % 3 == 0 { "high_violation" } else { "compliant" };
        let entry = service
            .ledger()
            .log_action(
                "compliance.check",
                "compliance_engine",
                &format!("doc-{}", i),
                status,
                details(json!({"compliance_type": framework, "overall_status": status})),
                Map::new(),
            )
            .await
            .unwrap();
        if *framework == "gdpr" {
            gdpr_ids.push(entry.log_id);
        }
    }
    gdpr_ids
}

async fn gdpr_page(service: &LedgerService, offset: usize) -> QueryResult {
    service
        .query(&QueryRequest {
            filters: details(json!({
                "action_type": "compliance.check",
                "details.compliance_type": "gdpr"
            })),
            limit: 2,
            offset,
            ..QueryRequest::default()
        })
        .await
        .unwrap()
}

async fn all_gdpr_ids(service: &LedgerService) -> Vec<String> {
    let first = gdpr_page(service, 0).await;
    assert_eq!(first.total, 4);
    assert_eq!(first.count, 2);
    assert!(first.has_more);

    let second = gdpr_page(service, 2).await;
    assert_eq!(second.total, 4);
    assert_eq!(second.count, 2);
    assert!(!second.has_more);

    let past_end = gdpr_page(service, 4).await;
    assert_eq!(past_end.count, 0);
    assert!(!past_end.has_more);

    let entries: Vec<_> = first.entries.into_iter().chain(second.entries).collect();
    for pair in entries.windows(2) {
        assert!(
            (pair[0].timestamp, pair[0].sequence) > (pair[1].timestamp, pair[1].sequence),
            "entries must be newest first"
        );
    }
    entries.into_iter().map(|e| e.log_id).collect()
}

#[tokio::test]
async fn test_query_merges_cache_and_file_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let service = small_cache_service(&dir, 2);
    let mut expected = record_checks(&service).await;
    expected.reverse();
    assert!(!service.ledger().cache_is_complete());

    let ids = all_gdpr_ids(&service).await;
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    assert_eq!(ids, expected);

    // After a restart only the file knows the older entries
    drop(service);
    let reopened = small_cache_service(&dir, 2);
    assert_eq!(all_gdpr_ids(&reopened).await, expected);
}

#[tokio::test]
async fn test_report_counts_each_check_once() {
    let dir = TempDir::new().unwrap();
    let service = small_cache_service(&dir, 2);
    record_checks(&service).await;

    for _ in 0..2 {
        let report = service
            .report(&ReportRequest {
                framework: "gdpr".to_string(),
                period: ReportPeriod::Day,
            })
            .await
            .unwrap();

        assert_eq!(report.total_checks, 4);
        // doc-0 and doc-3 are violations
        assert_eq!(report.violation_checks, 2);
        assert_eq!(report.compliant_checks, 2);
        assert_eq!(report.distinct_targets, 4);
        assert_eq!(report.sample_entries[0].target, "doc-5");
        assert!(report
            .sample_entries
            .iter()
            .all(|e| e.details["compliance_type"] == json!("gdpr")));
    }
}
