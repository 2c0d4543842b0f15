//! Ledger Service
//!
//! Owns one ledger and the components built on it. Everything that talks to
//! the ledger from outside (HTTP handlers, `ledger-admin`) goes through here,
//! either through the typed methods or the closed [`Operation`] dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::audit::ledger::{ActionRecord, AuditLedger, IngestReceipt, LedgerStats};
use crate::audit::run_blocking;
use crate::audit::query::{parse_time, QueryEngine, QueryRequest, QueryResult};
use crate::audit::retention::{PurgeOutcome, RetentionManager};
use crate::audit::verify::{ChainVerifier, EntryVerification, RangeVerification};
use crate::compliance::engine::{ComplianceCheckResult, ComplianceEngine};
use crate::compliance::report::{ComplianceReport, ReportPeriod};
use crate::config::loader::{PolicyCache, PolicyFiles};
use crate::config::AppConfig;
use crate::crypto::{PublicKeyInfo, SigningService};
use crate::error::LedgerError;

fn deadline_after(timeout_ms: Option<u64>) -> Option<Instant> {
    timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub framework: String,
    pub target_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub framework: String,
    pub period: ReportPeriod,
}

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub category: String,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub key_id: String,
    pub frameworks: Vec<String>,
    pub ledger: LedgerStats,
}

/// Every operation the service supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Health,
    Ingest(ActionRecord),
    Query(QueryRequest),
    VerifyEntry { log_id: String },
    VerifyRange(RangeRequest),
    PublicKey,
    Evaluate(EvaluateRequest),
    Report(ReportRequest),
    Purge(PurgeRequest),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Health => "health",
            Operation::Ingest(_) => "ingest",
            Operation::Query(_) => "query",
            Operation::VerifyEntry { .. } => "verify_entry",
            Operation::VerifyRange(_) => "verify_range",
            Operation::PublicKey => "public_key",
            Operation::Evaluate(_) => "evaluate",
            Operation::Report(_) => "report",
            Operation::Purge(_) => "purge",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "operation", content = "result", rename_all = "snake_case")]
pub enum OperationResponse {
    Health(HealthStatus),
    Ingest(IngestReceipt),
    Query(QueryResult),
    VerifyEntry(EntryVerification),
    VerifyRange(RangeVerification),
    PublicKey(PublicKeyInfo),
    Evaluate(ComplianceCheckResult),
    Report(ComplianceReport),
    Purge(PurgeOutcome),
}

pub struct LedgerService {
    ledger: AuditLedger,
    query: QueryEngine,
    verifier: ChainVerifier,
    compliance: ComplianceEngine,
    retention: RetentionManager,
    policies: Option<Mutex<PolicyCache>>,
}

impl LedgerService {
    pub fn new(ledger: AuditLedger, policies: PolicyFiles) -> Self {
        Self {
            query: QueryEngine::new(ledger.clone()),
            verifier: ChainVerifier::new(ledger.clone()),
            compliance: ComplianceEngine::new(ledger.clone(), policies.compliance),
            retention: RetentionManager::new(ledger.clone(), policies.retention),
            ledger,
            policies: None,
        }
    }

    /// Load keys and policies and open the ledger described by `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, LedgerError> {
        let signer = Arc::new(SigningService::load_or_generate(&config.key_dir, config.key_bits)?);
        let ledger = AuditLedger::open(config.ledger_options(), signer)?;

        let policies = match &config.policy_dir {
            Some(dir) => PolicyFiles::load_from_directory(dir)?,
            None => PolicyFiles::default(),
        };

        let mut service = Self::new(ledger, policies.clone());
        service.compliance = service
            .compliance
            .clone()
            .with_report_sample_size(config.report_sample_size);
        if let Some(dir) = &config.policy_dir {
            service.policies = Some(Mutex::new(PolicyCache::new(
                policies,
                dir.clone(),
                config.policy_auto_reload,
            )));
        }
        Ok(service)
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    pub fn compliance(&self) -> &ComplianceEngine {
        &self.compliance
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "healthy".to_string(),
            service: "audit-ledger".to_string(),
            timestamp: Utc::now(),
            key_id: self.ledger.signer().key_id().to_string(),
            frameworks: self.compliance.catalog().framework_names(),
            ledger: self.ledger.stats().await,
        }
    }

    pub async fn ingest(&self, record: ActionRecord) -> Result<IngestReceipt, LedgerError> {
        let entry = self.ledger.append(record).await?;
        Ok(IngestReceipt::from(&entry))
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult, LedgerError> {
        let query = request.resolve()?;
        self.query.query(&query).await
    }

    pub async fn verify_entry(&self, log_id: &str) -> Result<EntryVerification, LedgerError> {
        let verifier = self.verifier.clone();
        let log_id = log_id.to_string();
        run_blocking(move || verifier.verify_entry(&log_id)).await
    }

    pub async fn verify_range(&self, request: &RangeRequest) -> Result<RangeVerification, LedgerError> {
        let start = parse_time("start_time", request.start_time.as_deref())?;
        let end = parse_time("end_time", request.end_time.as_deref())?;
        let deadline = deadline_after(request.timeout_ms);

        let verifier = self.verifier.clone();
        run_blocking(move || verifier.verify_range(start, end, deadline)).await
    }

    pub fn public_key(&self) -> PublicKeyInfo {
        self.ledger.signer().public_key()
    }

    pub async fn evaluate(&self, request: &EvaluateRequest) -> Result<ComplianceCheckResult, LedgerError> {
        self.compliance
            .evaluate(&request.framework, &request.target_id, &request.params)
            .await
    }

    pub async fn report(&self, request: &ReportRequest) -> Result<ComplianceReport, LedgerError> {
        self.compliance
            .generate_report(&request.framework, &request.period)
            .await
    }

    pub async fn purge(&self, request: &PurgeRequest) -> Result<PurgeOutcome, LedgerError> {
        self.retention
            .purge(&request.category, request.dry_run, deadline_after(request.timeout_ms))
            .await
    }

    pub async fn dispatch(&self, operation: Operation) -> Result<OperationResponse, LedgerError> {
        let name = operation.name();
        let response = match operation {
            Operation::Health => Ok(OperationResponse::Health(self.health().await)),
            Operation::Ingest(record) => self.ingest(record).await.map(OperationResponse::Ingest),
            Operation::Query(request) => self.query(&request).await.map(OperationResponse::Query),
            Operation::VerifyEntry { log_id } => {
                self.verify_entry(&log_id).await.map(OperationResponse::VerifyEntry)
            }
            Operation::VerifyRange(request) => {
                self.verify_range(&request).await.map(OperationResponse::VerifyRange)
            }
            Operation::PublicKey => Ok(OperationResponse::PublicKey(self.public_key())),
            Operation::Evaluate(request) => self.evaluate(&request).await.map(OperationResponse::Evaluate),
            Operation::Report(request) => self.report(&request).await.map(OperationResponse::Report),
            Operation::Purge(request) => self.purge(&request).await.map(OperationResponse::Purge),
        };

        if let Err(e) = &response {
            if matches!(e, LedgerError::ProcessingError(_) | LedgerError::ConfigError(_)) {
                error!("Operation {} failed: {}", name, e);
            }
        }
        response
    }

    /// Reload policy files if any changed on disk. Returns whether new
    /// policies were applied.
    pub fn reload_policies_if_changed(&self) -> Result<bool, LedgerError> {
        let Some(cache) = &self.policies else {
            return Ok(false);
        };
        let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !cache.needs_reload() {
            return Ok(false);
        }

        let policies = cache.reload()?.clone();
        self.compliance.replace_catalog(policies.compliance)?;
        self.retention.replace_policy(policies.retention)?;
        info!("Applied reloaded ledger policies");
        Ok(true)
    }

    pub async fn close(&self) -> Result<(), LedgerError> {
        self.ledger.close().await
    }
}
