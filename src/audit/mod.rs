//! Audit Ledger
//!
//! Append-only, hash-chained and signed record of every action reported to
//! the service, with querying, verification and retention on top.

pub mod entry;
pub mod ledger;
pub mod merkle;
pub mod query;
pub mod retention;
pub mod sequencer;
pub mod store;
pub mod verify;

pub use entry::LogEntry;
pub use ledger::{ActionRecord, AuditLedger, IngestReceipt, LedgerOptions, LedgerStats};
pub use query::{LogQuery, QueryEngine, QueryRequest, QueryResult};
pub use retention::{PurgeOutcome, RetentionManager, RetentionPolicy};
pub use sequencer::{LogSequencer, RecoverySource};
pub use store::{Checkpoint, RetentionAnchor};
pub use verify::{ChainVerifier, ChainWalker, EntryVerification, RangeVerification};

use crate::error::LedgerError;

/// Run file-bound ledger work off the async executor.
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| LedgerError::ProcessingError(format!("Blocking ledger task failed: {}", e)))?
}
