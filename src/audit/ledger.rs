//! Audit Ledger
//!
//! The single writer of the append-only JSONL ledger. Every append runs
//! inside one serialized section that assigns the sequence number, links
//! the previous hash, signs, and durably persists the entry before it is
//! cached or acknowledged.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::audit::entry::{validate_action_type, LogEntry};
use crate::audit::merkle;
use crate::audit::sequencer::{LogSequencer, RecoverySource};
use crate::audit::store::{self, Checkpoint, RetentionAnchor};
use crate::crypto::SigningService;
use crate::error::LedgerError;

pub const DEFAULT_CACHE_SIZE: usize = 1000;
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 100;
pub const DEFAULT_TAIL_SCAN_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub path: PathBuf,
    pub cache_size: usize,
    /// Entries between checkpoint records; 0 disables periodic checkpoints.
    pub checkpoint_interval: u64,
    pub tail_scan_bytes: u64,
    pub fsync: bool,
}

impl LedgerOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_size: DEFAULT_CACHE_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            tail_scan_bytes: DEFAULT_TAIL_SCAN_BYTES,
            fsync: true,
        }
    }
}

/// An action submitted by a collaborator for recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ActionRecord {
    pub fn new(
        action_type: impl Into<String>,
        actor_id: impl Into<String>,
        target: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            actor_id: actor_id.into(),
            target: target.into(),
            result: result.into(),
            details: Map::new(),
            context: Map::new(),
        }
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        validate_action_type(&self.action_type)?;
        for (name, value) in [
            ("actor_id", &self.actor_id),
            ("target", &self.target),
            ("result", &self.result),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::missing_field(name));
            }
        }
        Ok(())
    }
}

/// Acknowledgement returned to ingest callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub log_id: String,
    pub sequence: u64,
    pub timestamp: String,
    pub status: String,
}

impl From<&LogEntry> for IngestReceipt {
    fn from(entry: &LogEntry) -> Self {
        Self {
            log_id: entry.log_id.clone(),
            sequence: entry.sequence,
            timestamp: crate::audit::entry::format_timestamp(&entry.timestamp),
            status: "logged".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStats {
    pub path: String,
    pub head_sequence: Option<u64>,
    pub head_hash: Option<String>,
    pub next_sequence: u64,
    pub cached_entries: usize,
    pub cache_capacity: usize,
    pub cache_complete: bool,
    pub recovered_from: RecoverySource,
}

struct WriterState {
    file: File,
    head_hash: Option<String>,
    head_sequence: Option<u64>,
    since_checkpoint: u64,
}

struct Inner {
    options: LedgerOptions,
    signer: Arc<SigningService>,
    sequencer: LogSequencer,
    recovered_from: RecoverySource,
    writer: Mutex<WriterState>,
    cache: RwLock<VecDeque<LogEntry>>,
    cache_complete: AtomicBool,
}

/// Append-only, hash-chained, signed audit ledger.
#[derive(Clone)]
pub struct AuditLedger {
    inner: Arc<Inner>,
}

impl AuditLedger {
    /// Open (or create) the ledger at `options.path` and recover its head.
    pub fn open(options: LedgerOptions, signer: Arc<SigningService>) -> Result<Self, LedgerError> {
        store::repair_torn_tail(&options.path)?;
        let (sequencer, recovery) = LogSequencer::recover(&options.path, options.tail_scan_bytes)?;
        let file = store::open_append(&options.path)?;

        info!(
            "Audit ledger opened at {:?} (next sequence {}, recovered from {:?})",
            options.path, recovery.next_sequence, recovery.source
        );

        Ok(Self {
            inner: Arc::new(Inner {
                cache_complete: AtomicBool::new(recovery.source == RecoverySource::Fresh),
                recovered_from: recovery.source,
                writer: Mutex::new(WriterState {
                    file,
                    head_hash: recovery.head_hash,
                    head_sequence: recovery.last_sequence,
                    since_checkpoint: 0,
                }),
                cache: RwLock::new(VecDeque::with_capacity(options.cache_size.min(4096))),
                options,
                signer,
                sequencer,
            }),
        })
    }

    /// Record an action. Returns only once the entry is durably persisted.
    pub async fn log_action(
        &self,
        action_type: &str,
        actor_id: &str,
        target: &str,
        result: &str,
        details: Map<String, Value>,
        context: Map<String, Value>,
    ) -> Result<LogEntry, LedgerError> {
        let record = ActionRecord::new(action_type, actor_id, target, result)
            .with_details(details)
            .with_context(context);
        self.append(record).await
    }

    pub async fn append(&self, record: ActionRecord) -> Result<LogEntry, LedgerError> {
        record.validate()?;

        let mut writer = self.inner.writer.lock().await;
        let sequence = self.inner.sequencer.next_sequence();

        let entry = LogEntry::new(
            sequence,
            record.action_type,
            record.actor_id,
            record.target,
            record.result,
            record.details,
            record.context,
            writer.head_hash.clone(),
        );

        let signature = self.inner.signer.sign(&entry.hash).map_err(|e| {
            error!("Failed to sign audit entry #{}: {}", sequence, e);
            e
        })?;
        let entry = entry.with_signature(signature);

        let line = serde_json::to_string(&entry)?;
        let offset = store::append_line(&mut writer.file, &line, self.inner.options.fsync)
            .map_err(|e| {
                error!("Failed to persist audit entry #{}: {}", sequence, e);
                LedgerError::ProcessingError(format!(
                    "Failed to persist audit entry {}: {}",
                    entry.log_id, e
                ))
            })?;

        writer.head_hash = Some(entry.hash.clone());
        writer.head_sequence = Some(sequence);
        writer.since_checkpoint += 1;

        let interval = self.inner.options.checkpoint_interval;
        if interval > 0 && writer.since_checkpoint >= interval {
            match self.write_checkpoint(&writer, offset) {
                Ok(()) => writer.since_checkpoint = 0,
                Err(e) => warn!("Failed to write ledger checkpoint: {}", e),
            }
        }

        self.push_cache(entry.clone());
        drop(writer);

        debug!("Appended audit entry: {}", entry.summary());
        Ok(entry)
    }

    fn write_checkpoint(&self, writer: &WriterState, offset: u64) -> Result<(), LedgerError> {
        let Some(sequence) = writer.head_sequence else {
            return Ok(());
        };
        store::write_checkpoint(
            &store::checkpoint_path(&self.inner.options.path),
            &Checkpoint {
                sequence,
                hash: writer.head_hash.clone(),
                offset,
                written_at: Utc::now(),
            },
        )
    }

    fn push_cache(&self, entry: LogEntry) {
        let mut cache = self
            .inner
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.push_back(entry);
        while cache.len() > self.inner.options.cache_size {
            cache.pop_front();
            self.inner.cache_complete.store(false, Ordering::Release);
        }
    }

    /// Copy of the most recent cached entries, oldest first.
    pub fn cache_snapshot(&self) -> Vec<LogEntry> {
        let cache = self
            .inner
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.iter().cloned().collect()
    }

    /// True while the cache holds every entry in the ledger file.
    pub fn cache_is_complete(&self) -> bool {
        self.inner.cache_complete.load(Ordering::Acquire)
    }

    /// Get current head sequence and hash
    pub async fn head(&self) -> (Option<u64>, Option<String>) {
        let writer = self.inner.writer.lock().await;
        (writer.head_sequence, writer.head_hash.clone())
    }

    /// Look up an entry as persisted on disk. The cache is never consulted so
    /// that verification always sees what is actually stored.
    pub fn find(&self, log_id: &str) -> Result<Option<LogEntry>, LedgerError> {
        let mut found = None;
        store::for_each_entry(&self.inner.options.path, 0, |entry| {
            if entry.log_id == log_id {
                found = Some(entry);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found)
    }

    pub fn path(&self) -> &Path {
        &self.inner.options.path
    }

    pub fn anchors_path(&self) -> PathBuf {
        store::anchors_path(&self.inner.options.path)
    }

    pub fn signer(&self) -> &Arc<SigningService> {
        &self.inner.signer
    }

    pub async fn stats(&self) -> LedgerStats {
        let (head_sequence, head_hash) = self.head().await;
        let cached_entries = self
            .inner
            .cache
            .read()
            .map(|cache| cache.len())
            .unwrap_or_default();

        LedgerStats {
            path: self.inner.options.path.display().to_string(),
            head_sequence,
            head_hash,
            next_sequence: self.inner.sequencer.peek(),
            cached_entries,
            cache_capacity: self.inner.options.cache_size,
            cache_complete: self.cache_is_complete(),
            recovered_from: self.inner.recovered_from,
        }
    }

    /// Remove the leading run of entries accepted by `removable` and record
    /// a retention anchor for it. Retained lines are kept byte-for-byte.
    pub(crate) async fn discard_prefix<F>(
        &self,
        category: &str,
        removable: F,
    ) -> Result<Option<RetentionAnchor>, LedgerError>
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let mut writer = self.inner.writer.lock().await;
        let path = self.inner.options.path.clone();

        let scan = store::scan_prefix(&path, removable)?;
        let (Some(first_sequence), Some(last_sequence), Some(anchor_hash)) =
            (scan.first_sequence, scan.last_sequence, scan.hashes.last().cloned())
        else {
            return Ok(None);
        };

        let anchor = RetentionAnchor {
            anchor_hash,
            span_digest: merkle::get_merkle_root(&scan.hashes)?,
            first_sequence,
            last_sequence,
            removed_count: scan.hashes.len(),
            category: category.to_string(),
            created_at: Utc::now(),
        };

        // Anchor first: a crash before truncation leaves a harmless extra anchor
        store::append_anchor(&store::anchors_path(&path), &anchor)?;

        let checkpoint = store::checkpoint_path(&path);
        if checkpoint.exists() {
            std::fs::remove_file(&checkpoint)?;
        }

        store::truncate_front(&path, scan.retain_offset)?;
        writer.file = store::open_append(&path)?;
        let len = writer.file.metadata()?.len();
        match self.write_checkpoint(&writer, len) {
            Ok(()) => writer.since_checkpoint = 0,
            Err(e) => warn!("Failed to write ledger checkpoint after purge: {}", e),
        }

        let removed: HashSet<&String> = scan.hashes.iter().collect();
        {
            let mut cache = self
                .inner
                .cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.retain(|entry| !removed.contains(&entry.hash));
        }

        info!(
            "Discarded ledger prefix #{}..#{} ({} entries), anchor {}",
            anchor.first_sequence, anchor.last_sequence, anchor.removed_count, anchor.anchor_hash
        );
        Ok(Some(anchor))
    }

    /// Flush outstanding data and record a checkpoint at the current head.
    pub async fn close(&self) -> Result<(), LedgerError> {
        let mut writer = self.inner.writer.lock().await;
        writer
            .file
            .sync_all()
            .map_err(|e| LedgerError::ProcessingError(format!("Failed to flush ledger on close: {}", e)))?;
        let len = writer.file.metadata()?.len();
        self.write_checkpoint(&writer, len)?;
        writer.since_checkpoint = 0;
        Ok(())
    }
}
