//! Log Sequencer
//!
//! Hands out strictly increasing sequence numbers and recovers the chain
//! head after a restart. Recovery prefers the checkpoint file and only falls
//! back to a bounded tail scan of the ledger when no usable checkpoint
//! exists.

use chrono::Utc;
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::audit::store;
use crate::error::LedgerError;

/// Where the recovered head came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    Fresh,
    Checkpoint,
    TailScan,
    TimestampFallback,
}

/// Chain head recovered from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub next_sequence: u64,
    pub last_sequence: Option<u64>,
    pub head_hash: Option<String>,
    pub source: RecoverySource,
}

impl Recovery {
    fn from_last(sequence: u64, hash: Option<String>, source: RecoverySource) -> Self {
        Self {
            next_sequence: sequence + 1,
            last_sequence: Some(sequence),
            head_hash: hash,
            source,
        }
    }
}

/// Process-scoped sequence counter.
#[derive(Debug)]
pub struct LogSequencer {
    next: Mutex<u64>,
}

impl LogSequencer {
    pub fn starting_at(next: u64) -> Self {
        Self {
            next: Mutex::new(next.max(1)),
        }
    }

    /// Build a sequencer that resumes after the last persisted entry.
    pub fn recover(ledger_path: &Path, tail_scan_bytes: u64) -> Result<(Self, Recovery), LedgerError> {
        let recovery = recover_head(ledger_path, tail_scan_bytes)?;
        Ok((Self::starting_at(recovery.next_sequence), recovery))
    }

    pub fn next_sequence(&self) -> u64 {
        let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let sequence = *next;
        *next += 1;
        sequence
    }

    /// The value the next call to `next_sequence` will return.
    pub fn peek(&self) -> u64 {
        *self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn recover_head(ledger_path: &Path, tail_scan_bytes: u64) -> Result<Recovery, LedgerError> {
    let file_len = std::fs::metadata(ledger_path).map(|m| m.len()).unwrap_or(0);
    let checkpoint = store::read_checkpoint(&store::checkpoint_path(ledger_path));

    if let Some(checkpoint) = checkpoint.as_ref().filter(|c| c.offset <= file_len) {
        let mut last = None;
        store::for_each_entry(ledger_path, checkpoint.offset, |entry| {
            last = Some(entry);
            ControlFlow::Continue(())
        })?;

        let recovery = match last {
            Some(entry) if entry.sequence > checkpoint.sequence => {
                Recovery::from_last(entry.sequence, Some(entry.hash), RecoverySource::Checkpoint)
            }
            _ => Recovery::from_last(
                checkpoint.sequence,
                checkpoint.hash.clone(),
                RecoverySource::Checkpoint,
            ),
        };
        info!(
            "Recovered ledger head at sequence {:?} from checkpoint",
            recovery.last_sequence
        );
        return Ok(recovery);
    }

    if checkpoint.is_some() {
        warn!("Checkpoint offset lies beyond the ledger file; ignoring checkpoint");
    }

    if let Some(entry) = store::tail_scan(ledger_path, tail_scan_bytes)? {
        info!("Recovered ledger head at sequence {} from tail scan", entry.sequence);
        return Ok(Recovery::from_last(
            entry.sequence,
            Some(entry.hash),
            RecoverySource::TailScan,
        ));
    }

    if file_len == 0 && checkpoint.is_none() {
        return Ok(Recovery {
            next_sequence: 1,
            last_sequence: None,
            head_hash: None,
            source: RecoverySource::Fresh,
        });
    }

    // Gaps are acceptable here, reusing a sequence is not
    let high_water = Utc::now().timestamp_micros().max(1) as u64;
    warn!(
        "No valid entry found in ledger tail of {:?}; resuming from timestamp high-water mark {}",
        ledger_path, high_water
    );
    Ok(Recovery {
        next_sequence: high_water,
        last_sequence: None,
        head_hash: None,
        source: RecoverySource::TimestampFallback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::LogEntry;
    use crate::audit::store::{append_line, open_append, write_checkpoint, Checkpoint};
    use serde_json::Map;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn append(path: &Path, sequence: u64, previous: Option<String>) -> (LogEntry, u64) {
        let entry = LogEntry::new(
            sequence,
            "general.test".to_string(),
            "tester".to_string(),
            "target".to_string(),
            "ok".to_string(),
            Map::new(),
            Map::new(),
            previous,
        );
        let mut file = open_append(path).unwrap();
        let len = append_line(&mut file, &serde_json::to_string(&entry).unwrap(), false).unwrap();
        (entry, len)
    }

    #[test]
    fn test_fresh_ledger_starts_at_one() {
        let dir = tempdir().unwrap();
        let (sequencer, recovery) = LogSequencer::recover(&dir.path().join("a.jsonl"), 4096).unwrap();

        assert_eq!(recovery.source, RecoverySource::Fresh);
        assert_eq!(recovery.head_hash, None);
        assert_eq!(sequencer.next_sequence(), 1);
        assert_eq!(sequencer.next_sequence(), 2);
        assert_eq!(sequencer.peek(), 3);
    }

    #[test]
    fn test_tail_scan_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let (first, _) = append(&path, 1, None);
        let (second, _) = append(&path, 2, Some(first.hash.clone()));

        let (sequencer, recovery) = LogSequencer::recover(&path, 4096).unwrap();
        assert_eq!(recovery.source, RecoverySource::TailScan);
        assert_eq!(recovery.head_hash, Some(second.hash));
        assert_eq!(sequencer.next_sequence(), 3);
    }

    #[test]
    fn test_checkpoint_recovery_reads_forward() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let (first, offset) = append(&path, 1, None);
        write_checkpoint(
            &store::checkpoint_path(&path),
            &Checkpoint {
                sequence: 1,
                hash: Some(first.hash.clone()),
                offset,
                written_at: Utc::now(),
            },
        )
        .unwrap();

        let recovery = recover_head(&path, 4096).unwrap();
        assert_eq!(recovery.source, RecoverySource::Checkpoint);
        assert_eq!(recovery.next_sequence, 2);
        assert_eq!(recovery.head_hash, Some(first.hash.clone()));

        let (second, _) = append(&path, 2, Some(first.hash));
        let recovery = recover_head(&path, 4096).unwrap();
        assert_eq!(recovery.next_sequence, 3);
        assert_eq!(recovery.head_hash, Some(second.hash));
    }

    #[test]
    fn test_corrupt_tail_falls_back_to_timestamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, "garbage\nmore garbage\n").unwrap();

        let recovery = recover_head(&path, 4096).unwrap();
        assert_eq!(recovery.source, RecoverySource::TimestampFallback);
        assert!(recovery.next_sequence > 1_000_000_000_000);
        assert_eq!(recovery.head_hash, None);
    }

    #[test]
    fn test_concurrent_callers_get_unique_sequences() {
        let sequencer = Arc::new(LogSequencer::starting_at(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                std::thread::spawn(move || (0..100).map(|_| sequencer.next_sequence()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&800));
    }
}
