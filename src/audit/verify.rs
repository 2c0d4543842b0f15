//! Audit Ledger Verification
//!
//! Recomputes entry hashes, checks signatures and walks the `previous_hash`
//! links. Integrity failures are reported as data; a scan never stops at the
//! first problem so the full extent of any tampering is visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::Instant;
use tracing::{info, warn};

use crate::audit::entry::LogEntry;
use crate::audit::ledger::AuditLedger;
use crate::audit::store::{self, RetentionAnchor, UnparsableLine};
use crate::error::LedgerError;

/// Verification status of a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVerification {
    pub log_id: String,
    pub sequence: u64,
    pub hash_matches: bool,
    pub signature_valid: bool,
    pub verified: bool,
    /// Only present in range reports.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub link_valid: Option<bool>,
    /// False from the first hash or link failure onward.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chain_intact: Option<bool>,
}

impl EntryVerification {
    pub fn check(entry: &LogEntry, signature_valid: bool) -> Self {
        let hash_matches = entry.verify_hash();
        Self {
            log_id: entry.log_id.clone(),
            sequence: entry.sequence,
            hash_matches,
            signature_valid,
            verified: hash_matches && signature_valid,
            link_valid: None,
            chain_intact: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFault {
    PreviousHashMismatch,
    SequenceNotIncreasing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub sequence: u64,
    pub log_id: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub reason: LinkFault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeVerification {
    pub chain_valid: bool,
    pub all_verified: bool,
    pub entries_checked: usize,
    pub truncated: bool,
    pub first_invalid_sequence: Option<u64>,
    pub verification_details: Vec<EntryVerification>,
    pub broken_links: Vec<BrokenLink>,
    /// Lines that no longer decode as entries. Any of these invalidates the
    /// report.
    #[serde(default)]
    pub unparsable_lines: Vec<UnparsableLine>,
}

impl RangeVerification {
    pub fn summary(&self) -> String {
        let status = if self.chain_valid && self.all_verified {
            "✅ Ledger is valid"
        } else {
            "❌ Ledger is invalid"
        };
        let unparsable = match self.unparsable_lines.len() {
            0 => String::new(),
            n => format!(", {} unparsable lines", n),
        };
        format!(
            "{} ({} entries checked, {} broken links{}{})",
            status,
            self.entries_checked,
            self.broken_links.len(),
            unparsable,
            if self.truncated { ", truncated" } else { "" }
        )
    }
}

/// Streaming chain checker shared by the service verifier and the offline
/// `verify-ledger` tool. Feed it every persisted entry in file order.
pub struct ChainWalker {
    anchors: Vec<RetentionAnchor>,
    expected_previous: Option<Option<String>>,
    last_sequence: Option<u64>,
    intact: bool,
    report: RangeVerification,
}

impl ChainWalker {
    pub fn new(anchors: Vec<RetentionAnchor>) -> Self {
        Self {
            anchors,
            expected_previous: None,
            last_sequence: None,
            intact: true,
            report: RangeVerification {
                chain_valid: true,
                all_verified: true,
                entries_checked: 0,
                truncated: false,
                first_invalid_sequence: None,
                verification_details: Vec::new(),
                broken_links: Vec::new(),
                unparsable_lines: Vec::new(),
            },
        }
    }

    /// What the first entry in the file must name as its predecessor: the
    /// latest anchor below it, or nothing for a genesis entry.
    fn anchor_for(&self, sequence: u64) -> Option<String> {
        self.anchors
            .iter()
            .filter(|a| a.last_sequence < sequence)
            .max_by_key(|a| a.last_sequence)
            .map(|a| a.anchor_hash.clone())
    }

    /// Advance past an entry outside the verified window.
    pub fn skip(&mut self, entry: &LogEntry) {
        self.expected_previous = Some(Some(entry.hash.clone()));
        self.last_sequence = Some(entry.sequence);
    }

    pub fn check(&mut self, entry: &LogEntry, signature_valid: bool) {
        let mut detail = EntryVerification::check(entry, signature_valid);

        let expected = match self.expected_previous.take() {
            Some(expected) => expected,
            None => self.anchor_for(entry.sequence),
        };

        let mut link_valid = true;
        if entry.previous_hash != expected {
            link_valid = false;
            self.report.broken_links.push(BrokenLink {
                sequence: entry.sequence,
                log_id: entry.log_id.clone(),
                expected,
                actual: entry.previous_hash.clone(),
                reason: LinkFault::PreviousHashMismatch,
            });
        }
        if let Some(last) = self.last_sequence {
            if entry.sequence <= last {
                link_valid = false;
                self.report.broken_links.push(BrokenLink {
                    sequence: entry.sequence,
                    log_id: entry.log_id.clone(),
                    expected: Some((last + 1).to_string()),
                    actual: Some(entry.sequence.to_string()),
                    reason: LinkFault::SequenceNotIncreasing,
                });
            }
        }

        if !(detail.hash_matches && link_valid) {
            self.intact = false;
            self.report.chain_valid = false;
            self.report.first_invalid_sequence.get_or_insert(entry.sequence);
        }
        if !detail.verified {
            self.report.all_verified = false;
        }

        detail.link_valid = Some(link_valid);
        detail.chain_intact = Some(self.intact);
        self.report.verification_details.push(detail);
        self.report.entries_checked += 1;

        self.skip(entry);
    }

    /// Record lines the scan could not decode.
    pub fn unparsable(&mut self, lines: Vec<UnparsableLine>) {
        if lines.is_empty() {
            return;
        }
        self.intact = false;
        self.report.chain_valid = false;
        self.report.all_verified = false;
        self.report.unparsable_lines.extend(lines);
    }

    pub fn finish(mut self, truncated: bool) -> RangeVerification {
        self.report.truncated = truncated;
        self.report
    }
}

#[derive(Clone)]
pub struct ChainVerifier {
    ledger: AuditLedger,
}

impl ChainVerifier {
    pub fn new(ledger: AuditLedger) -> Self {
        Self { ledger }
    }

    /// Verify one entry as it is stored on disk.
    pub fn verify_entry(&self, log_id: &str) -> Result<EntryVerification, LedgerError> {
        let entry = self
            .ledger
            .find(log_id)?
            .ok_or_else(|| LedgerError::unknown_log_id(log_id))?;

        let signature_valid = self.ledger.signer().verify(&entry.hash, &entry.signature);
        let result = EntryVerification::check(&entry, signature_valid);
        if !result.verified {
            warn!(
                "Entry {} (#{}) failed verification: hash_matches={}, signature_valid={}",
                result.log_id, result.sequence, result.hash_matches, result.signature_valid
            );
        }
        Ok(result)
    }

    /// Verify every persisted entry whose timestamp falls in the window.
    pub fn verify_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        deadline: Option<Instant>,
    ) -> Result<RangeVerification, LedgerError> {
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(LedgerError::ValidationError(format!(
                    "start_time {} is after end_time {}",
                    start, end
                )));
            }
        }

        let anchors = store::read_anchors(&self.ledger.anchors_path())?;
        let signer = self.ledger.signer();
        let mut walker = ChainWalker::new(anchors);
        let mut truncated = false;

        let stats = store::for_each_entry(self.ledger.path(), 0, |entry| {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                truncated = true;
                return ControlFlow::Break(());
            }
            let in_range = start.map_or(true, |s| entry.timestamp >= s)
                && end.map_or(true, |e| entry.timestamp <= e);
            if in_range {
                let signature_valid = signer.verify(&entry.hash, &entry.signature);
                walker.check(&entry, signature_valid);
            } else {
                walker.skip(&entry);
            }
            ControlFlow::Continue(())
        })?;
        walker.unparsable(stats.unparsable);

        let report = walker.finish(truncated);
        if report.chain_valid && report.all_verified {
            info!("Ledger verification successful: {} entries", report.entries_checked);
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }
}
