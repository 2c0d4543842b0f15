//! Ledger File Store
//!
//! Low-level access to the append-only JSONL ledger file and its two
//! sidecar files: the checkpoint (`<ledger>.checkpoint`) and the retention
//! anchors (`<ledger>.anchors.jsonl`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::audit::entry::LogEntry;
use crate::error::LedgerError;

/// Periodically recorded `(sequence, hash)` pair so recovery never has to
/// scan more than the entries written since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    pub hash: Option<String>,
    /// Byte offset just past the checkpointed entry.
    pub offset: u64,
    pub written_at: DateTime<Utc>,
}

/// Record left behind when a ledger prefix is discarded by retention.
///
/// `anchor_hash` is the hash of the last removed entry, which is what the
/// first retained entry's `previous_hash` names. `span_digest` is the Merkle
/// root over every removed entry hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionAnchor {
    pub anchor_hash: String,
    pub span_digest: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub removed_count: usize,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

/// Ledger line that could not be decoded as an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnparsableLine {
    /// 1-based, counted from where the scan started.
    pub line: usize,
    pub byte_offset: u64,
    pub error: String,
}

/// Counters from a streaming pass over the ledger file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub lines: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub unparsable: Vec<UnparsableLine>,
    pub stopped_early: bool,
}

/// Leading run of entries selected for removal.
#[derive(Debug, Clone, Default)]
pub struct PrefixScan {
    pub hashes: Vec<String>,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Offset of the first retained byte.
    pub retain_offset: u64,
}

pub fn checkpoint_path(ledger_path: &Path) -> PathBuf {
    with_suffix(ledger_path, ".checkpoint")
}

pub fn anchors_path(ledger_path: &Path) -> PathBuf {
    with_suffix(ledger_path, ".anchors.jsonl")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Open the ledger for appending, creating parent directories as needed.
pub fn open_append(path: &Path) -> Result<File, LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                LedgerError::ProcessingError(format!("Failed to create ledger directory: {}", e))
            })?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LedgerError::ProcessingError(format!("Failed to open ledger file: {}", e)))
}

/// Append one line and make it durable. Returns the file length afterwards.
///
/// A failed write is truncated back to the previous length so a torn line
/// can never be glued onto the next entry.
pub fn append_line(file: &mut File, line: &str, fsync: bool) -> io::Result<u64> {
    let start = file.metadata()?.len();
    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');

    let written = file
        .write_all(record.as_bytes())
        .and_then(|_| file.flush())
        .and_then(|_| if fsync { file.sync_data() } else { Ok(()) });

    if let Err(e) = written {
        if let Err(trunc) = file.set_len(start) {
            warn!("Failed to roll back torn ledger write: {}", trunc);
        }
        return Err(e);
    }

    Ok(start + record.len() as u64)
}

const TAIL_CHUNK: usize = 64 * 1024;

/// Cut an unterminated final line left behind by a crash mid-append.
///
/// Every acknowledged entry ends in `\n`, so anything after the last newline
/// was never acknowledged. Returns the number of bytes removed.
pub fn repair_torn_tail(path: &Path) -> Result<Option<u64>, LedgerError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    let mut keep = len;
    let mut buffer = vec![0u8; TAIL_CHUNK];
    while keep > 0 {
        let start = keep.saturating_sub(TAIL_CHUNK as u64);
        let chunk = &mut buffer[..(keep - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        match chunk.iter().rposition(|b| *b == b'\n') {
            Some(pos) => {
                keep = start + pos as u64 + 1;
                break;
            }
            None => keep = start,
        }
    }

    if keep == len {
        return Ok(None);
    }

    file.set_len(keep)?;
    file.sync_all()?;
    let removed = len - keep;
    warn!(
        "Removed {} byte(s) of unterminated trailing data from {:?}",
        removed, path
    );
    Ok(Some(removed))
}

/// Stream entries from `offset` to the end of the file. Unparsable lines are
/// logged, skipped and reported in the returned stats.
pub fn for_each_entry<F>(path: &Path, offset: u64, mut visit: F) -> Result<ScanStats, LedgerError>
where
    F: FnMut(LogEntry) -> ControlFlow<()>,
{
    let mut stats = ScanStats::default();
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => {
            return Err(LedgerError::ProcessingError(format!(
                "Failed to open ledger file: {}",
                e
            )))
        }
    };
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }

    let reader = BufReader::new(file);
    let mut position = offset;
    for line in reader.split(b'\n') {
        let line = line.map_err(|e| {
            LedgerError::ProcessingError(format!("Failed to read ledger line: {}", e))
        })?;
        stats.lines += 1;
        let line_start = position;
        position += line.len() as u64 + 1;

        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<LogEntry>(&text) {
            Ok(entry) => {
                stats.parsed += 1;
                if visit(entry).is_break() {
                    stats.stopped_early = true;
                    break;
                }
            }
            Err(e) => {
                stats.skipped += 1;
                warn!(
                    "Skipping unparsable ledger line {} in {:?}: {}",
                    stats.lines, path, e
                );
                stats.unparsable.push(UnparsableLine {
                    line: stats.lines,
                    byte_offset: line_start,
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(stats)
}

/// Find the last syntactically valid entry within the final `max_bytes` of
/// the file.
pub fn tail_scan(path: &Path, max_bytes: u64) -> Result<Option<LogEntry>, LedgerError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buffer = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buffer)?;

    let text = String::from_utf8_lossy(&buffer);
    let mut lines: Vec<&str> = text.split('\n').collect();
    if start > 0 && !lines.is_empty() {
        // First line is probably cut in half
        lines.remove(0);
    }

    for line in lines.into_iter().rev() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => return Ok(Some(entry)),
            Err(e) => debug!("Tail scan skipping invalid line: {}", e),
        }
    }

    Ok(None)
}

pub fn read_checkpoint(path: &Path) -> Option<Checkpoint> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!("Ignoring unreadable checkpoint {:?}: {}", path, e);
            None
        }
    }
}

/// Atomically replace the checkpoint file.
pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<(), LedgerError> {
    let tmp = with_suffix(path, ".tmp");
    let json = serde_json::to_string(checkpoint)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_anchors(path: &Path) -> Result<Vec<RetentionAnchor>, LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut anchors = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(anchor) => anchors.push(anchor),
            Err(e) => warn!("Skipping invalid anchor at line {}: {}", line_num + 1, e),
        }
    }
    Ok(anchors)
}

pub fn append_anchor(path: &Path, anchor: &RetentionAnchor) -> Result<(), LedgerError> {
    let mut file = open_append(path)?;
    let line = serde_json::to_string(anchor)?;
    append_line(&mut file, &line, true).map_err(|e| {
        LedgerError::ProcessingError(format!("Failed to record retention anchor: {}", e))
    })?;
    Ok(())
}

/// Walk the leading entries while `removable` accepts them. Stops at the
/// first rejected or unparsable line.
pub fn scan_prefix<F>(path: &Path, mut removable: F) -> Result<PrefixScan, LedgerError>
where
    F: FnMut(&LogEntry) -> bool,
{
    let mut scan = PrefixScan::default();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            scan.retain_offset += read as u64;
            continue;
        }

        let entry = match serde_json::from_str::<LogEntry>(text.trim_end()) {
            Ok(entry) => entry,
            Err(_) => break,
        };
        if !removable(&entry) {
            break;
        }

        scan.first_sequence.get_or_insert(entry.sequence);
        scan.last_sequence = Some(entry.sequence);
        scan.hashes.push(entry.hash);
        scan.retain_offset += read as u64;
    }

    Ok(scan)
}

/// Drop everything before `offset`, copying the remaining bytes verbatim
/// into a new file that atomically replaces the ledger.
pub fn truncate_front(path: &Path, offset: u64) -> Result<(), LedgerError> {
    let tmp = with_suffix(path, ".purge.tmp");
    {
        let mut source = File::open(path)?;
        source.seek(SeekFrom::Start(offset))?;
        let mut target = File::create(&tmp)?;
        io::copy(&mut source, &mut target)?;
        target.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            // Persist the rename itself; not supported everywhere
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::tempdir;

    fn entry(sequence: u64, previous_hash: Option<String>) -> LogEntry {
        LogEntry::new(
            sequence,
            "doc_parse".to_string(),
            "tester".to_string(),
            format!("doc-{}", sequence),
            "success".to_string(),
            Map::new(),
            Map::new(),
            previous_hash,
        )
    }

    fn write_entries(path: &Path, count: u64) -> Vec<LogEntry> {
        let mut file = open_append(path).unwrap();
        let mut previous = None;
        let mut entries = Vec::new();
        for seq in 1..=count {
            let e = entry(seq, previous.clone());
            append_line(&mut file, &serde_json::to_string(&e).unwrap(), false).unwrap();
            previous = Some(e.hash.clone());
            entries.push(e);
        }
        entries
    }

    #[test]
    fn test_sidecar_paths() {
        let path = Path::new("/var/lib/ledger/audit.jsonl");
        assert_eq!(
            checkpoint_path(path),
            PathBuf::from("/var/lib/ledger/audit.jsonl.checkpoint")
        );
        assert_eq!(
            anchors_path(path),
            PathBuf::from("/var/lib/ledger/audit.jsonl.anchors.jsonl")
        );
    }

    #[test]
    fn test_stream_skips_garbage_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        write_entries(&path, 2);
        {
            let mut file = open_append(&path).unwrap();
            append_line(&mut file, "{not json", false).unwrap();
        }
        write_entries(&path, 1);

        let mut sequences = Vec::new();
        let stats = for_each_entry(&path, 0, |e| {
            sequences.push(e.sequence);
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(sequences, vec![1, 2, 1]);
        assert_eq!(stats.parsed, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.unparsable.len(), 1);
        assert_eq!(stats.unparsable[0].line, 3);

        // The recorded offset points at the start of the bad line
        let raw = fs::read(&path).unwrap();
        let at = stats.unparsable[0].byte_offset as usize;
        assert!(raw[at..].starts_with(b"{not json\n"));
    }

    #[test]
    fn test_repair_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        write_entries(&path, 2);
        let clean_len = fs::metadata(&path).unwrap().len();

        // Clean files are left alone
        assert_eq!(repair_torn_tail(&path).unwrap(), None);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"log_id\":\"half").unwrap();
        drop(file);

        assert_eq!(repair_torn_tail(&path).unwrap(), Some(15));
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);

        let stats = for_each_entry(&path, 0, |_| ControlFlow::Continue(())).unwrap();
        assert_eq!(stats.parsed, 2);
        assert!(stats.unparsable.is_empty());
    }

    #[test]
    fn test_repair_torn_tail_without_any_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "{\"log_id\"").unwrap();

        assert_eq!(repair_torn_tail(&path).unwrap(), Some(9));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(repair_torn_tail(&dir.path().join("missing.jsonl")).unwrap(), None);
    }

    #[test]
    fn test_missing_file_streams_nothing() {
        let dir = tempdir().unwrap();
        let stats = for_each_entry(&dir.path().join("absent.jsonl"), 0, |_| {
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(stats, ScanStats::default());
    }

    #[test]
    fn test_tail_scan_finds_last_valid_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let entries = write_entries(&path, 5);
        {
            let mut file = open_append(&path).unwrap();
            append_line(&mut file, "{\"truncated\":", false).unwrap();
        }

        let last = tail_scan(&path, 64 * 1024).unwrap().unwrap();
        assert_eq!(last.sequence, 5);
        assert_eq!(last.hash, entries[4].hash);

        // Window smaller than a single line finds nothing
        assert!(tail_scan(&path, 8).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl.checkpoint");
        assert!(read_checkpoint(&path).is_none());

        let checkpoint = Checkpoint {
            sequence: 42,
            hash: Some("ab".repeat(32)),
            offset: 1024,
            written_at: Utc::now(),
        };
        write_checkpoint(&path, &checkpoint).unwrap();
        assert_eq!(read_checkpoint(&path), Some(checkpoint));
    }

    #[test]
    fn test_prefix_scan_and_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let entries = write_entries(&path, 5);

        let scan = scan_prefix(&path, |e| e.sequence <= 2).unwrap();
        assert_eq!(scan.hashes, vec![entries[0].hash.clone(), entries[1].hash.clone()]);
        assert_eq!(scan.first_sequence, Some(1));
        assert_eq!(scan.last_sequence, Some(2));

        let before = fs::read_to_string(&path).unwrap();
        truncate_front(&path, scan.retain_offset).unwrap();
        let after = fs::read_to_string(&path).unwrap();

        assert!(before.ends_with(&after));
        let mut remaining = Vec::new();
        for_each_entry(&path, 0, |e| {
            remaining.push(e);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(remaining, entries[2..].to_vec());
    }
}
