#![allow(dead_code)]

use audit_ledger::audit::ledger::{ActionRecord, AuditLedger, LedgerOptions};
use audit_ledger::config::loader::PolicyFiles;
use audit_ledger::crypto::signing::{generate_private_key, MIN_KEY_BITS};
use audit_ledger::crypto::SigningService;
use audit_ledger::LedgerService;
use rsa::RsaPrivateKey;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

/// One key for the whole test binary; RSA generation is slow.
pub fn test_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| generate_private_key(MIN_KEY_BITS).expect("Failed to generate test key"))
        .clone()
}

pub fn test_signer() -> Arc<SigningService> {
    Arc::new(SigningService::from_private_key(test_key()).expect("Failed to build signer"))
}

pub fn ledger_path(dir: &TempDir) -> PathBuf {
    dir.path().join("audit_ledger.jsonl")
}

pub fn open_ledger(path: &Path) -> AuditLedger {
    AuditLedger::open(LedgerOptions::new(path), test_signer()).expect("Failed to open ledger")
}

/// Ledger whose cache only holds the newest `cache_size` entries, so reads
/// have to reach the file.
pub fn open_ledger_with_cache(path: &Path, cache_size: usize) -> AuditLedger {
    let options = LedgerOptions {
        cache_size,
        ..LedgerOptions::new(path)
    };
    AuditLedger::open(options, test_signer()).expect("Failed to open ledger")
}

pub fn small_cache_service(dir: &TempDir, cache_size: usize) -> LedgerService {
    LedgerService::new(
        open_ledger_with_cache(&ledger_path(dir), cache_size),
        PolicyFiles::default(),
    )
}

/// Service over a fresh ledger in `dir` with built-in policies.
pub fn test_service(dir: &TempDir) -> LedgerService {
    LedgerService::new(open_ledger(&ledger_path(dir)), PolicyFiles::default())
}

pub fn record(action_type: &str, target: &str) -> ActionRecord {
    ActionRecord::new(action_type, "test-actor", target, "success")
}

pub fn details(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Raw ledger lines as JSON values.
pub fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .expect("Failed to read ledger")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("Invalid ledger line"))
        .collect()
}

pub fn write_lines(path: &Path, lines: &[Value]) {
    let mut contents = String::new();
    for line in lines {
        contents.push_str(&serde_json::to_string(line).expect("Failed to serialize line"));
        contents.push('\n');
    }
    std::fs::write(path, contents).expect("Failed to write ledger");
}
