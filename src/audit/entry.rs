//! Audit Log Entry
//!
//! Defines the ledger record, its canonical serialization and the
//! SHA-256 hash that chains each record to its predecessor.
//!
//! # Canonical form
//!
//! The hash input is a compact JSON object containing exactly these keys:
//! `action_type`, `actor_id`, `context`, `details`, `log_id`,
//! `previous_hash`, `result`, `sequence`, `target`, `timestamp`.
//! Keys are sorted by byte order at every nesting level, there is no
//! insignificant whitespace, and `timestamp` is rendered as
//! `YYYY-MM-DDTHH:MM:SS.ffffffZ`. The entry hash is the lowercase hex
//! SHA-256 of the UTF-8 canonical string. `hash` and `signature` are never
//! part of the canonical form.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use crate::error::LedgerError;

/// Action type recorded when the retention manager discards a ledger prefix.
pub const LOG_PURGE_ACTION: &str = "retention.log_purge";

/// A single tamper-evident ledger record. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: String,
    pub sequence: u64,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub actor_id: String,
    pub target: String,
    pub result: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub previous_hash: Option<String>,
    pub hash: String,
    #[serde(default)]
    pub signature: String,
}

impl LogEntry {
    /// Create a new, unsigned entry with its hash already calculated.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sequence: u64,
        action_type: String,
        actor_id: String,
        target: String,
        result: String,
        details: Map<String, Value>,
        context: Map<String, Value>,
        previous_hash: Option<String>,
    ) -> Self {
        let mut entry = Self {
            log_id: format!("log-{}", uuid::Uuid::new_v4().simple()),
            sequence,
            // Microsecond precision survives the JSON round trip exactly
            timestamp: Utc::now().trunc_subsecs(6),
            action_type,
            actor_id,
            target,
            result,
            details,
            context,
            previous_hash,
            hash: String::new(),
            signature: String::new(),
        };

        entry.hash = entry.calculate_hash();
        entry
    }

    pub fn with_signature(mut self, signature: String) -> Self {
        self.signature = signature;
        self
    }

    /// Fields covered by the hash, as a JSON value.
    pub fn canonical_value(&self) -> Value {
        json!({
            "action_type": self.action_type,
            "actor_id": self.actor_id,
            "context": self.context,
            "details": self.details,
            "log_id": self.log_id,
            "previous_hash": self.previous_hash,
            "result": self.result,
            "sequence": self.sequence,
            "target": self.target,
            "timestamp": format_timestamp(&self.timestamp),
        })
    }

    /// Create canonical string representation for hashing
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        write_canonical(&self.canonical_value(), &mut out);
        out
    }

    /// Calculate SHA256 hash of this entry
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify this entry's hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    pub fn category(&self) -> &'static str {
        category_for_action(&self.action_type)
    }

    /// Resolve a dot-path (`action_type`, `details.compliance_type`, ...)
    /// to the value stored at that location.
    pub fn field(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let value = match head {
            "log_id" => Value::from(self.log_id.as_str()),
            "sequence" => Value::from(self.sequence),
            "timestamp" => Value::from(format_timestamp(&self.timestamp)),
            "action_type" => Value::from(self.action_type.as_str()),
            "actor_id" => Value::from(self.actor_id.as_str()),
            "target" => Value::from(self.target.as_str()),
            "result" => Value::from(self.result.as_str()),
            "previous_hash" => self
                .previous_hash
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "hash" => Value::from(self.hash.as_str()),
            "signature" => Value::from(self.signature.as_str()),
            "details" => return walk(&self.details, parts),
            "context" => return walk(&self.context, parts),
            _ => return None,
        };

        match parts.next() {
            Some(_) => None,
            None => Some(value),
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} by {} on {} -> {}",
            self.sequence, self.action_type, self.actor_id, self.target, self.result
        )
    }
}

fn walk<'a>(map: &Map<String, Value>, mut parts: impl Iterator<Item = &'a str>) -> Option<Value> {
    let first = parts.next()?;
    let mut current = map.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current.clone())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Map an action type onto its retention category.
pub fn category_for_action(action_type: &str) -> &'static str {
    let has_prefix = |names: &[&str]| {
        names.iter().any(|name| {
            action_type == *name
                || action_type.starts_with(&format!("{}_", name))
                || action_type.starts_with(&format!("{}.", name))
        })
    };

    if has_prefix(&["auth"]) {
        "auth"
    } else if has_prefix(&["doc", "document"]) {
        "document"
    } else if has_prefix(&["orchestrator"]) {
        "orchestrator"
    } else if has_prefix(&["compliance"]) {
        "compliance"
    } else if has_prefix(&["retention"]) {
        "retention"
    } else {
        "general"
    }
}

static ACTION_TYPE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+(\.[a-z0-9_]+)*$").expect("action type regex is valid"));

/// Action types are a dotted taxonomy of lowercase segments, e.g. `doc_parse`
/// or `compliance.check`.
pub fn validate_action_type(action_type: &str) -> Result<(), LedgerError> {
    if action_type.is_empty() {
        return Err(LedgerError::missing_field("action_type"));
    }

    if !ACTION_TYPE_REGEX.is_match(action_type) {
        return Err(LedgerError::ValidationError(format!(
            "Invalid action_type '{}': expected dotted lowercase segments",
            action_type
        )));
    }
    Ok(())
}

mod timestamp_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
