pub mod loader;

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::audit::ledger::{
    LedgerOptions, DEFAULT_CACHE_SIZE, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_TAIL_SCAN_BYTES,
};
use crate::compliance::report::DEFAULT_REPORT_SAMPLE_SIZE;
use crate::crypto::signing::MIN_KEY_BITS;
use crate::error::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub ledger_path: PathBuf,
    pub key_dir: PathBuf,
    pub key_bits: usize,
    pub cache_size: usize,
    pub checkpoint_interval: u64,
    pub tail_scan_bytes: u64,
    pub fsync: bool,
    pub policy_dir: Option<PathBuf>,
    pub policy_auto_reload: bool,
    pub report_sample_size: usize,
    pub server_host: String,
    pub server_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("data/audit_ledger.jsonl"),
            key_dir: PathBuf::from("data/keys"),
            key_bits: MIN_KEY_BITS,
            cache_size: DEFAULT_CACHE_SIZE,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            tail_scan_bytes: DEFAULT_TAIL_SCAN_BYTES,
            fsync: true,
            policy_dir: None,
            policy_auto_reload: false,
            report_sample_size: DEFAULT_REPORT_SAMPLE_SIZE,
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, LedgerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup, falling back to defaults for
    /// unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LedgerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = AppConfig {
            ledger_path: lookup("LEDGER_PATH").map(PathBuf::from).unwrap_or(defaults.ledger_path),
            key_dir: lookup("LEDGER_KEY_DIR").map(PathBuf::from).unwrap_or(defaults.key_dir),
            key_bits: parse_or(&lookup, "LEDGER_KEY_BITS", defaults.key_bits)?,
            cache_size: parse_or(&lookup, "LEDGER_CACHE_SIZE", defaults.cache_size)?,
            checkpoint_interval: parse_or(&lookup, "LEDGER_CHECKPOINT_INTERVAL", defaults.checkpoint_interval)?,
            tail_scan_bytes: parse_or(&lookup, "LEDGER_TAIL_SCAN_BYTES", defaults.tail_scan_bytes)?,
            fsync: parse_flag(&lookup, "LEDGER_FSYNC", defaults.fsync)?,
            policy_dir: lookup("LEDGER_POLICY_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            policy_auto_reload: parse_flag(&lookup, "LEDGER_POLICY_AUTO_RELOAD", defaults.policy_auto_reload)?,
            report_sample_size: parse_or(&lookup, "LEDGER_REPORT_SAMPLE_SIZE", defaults.report_sample_size)?,
            server_host: lookup("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: parse_or(&lookup, "SERVER_PORT", defaults.server_port)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.key_bits < MIN_KEY_BITS {
            return Err(LedgerError::ConfigError(format!(
                "LEDGER_KEY_BITS must be at least {}, got {}",
                MIN_KEY_BITS, self.key_bits
            )));
        }
        if self.cache_size == 0 {
            return Err(LedgerError::ConfigError("LEDGER_CACHE_SIZE must be positive".to_string()));
        }
        if self.tail_scan_bytes == 0 {
            return Err(LedgerError::ConfigError("LEDGER_TAIL_SCAN_BYTES must be positive".to_string()));
        }
        Ok(())
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            path: self.ledger_path.clone(),
            cache_size: self.cache_size,
            checkpoint_interval: self.checkpoint_interval,
            tail_scan_bytes: self.tail_scan_bytes,
            fsync: self.fsync,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, LedgerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| LedgerError::ConfigError(format!("Invalid {} '{}': {}", key, raw, e))),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, LedgerError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|raw| raw.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(LedgerError::ConfigError(format!("Invalid {} '{}': expected a boolean", key, raw))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, LedgerError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.checkpoint_interval, 100);
        assert_eq!(config.key_bits, 2048);
        assert!(config.fsync);
        assert!(config.policy_dir.is_none());
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("LEDGER_PATH", "/var/lib/ledger/audit.jsonl"),
            ("LEDGER_CACHE_SIZE", "50"),
            ("LEDGER_FSYNC", "off"),
            ("LEDGER_POLICY_DIR", "/etc/ledger"),
            ("LEDGER_POLICY_AUTO_RELOAD", "true"),
            ("SERVER_PORT", "8080"),
        ])
        .unwrap();

        assert_eq!(config.ledger_path, PathBuf::from("/var/lib/ledger/audit.jsonl"));
        assert_eq!(config.ledger_options().cache_size, 50);
        assert!(!config.fsync);
        assert_eq!(config.policy_dir, Some(PathBuf::from("/etc/ledger")));
        assert!(config.policy_auto_reload);
        assert_eq!(config.server_port, 8080);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("SERVER_PORT", "eighty")]),
            Err(LedgerError::ConfigError(_))
        ));
        assert!(config_from(&[("LEDGER_KEY_BITS", "1024")]).is_err());
        assert!(config_from(&[("LEDGER_FSYNC", "maybe")]).is_err());
        assert!(config_from(&[("LEDGER_CACHE_SIZE", "0")]).is_err());
    }
}
