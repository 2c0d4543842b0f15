//! Policy file loader
//! Loads the compliance rule catalog and retention policy from YAML files

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;

use crate::audit::retention::RetentionPolicy;
use crate::compliance::rules::RuleCatalog;
use crate::error::LedgerError;

pub const COMPLIANCE_RULES_FILE: &str = "compliance-rules.yml";
pub const RETENTION_POLICY_FILE: &str = "retention-policy.yml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PolicyFiles {
    pub compliance: RuleCatalog,
    pub retention: RetentionPolicy,
}

impl Default for PolicyFiles {
    fn default() -> Self {
        Self {
            compliance: RuleCatalog::builtin(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl PolicyFiles {
    /// Load both policy files from a directory. A file that does not exist
    /// leaves the built-in policy for that concern in place.
    pub fn load_from_directory(path: &Path) -> Result<Self, LedgerError> {
        info!("Loading ledger policies from: {:?}", path);

        let compliance = match Self::load_yaml(path.join(COMPLIANCE_RULES_FILE))? {
            Some(catalog) => catalog,
            None => {
                info!("No {} found, using built-in frameworks", COMPLIANCE_RULES_FILE);
                RuleCatalog::builtin()
            }
        };
        let retention = match Self::load_yaml(path.join(RETENTION_POLICY_FILE))? {
            Some(policy) => policy,
            None => {
                info!("No {} found, using default retention windows", RETENTION_POLICY_FILE);
                RetentionPolicy::default()
            }
        };

        let files = Self { compliance, retention };
        files.validate()?;
        Ok(files)
    }

    /// Load a YAML file and deserialize it
    fn load_yaml<T: for<'de> Deserialize<'de>>(path: PathBuf) -> Result<Option<T>, LedgerError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| LedgerError::ConfigError(format!("Failed to read {:?}: {}", path, e)))?;

        serde_yaml::from_str(&contents)
            .map(Some)
            .map_err(|e| LedgerError::ConfigError(format!("Failed to parse {:?}: {}", path, e)))
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        self.compliance.validate()?;
        self.retention.validate()?;
        info!(
            "Validated {} compliance frameworks and {} retention categories",
            self.compliance.frameworks.len(),
            self.retention.categories.len()
        );
        Ok(())
    }
}

/// Loaded policies plus enough bookkeeping to notice edits on disk.
pub struct PolicyCache {
    policies: PolicyFiles,
    last_updated: SystemTime,
    auto_reload: bool,
    policy_dir: PathBuf,
}

impl PolicyCache {
    pub fn new(policies: PolicyFiles, policy_dir: PathBuf, auto_reload: bool) -> Self {
        Self {
            policies,
            last_updated: SystemTime::now(),
            auto_reload,
            policy_dir,
        }
    }

    pub fn policies(&self) -> &PolicyFiles {
        &self.policies
    }

    /// True when auto reload is on and a policy file changed since the last load
    pub fn needs_reload(&self) -> bool {
        if !self.auto_reload {
            return false;
        }

        [COMPLIANCE_RULES_FILE, RETENTION_POLICY_FILE].iter().any(|file| {
            fs::metadata(self.policy_dir.join(file))
                .and_then(|metadata| metadata.modified())
                .map_or(false, |modified| modified > self.last_updated)
        })
    }

    /// Reload from disk. On failure the previous policies stay in effect.
    pub fn reload(&mut self) -> Result<&PolicyFiles, LedgerError> {
        info!("Reloading ledger policies");

        let policies = PolicyFiles::load_from_directory(&self.policy_dir)?;
        self.policies = policies;
        self.last_updated = SystemTime::now();

        info!("Ledger policies reloaded successfully");
        Ok(&self.policies)
    }
}
