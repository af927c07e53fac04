use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use simout_core::errors::{ErrorInfo, SimoutError};

use crate::codec::{decode_yaml, encode_yaml};
use crate::ledger::{FileLedger, LedgerBackend, MemoryLedger};

/// Behaviour when a sink fails while the router fans a call out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SinkFailurePolicy {
    /// Attempt every sink and report all failures together.
    #[default]
    Collect,
    /// Stop at the first failing sink.
    FailFast,
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Honour completions recorded in the ledger. When false every run is
    /// treated as not completed.
    #[serde(default = "DispatchConfig::default_resume")]
    pub resume: bool,
    /// Sink failure handling during fan-out.
    #[serde(default)]
    pub failure_policy: SinkFailurePolicy,
    /// Directory of the durable ledger, in-memory when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_dir: Option<PathBuf>,
    /// Directory containing the config on disk (ignored when serializing).
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl DispatchConfig {
    const fn default_resume() -> bool {
        true
    }

    /// Resolved ledger directory, relative paths anchored at the config file.
    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.ledger_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.base_dir.join(dir)
            }
        })
    }

    /// Opens the configured ledger.
    pub fn open_ledger(&self) -> Result<LedgerBackend, SimoutError> {
        match self.ledger_path() {
            Some(dir) => Ok(LedgerBackend::File(FileLedger::open(dir)?)),
            None => Ok(LedgerBackend::Memory(MemoryLedger::new())),
        }
    }

    /// Produces the YAML representation of the config.
    pub fn to_yaml_string(&self) -> Result<String, SimoutError> {
        encode_yaml(self)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            resume: Self::default_resume(),
            failure_policy: SinkFailurePolicy::default(),
            ledger_dir: None,
            base_dir: PathBuf::from("."),
        }
    }
}

/// Loads a router configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<DispatchConfig, SimoutError> {
    let config_path = path.as_ref();
    let bytes = fs::read(config_path).map_err(|err| {
        SimoutError::Config(
            ErrorInfo::new("config.read", err.to_string())
                .with_context("path", config_path.display().to_string()),
        )
    })?;
    let mut config: DispatchConfig = decode_yaml(&bytes).map_err(|err| {
        SimoutError::Config(
            ErrorInfo::new("config.parse", err.info().message.clone())
                .with_context("path", config_path.display().to_string()),
        )
    })?;
    config.base_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    Ok(config)
}
