//! Durable record of runs completed by previous executions.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use simout_core::errors::{ErrorInfo, SimoutError};
use simout_core::RunCoordinate;
use tracing::{debug, warn};

use crate::codec::{decode_json, digest_hex, encode_canonical};
use crate::router::RunReceipt;

fn ledger_error(code: &str, err: impl ToString, path: &Path) -> SimoutError {
    SimoutError::Ledger(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

fn poisoned(what: &str) -> SimoutError {
    SimoutError::Ledger(ErrorInfo::new(
        "ledger.poisoned",
        format!("{what} lock poisoned by a panicking writer"),
    ))
}

/// Query capability over runs completed in a previous execution.
pub trait ProgressLedger: Send + Sync {
    /// Returns true when the run finished completely in a prior execution.
    fn is_completed(&self, coordinate: RunCoordinate) -> bool;

    /// Enumerates completed runs in ascending order.
    fn completed(&self) -> Vec<RunCoordinate>;

    /// Returns the completion proof recorded for the run.
    fn completion(&self, coordinate: RunCoordinate) -> Option<CompletionRecord>;
}

#[derive(Serialize)]
struct SealedFields<'a> {
    coordinate: RunCoordinate,
    records_routed: u64,
    sinks: &'a [String],
}

/// Metadata proving that a run completed in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Run that completed.
    pub coordinate: RunCoordinate,
    /// Number of records routed for the run before it closed.
    pub records_routed: u64,
    /// Sinks that received the run's lifecycle calls.
    pub sinks: Vec<String>,
    /// SHA-256 over the fields above.
    pub digest: String,
}

impl CompletionRecord {
    /// Seals a completion record, computing its digest.
    pub fn seal(
        coordinate: RunCoordinate,
        records_routed: u64,
        mut sinks: Vec<String>,
    ) -> Result<Self, SimoutError> {
        sinks.sort();
        let digest = digest_hex(&SealedFields {
            coordinate,
            records_routed,
            sinks: &sinks,
        })?;
        Ok(Self {
            coordinate,
            records_routed,
            sinks,
            digest,
        })
    }

    /// Seals the receipt returned by closing a run.
    ///
    /// Receipts with failed deliveries are refused: some sink is missing part
    /// of the run, which must therefore execute again.
    pub fn from_receipt(receipt: &RunReceipt) -> Result<Self, SimoutError> {
        if !receipt.is_complete() {
            return Err(SimoutError::Ledger(
                ErrorInfo::new("ledger.partial_run", "run closed with failed deliveries")
                    .with_coordinate(receipt.coordinate)
                    .with_context("failed_deliveries", receipt.failed_deliveries.to_string())
                    .with_hint("leave the run out of the ledger so it executes again"),
            ));
        }
        Self::seal(
            receipt.coordinate,
            receipt.records_routed,
            receipt.sinks.clone(),
        )
    }

    /// Recomputes the digest and compares it with the stored one.
    pub fn verify(&self) -> Result<(), SimoutError> {
        let expected = digest_hex(&SealedFields {
            coordinate: self.coordinate,
            records_routed: self.records_routed,
            sinks: &self.sinks,
        })?;
        if expected != self.digest {
            return Err(SimoutError::Ledger(
                ErrorInfo::new("ledger.digest_mismatch", "completion digest does not match")
                    .with_coordinate(self.coordinate)
                    .with_context("expected", expected)
                    .with_context("actual", self.digest.clone()),
            ));
        }
        Ok(())
    }
}

/// In-memory ledger, empty unless completions are recorded explicitly.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<BTreeMap<RunCoordinate, CompletionRecord>>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a verified completion.
    pub fn record(&self, completion: CompletionRecord) -> Result<(), SimoutError> {
        completion.verify()?;
        self.entries
            .write()
            .map_err(|_| poisoned("memory ledger"))?
            .insert(completion.coordinate, completion);
        Ok(())
    }
}

impl ProgressLedger for MemoryLedger {
    fn is_completed(&self, coordinate: RunCoordinate) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&coordinate))
            .unwrap_or(false)
    }

    fn completed(&self) -> Vec<RunCoordinate> {
        self.entries
            .read()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default()
    }

    fn completion(&self, coordinate: RunCoordinate) -> Option<CompletionRecord> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&coordinate).cloned())
    }
}

/// Directory backed ledger holding one JSON entry per completed run.
///
/// Entries are written to a temporary file and renamed into place, so a
/// crash leaves either no entry or a complete one. Entries that fail to parse
/// or verify on load are treated as not completed.
#[derive(Debug)]
pub struct FileLedger {
    dir: PathBuf,
    entries: RwLock<BTreeMap<RunCoordinate, CompletionRecord>>,
}

impl FileLedger {
    /// Opens (creating if needed) the ledger directory and loads its entries.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SimoutError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| ledger_error("ledger.mkdir", err, &dir))?;
        let mut entries = BTreeMap::new();
        let listing = fs::read_dir(&dir).map_err(|err| ledger_error("ledger.read_dir", err, &dir))?;
        for entry in listing {
            let path = entry
                .map_err(|err| ledger_error("ledger.read_dir", err, &dir))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match load_entry(&path) {
                Ok(completion) => {
                    entries.insert(completion.coordinate, completion);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding ledger entry");
                }
            }
        }
        debug!(dir = %dir.display(), completed = entries.len(), "ledger loaded");
        Ok(Self {
            dir,
            entries: RwLock::new(entries),
        })
    }

    /// Directory holding the entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a verified completion.
    pub fn record(&self, completion: CompletionRecord) -> Result<(), SimoutError> {
        completion.verify()?;
        let path = entry_path(&self.dir, completion.coordinate);
        let staging = path.with_extension("json.tmp");
        let bytes = encode_canonical(&completion)?;
        fs::write(&staging, bytes).map_err(|err| ledger_error("ledger.write", err, &staging))?;
        fs::rename(&staging, &path).map_err(|err| ledger_error("ledger.rename", err, &path))?;
        self.entries
            .write()
            .map_err(|_| poisoned("file ledger"))?
            .insert(completion.coordinate, completion);
        Ok(())
    }

    /// Removes the completion of a run so the next execution reruns it.
    pub fn forget(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        let path = entry_path(&self.dir, coordinate);
        if path.exists() {
            fs::remove_file(&path).map_err(|err| ledger_error("ledger.remove", err, &path))?;
        }
        self.entries
            .write()
            .map_err(|_| poisoned("file ledger"))?
            .remove(&coordinate);
        Ok(())
    }
}

impl ProgressLedger for FileLedger {
    fn is_completed(&self, coordinate: RunCoordinate) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&coordinate))
            .unwrap_or(false)
    }

    fn completed(&self) -> Vec<RunCoordinate> {
        self.entries
            .read()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default()
    }

    fn completion(&self, coordinate: RunCoordinate) -> Option<CompletionRecord> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&coordinate).cloned())
    }
}

/// Ledger selected by configuration.
#[derive(Debug)]
pub enum LedgerBackend {
    /// Non-durable ledger.
    Memory(MemoryLedger),
    /// Directory backed ledger.
    File(FileLedger),
}

impl LedgerBackend {
    /// Records a completion in the underlying ledger.
    pub fn record(&self, completion: CompletionRecord) -> Result<(), SimoutError> {
        match self {
            LedgerBackend::Memory(ledger) => ledger.record(completion),
            LedgerBackend::File(ledger) => ledger.record(completion),
        }
    }

    fn inner(&self) -> &dyn ProgressLedger {
        match self {
            LedgerBackend::Memory(ledger) => ledger,
            LedgerBackend::File(ledger) => ledger,
        }
    }
}

impl ProgressLedger for LedgerBackend {
    fn is_completed(&self, coordinate: RunCoordinate) -> bool {
        self.inner().is_completed(coordinate)
    }

    fn completed(&self) -> Vec<RunCoordinate> {
        self.inner().completed()
    }

    fn completion(&self, coordinate: RunCoordinate) -> Option<CompletionRecord> {
        self.inner().completion(coordinate)
    }
}

fn entry_path(dir: &Path, coordinate: RunCoordinate) -> PathBuf {
    dir.join(format!(
        "{}_{}.json",
        coordinate.scenario(),
        coordinate.replication()
    ))
}

fn load_entry(path: &Path) -> Result<CompletionRecord, SimoutError> {
    let bytes = fs::read(path).map_err(|err| ledger_error("ledger.read", err, path))?;
    let completion: CompletionRecord = decode_json(&bytes)?;
    completion.verify()?;
    let expected = path
        .parent()
        .map(|dir| entry_path(dir, completion.coordinate));
    if expected.as_deref() != Some(path) {
        return Err(SimoutError::Ledger(
            ErrorInfo::new("ledger.misplaced_entry", "entry file name does not match its run")
                .with_context("path", path.display().to_string())
                .with_coordinate(completion.coordinate),
        ));
    }
    Ok(completion)
}
