//! On-disk state for the evolution core.
//!
//! Every record is a pretty-printed JSON file under the evolution directory,
//! rewritten whole on each change (temp file + rename). Failed writes are
//! counted in a shared [`HealthTracker`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::{EvolutionError, Result};
use crate::genome::Genome;

const GENOME_SUFFIX: &str = "-genome.json";

/// Agent IDs that would name another record's file.
const RESERVED_AGENT_IDS: &[&str] = &["firewall-snapshots"];

/// Agent IDs become file names, so they are limited to ASCII letters,
/// digits, `-`, `_` and `.`, and may not name another record's file.
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    let reason = if agent_id.is_empty() {
        Some("empty")
    } else if agent_id == "." || agent_id == ".." {
        Some("path component")
    } else if !agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
    } else if RESERVED_AGENT_IDS.contains(&agent_id) {
        Some("reserved name")
    } else if agent_id.ends_with("-genome") {
        Some("'-genome' suffix is reserved")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(EvolutionError::InvalidAgentId(agent_id.to_string(), reason)),
        None => Ok(()),
    }
}

fn persistence_err(path: &Path, source: io::Error) -> EvolutionError {
    EvolutionError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Serialize `value` to `path`, replacing any previous content atomically.
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| persistence_err(parent, e))?;
    }
    let data = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).map_err(|e| persistence_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| persistence_err(path, e))?;
    Ok(())
}

/// Read a JSON file. A missing file is `Ok(None)`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(persistence_err(path, e)),
    };
    Ok(Some(serde_json::from_str(&data)?))
}

/// Every `*.json` file directly inside `dir`, sorted by name.
pub(crate) fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(persistence_err(dir, e)),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

/// Health signal for best-effort writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceHealth {
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl PersistenceHealth {
    pub fn is_healthy(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    inner: Mutex<PersistenceHealth>,
}

impl HealthTracker {
    pub fn record_failure(&self, err: &EvolutionError, at: DateTime<Utc>) {
        let mut health = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        health.failures += 1;
        health.last_error = Some(err.to_string());
        health.last_failure_at = Some(at);
    }

    pub fn snapshot(&self) -> PersistenceHealth {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub(crate) type GenomeSlot = Arc<Mutex<Option<Genome>>>;

/// Per-agent genome cache backed by `<agent>-genome.json` files.
pub struct GenomeStore {
    dir: PathBuf,
    slots: RwLock<HashMap<String, GenomeSlot>>,
    health: Arc<HealthTracker>,
}

impl GenomeStore {
    /// Open the store and load every genome file found in `dir`.
    pub fn open(dir: impl Into<PathBuf>, health: Arc<HealthTracker>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| persistence_err(&dir, e))?;

        let mut slots = HashMap::new();
        for path in json_files(&dir)? {
            let Some(agent_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(GENOME_SUFFIX))
                .map(str::to_string)
            else {
                continue;
            };
            if let Err(e) = validate_agent_id(&agent_id) {
                warn!(path = %path.display(), error = %e, "skipping genome file");
                continue;
            }
            match read_json::<Genome>(&path) {
                Ok(Some(genome)) => {
                    info!(agent = %agent_id, "loaded genome");
                    slots.insert(agent_id, Arc::new(Mutex::new(Some(genome))));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable genome file")
                }
            }
        }

        Ok(Self {
            dir,
            slots: RwLock::new(slots),
            health,
        })
    }

    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{agent_id}{GENOME_SUFFIX}"))
    }

    fn slot(&self, agent_id: &str) -> GenomeSlot {
        if let Some(slot) = self.existing_slot(agent_id) {
            return slot;
        }
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, agent_id: &str) -> Option<GenomeSlot> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn get(&self, agent_id: &str) -> Option<Genome> {
        let slot = self.existing_slot(agent_id)?;
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Run `f` with the agent's slot locked. Nothing else touches the agent's
    /// genome until `f` returns. Unknown agents get `NotFound` and no slot.
    pub(crate) fn with_slot<T>(
        &self,
        agent_id: &str,
        f: impl FnOnce(&mut Option<Genome>) -> Result<T>,
    ) -> Result<T> {
        let slot = self
            .existing_slot(agent_id)
            .ok_or_else(|| EvolutionError::genome_not_found(agent_id))?;
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Validate, persist, then install `genome` into a locked slot. The slot
    /// is left untouched when either step fails.
    pub(crate) fn commit(
        &self,
        agent_id: &str,
        slot: &mut Option<Genome>,
        genome: Genome,
    ) -> Result<()> {
        genome.validate()?;
        let path = self.path_for(agent_id);
        if let Err(e) = write_json(&path, &genome) {
            error!(agent = %agent_id, error = %e, "failed to write genome");
            self.health.record_failure(&e, Utc::now());
            return Err(e);
        }
        *slot = Some(genome);
        info!(agent = %agent_id, "genome updated");
        Ok(())
    }

    /// Validate and persist `genome` as the agent's current genome.
    pub fn put(&self, agent_id: &str, genome: Genome) -> Result<()> {
        validate_agent_id(agent_id)?;
        genome.validate()?;
        let slot = self.slot(agent_id);
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.commit(agent_id, &mut guard, genome)
    }

    pub fn agents(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.lock().map(|g| g.is_some()).unwrap_or(true))
            .map(|(id, _)| id.clone())
            .collect();
        agents.sort();
        agents
    }
}
