//! Checkpoint persistence.
//!
//! A checkpoint is the set of named component state dicts plus a little run
//! metadata. On disk it is framed as:
//!
//! ```text
//! b"TKCK" | version: u32 LE | payload length: u64 LE | JSON payload | SHA-256(payload)
//! ```
//!
//! Loading walks an explicit list of named [`Persistable`] components. A
//! component missing from the checkpoint (or reporting a missing key) is
//! recoverable and only reported; any other failure is collected and, once
//! every component has been tried, raised as one aggregated error in strict
//! mode or logged in lenient mode.

use crate::error::{CheckpointError, Result, StateError};
use crate::persistence;
use crate::state::{Persistable, StateDict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAGIC: &[u8; 4] = b"TKCK";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8;
const DIGEST_LEN: usize = 32;

pub const LAST_CHECKPOINT: &str = "last.pth";
pub const BEST_CHECKPOINT: &str = "best.pth";

/// File name used by periodic saves.
pub fn epoch_checkpoint_name(epoch: usize) -> String {
    format!("epoch_{epoch}.pth")
}

fn has_checkpoint_suffix(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("pth") | Some("pt")
    )
}

/// A serialized snapshot of every stateful component of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub epoch: usize,
    pub saved_at: DateTime<Utc>,
    pub components: BTreeMap<String, StateDict>,
}

impl Checkpoint {
    pub fn new(run_id: Uuid, epoch: usize, components: BTreeMap<String, StateDict>) -> Self {
        Self {
            run_id,
            epoch,
            saved_at: Utc::now(),
            components,
        }
    }

    pub fn component(&self, name: &str) -> Option<&StateDict> {
        self.components.get(name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&Sha256::digest(&payload));
        Ok(out)
    }

    /// Parse framed bytes; `path` is only used in error messages.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> std::result::Result<Self, CheckpointError> {
        let corrupt = |reason: &str| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if bytes.len() < HEADER_LEN + DIGEST_LEN {
            return Err(corrupt("file too short"));
        }
        if &bytes[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let mut word = [0_u8; 4];
        word.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(word);
        if version != VERSION {
            return Err(corrupt(&format!("unsupported version {version}")));
        }
        let mut len_bytes = [0_u8; 8];
        len_bytes.copy_from_slice(&bytes[8..HEADER_LEN]);
        let len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| corrupt("payload length overflows"))?;
        if bytes.len() != HEADER_LEN + len + DIGEST_LEN {
            return Err(corrupt("payload length does not match file size"));
        }
        let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
        let digest = &bytes[HEADER_LEN + len..];
        if Sha256::digest(payload).as_slice() != digest {
            return Err(corrupt("checksum mismatch"));
        }
        serde_json::from_slice(payload).map_err(|e| corrupt(&e.to_string()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        persistence::atomic_write(path, &self.to_bytes()?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(&bytes, path)?)
    }
}

/// Comparison used to decide whether a score beats the best so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDirection {
    #[default]
    HigherIsBetter,
    LowerIsBetter,
}

impl ScoreDirection {
    pub fn from_high_is_better(high_is_better: bool) -> Self {
        if high_is_better {
            Self::HigherIsBetter
        } else {
            Self::LowerIsBetter
        }
    }

    /// Whether `score` improves on `best`. No best yet always improves;
    /// NaN never does.
    pub fn improves(&self, score: f64, best: Option<f64>) -> bool {
        match best {
            None => true,
            Some(best) => match self {
                Self::HigherIsBetter => score > best,
                Self::LowerIsBetter => score < best,
            },
        }
    }
}

/// Outcome of loading a checkpoint into a set of components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub missing_keys: Vec<String>,
    pub errors: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.errors.is_empty()
    }
}

/// A named component taking part in save/load.
pub type NamedComponent<'a> = (&'a str, &'a mut dyn Persistable);

/// Reads and writes checkpoint files under a run directory.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    save_dir: PathBuf,
}

impl Checkpointer {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Write `checkpoint` as `<dir>/<name>`; `dir` defaults to the run directory.
    pub fn save_to(&self, checkpoint: &Checkpoint, dir: Option<&Path>, name: &str) -> Result<PathBuf> {
        if !has_checkpoint_suffix(Path::new(name)) {
            return Err(CheckpointError::InvalidName { name: name.into() }.into());
        }
        let path = dir.unwrap_or(&self.save_dir).join(name);
        checkpoint.write(&path)?;
        debug!(path = %path.display(), epoch = checkpoint.epoch, "Saved checkpoint");
        Ok(path)
    }

    /// Always write `last.pth`; also write `best.pth` when `improved`.
    pub fn save_on_score(
        &self,
        checkpoint: &Checkpoint,
        improved: bool,
        dir: Option<&Path>,
    ) -> Result<bool> {
        self.save_to(checkpoint, dir, LAST_CHECKPOINT)?;
        if improved {
            self.save_to(checkpoint, dir, BEST_CHECKPOINT)?;
            info!(epoch = checkpoint.epoch, "New best checkpoint");
        }
        Ok(improved)
    }

    pub fn periodic_save(
        &self,
        checkpoint: &Checkpoint,
        epoch: usize,
        dir: Option<&Path>,
    ) -> Result<PathBuf> {
        self.save_to(checkpoint, dir, &epoch_checkpoint_name(epoch))
    }

    /// Resolve a checkpoint file: either `path` itself when it is a `.pth`/`.pt`
    /// file, or `path/name` when `path` is a directory containing it.
    pub fn resolve(path: &Path, name: &str) -> std::result::Result<PathBuf, CheckpointError> {
        if path.is_file() && has_checkpoint_suffix(path) {
            return Ok(path.to_path_buf());
        }
        if path.is_dir() {
            let candidate = path.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(CheckpointError::NotFound {
            path: path.to_path_buf(),
        })
    }

    /// Resolve and read a checkpoint, defaulting to `last.pth` for directories.
    pub fn read(path: &Path, name: Option<&str>) -> Result<Checkpoint> {
        let resolved = Self::resolve(path, name.unwrap_or(LAST_CHECKPOINT))?;
        Checkpoint::read(&resolved)
    }

    /// Restore each component from `checkpoint`.
    ///
    /// `owner` names the aggregate in the error message.
    pub fn load_components(
        owner: &str,
        components: Vec<NamedComponent<'_>>,
        checkpoint: &Checkpoint,
        strict: bool,
    ) -> std::result::Result<LoadReport, CheckpointError> {
        let mut report = LoadReport::default();
        for (name, component) in components {
            let Some(state) = checkpoint.component(name) else {
                report.missing_keys.push(name.to_string());
                continue;
            };
            match component.load_state_dict(state) {
                Ok(()) => {}
                Err(StateError::MissingKey { key }) => {
                    report.missing_keys.push(format!("{name}.{key}"));
                }
                Err(e) => report
                    .errors
                    .push(format!("while copying {name} parameters, error {e} occurs")),
            }
        }
        if !report.missing_keys.is_empty() {
            warn!(owner, missing = ?report.missing_keys, "Missing keys in checkpoint");
        }
        if !report.errors.is_empty() {
            if strict {
                return Err(CheckpointError::LoadFailed {
                    component: owner.to_string(),
                    messages: report.errors,
                });
            }
            warn!(
                "{}",
                CheckpointError::LoadFailed {
                    component: owner.to_string(),
                    messages: report.errors.clone(),
                }
            );
        }
        Ok(report)
    }
}
