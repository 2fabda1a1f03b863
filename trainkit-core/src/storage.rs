//! Epoch-indexed history of every meter summary across a run.

use crate::error::{StateError, StorageError};
use crate::persistence::{self, csv_escape};
use crate::results::{EpochResult, MeterResult};
use crate::state::{self, Persistable, StateDict};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default file name used by [`Storage::to_csv`].
pub const STORAGE_CSV: &str = "storage.csv";

/// Ordered record of one metric's summaries, keyed by epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoricalContainer {
    records: BTreeMap<usize, MeterResult>,
}

impl HistoricalContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. `None` uses the epoch after the last one recorded.
    ///
    /// Re-adding the last epoch overwrites it; going back in time is an error.
    pub fn add(&mut self, result: MeterResult, epoch: Option<usize>) -> Result<usize, usize> {
        let last = self.last_epoch();
        let epoch = match epoch {
            Some(e) => e,
            None => last.map_or(0, |l| l + 1),
        };
        if let Some(last) = last.filter(|&l| epoch < l) {
            return Err(last);
        }
        self.records.insert(epoch, result);
        Ok(epoch)
    }

    pub fn get(&self, epoch: usize) -> Option<&MeterResult> {
        self.records.get(&epoch)
    }

    pub fn history(&self) -> impl Iterator<Item = (usize, &MeterResult)> {
        self.records.iter().map(|(e, r)| (*e, r))
    }

    pub fn last_epoch(&self) -> Option<usize> {
        self.records.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flattened view: epoch -> submetric -> value.
    pub fn summary(&self) -> BTreeMap<usize, BTreeMap<String, f64>> {
        self.records
            .iter()
            .map(|(e, r)| (*e, r.iter().map(|(k, v)| (k.to_string(), v)).collect()))
            .collect()
    }
}

/// The per-phase results of one epoch, as handed to [`Storage::put_income`].
#[derive(Debug, Clone, Default)]
pub struct StorageIncome {
    pub train: Option<EpochResult>,
    pub eval: Option<EpochResult>,
    pub test: Option<EpochResult>,
    pub extra: Vec<(String, EpochResult)>,
}

impl StorageIncome {
    pub fn new(train: EpochResult, eval: Option<EpochResult>) -> Self {
        Self {
            train: Some(train),
            eval,
            ..Default::default()
        }
    }

    fn phases(&self) -> Vec<(&str, &EpochResult)> {
        let mut out = Vec::new();
        if let Some(r) = &self.train {
            out.push(("train", r));
        }
        if let Some(r) = &self.eval {
            out.push(("eval", r));
        }
        if let Some(r) = &self.test {
            out.push(("test", r));
        }
        for (name, r) in &self.extra {
            out.push((name.as_str(), r));
        }
        out
    }
}

/// Rows are epochs, columns are `<container>_<submetric>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryTable {
    pub columns: Vec<String>,
    pub rows: Vec<(usize, Vec<Option<f64>>)>,
}

impl SummaryTable {
    pub fn epochs(&self) -> Vec<usize> {
        self.rows.iter().map(|(e, _)| *e).collect()
    }

    pub fn cell(&self, epoch: usize, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|(e, _)| *e == epoch)
            .and_then(|(_, values)| values[col])
    }

    pub fn to_csv_string(&self) -> String {
        let mut buf = String::from("epoch");
        for column in &self.columns {
            buf.push(',');
            buf.push_str(&csv_escape(column));
        }
        buf.push('\n');
        for (epoch, values) in &self.rows {
            let _ = write!(buf, "{epoch}");
            for value in values {
                match value {
                    Some(v) => {
                        let _ = write!(buf, ",{v}");
                    }
                    None => buf.push(','),
                }
            }
            buf.push('\n');
        }
        buf
    }
}

/// All historical containers of a run, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Storage {
    containers: BTreeMap<String, HistoricalContainer>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &mut self,
        name: &str,
        result: MeterResult,
        epoch: Option<usize>,
        prefix: &str,
        postfix: &str,
    ) -> Result<usize, StorageError> {
        let key = format!("{prefix}{name}{postfix}");
        let container = self.containers.entry(key.clone()).or_default();
        container
            .add(result, epoch)
            .map_err(|last| StorageError::EpochRegression {
                name: key,
                epoch: epoch.unwrap_or_default(),
                last,
            })
    }

    pub fn put_all(
        &mut self,
        result: &EpochResult,
        epoch: Option<usize>,
        prefix: &str,
    ) -> Result<(), StorageError> {
        for (name, summary) in result.iter() {
            self.put(name, summary.clone(), epoch, prefix, "")?;
        }
        Ok(())
    }

    /// Record every phase of one epoch under `<phase>_<meter>` keys.
    ///
    /// Nothing is written unless every key accepts `epoch`.
    pub fn put_income(&mut self, income: &StorageIncome, epoch: usize) -> Result<(), StorageError> {
        let phases = income.phases();
        for (phase, result) in &phases {
            for name in result.names() {
                let key = format!("{phase}_{name}");
                let last = self.containers.get(&key).and_then(HistoricalContainer::last_epoch);
                if let Some(last) = last.filter(|&l| epoch < l) {
                    return Err(StorageError::EpochRegression {
                        name: key,
                        epoch,
                        last,
                    });
                }
            }
        }
        for (phase, result) in phases {
            self.put_all(result, Some(epoch), &format!("{phase}_"))?;
        }
        debug!(epoch, containers = self.containers.len(), "Stored epoch results");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&HistoricalContainer, StorageError> {
        self.containers
            .get(name)
            .ok_or_else(|| StorageError::NotFound { name: name.into() })
    }

    pub fn get_epoch(&self, name: &str, epoch: usize) -> Result<&MeterResult, StorageError> {
        self.get(name)?
            .get(epoch)
            .ok_or_else(|| StorageError::EpochNotFound {
                name: name.into(),
                epoch,
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.containers.keys().map(String::as_str).collect()
    }

    /// Every epoch index present in any container.
    pub fn epochs(&self) -> Vec<usize> {
        self.containers
            .values()
            .flat_map(|c| c.history().map(|(e, _)| e))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Merge every container into one table with sorted columns.
    pub fn summary(&self) -> SummaryTable {
        let mut columns = BTreeSet::new();
        for (name, container) in &self.containers {
            for (_, record) in container.history() {
                for key in record.keys() {
                    columns.insert(format!("{name}_{key}"));
                }
            }
        }
        let columns: Vec<String> = columns.into_iter().collect();

        let rows = self
            .epochs()
            .into_iter()
            .map(|epoch| {
                let mut values = vec![None; columns.len()];
                for (name, container) in &self.containers {
                    if let Some(record) = container.get(epoch) {
                        for (key, value) in record.iter() {
                            let column = format!("{name}_{key}");
                            if let Ok(i) = columns.binary_search(&column) {
                                values[i] = Some(value);
                            }
                        }
                    }
                }
                (epoch, values)
            })
            .collect();

        SummaryTable { columns, rows }
    }

    /// Write the summary table to `<dir>/<name>`; the directory must exist.
    pub fn to_csv(&self, dir: &Path, name: &str) -> Result<PathBuf, StorageError> {
        if !dir.is_dir() {
            return Err(StorageError::MissingDirectory {
                path: dir.to_path_buf(),
            });
        }
        let path = dir.join(name);
        persistence::atomic_write(&path, self.summary().to_csv_string().as_bytes()).map_err(
            |source| StorageError::Write {
                path: path.clone(),
                source,
            },
        )?;
        Ok(path)
    }
}

impl Persistable for Storage {
    fn state_dict(&self) -> Result<StateDict, StateError> {
        state::to_state(self)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
        *self = state::from_state(state)?;
        Ok(())
    }
}
