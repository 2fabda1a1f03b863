//! Streaming metric aggregation.
//!
//! Meters only cover the span of one epoch: the registry is reset at the
//! start of every epoch and historical bookkeeping lives in
//! [`crate::storage`]. Every meter updates incrementally without keeping the
//! samples it has seen.

use crate::error::{MeterError, StateError};
use crate::results::{EpochResult, MeterResult};
use crate::state::{self, Persistable, StateDict};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Polling interval used by callers that do not pick their own.
pub const DEFAULT_CACHE_TTL: usize = 10;

/// A value fed into a meter.
#[derive(Debug, Clone, PartialEq)]
pub enum MeterInput {
    Scalar(f64),
    Array(Vec<f64>),
    Named(Vec<(String, f64)>),
}

impl MeterInput {
    pub fn kind(&self) -> &'static str {
        match self {
            MeterInput::Scalar(_) => "scalar",
            MeterInput::Array(_) => "array",
            MeterInput::Named(_) => "named",
        }
    }

    /// Convert an untyped value, rejecting anything that is not a number,
    /// a homogeneous numeric array, or a flat object of numbers.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, MeterError> {
        use serde_json::Value;

        let number = |key: &str, v: &Value| {
            v.as_f64().ok_or_else(|| MeterError::NonNumeric {
                key: key.to_string(),
                value: v.to_string(),
            })
        };

        match value {
            Value::Number(_) => Ok(MeterInput::Scalar(number("<value>", value)?)),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| number(&i.to_string(), v))
                .collect::<Result<Vec<_>, _>>()
                .map(MeterInput::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| number(k, v).map(|n| (k.clone(), n)))
                .collect::<Result<Vec<_>, _>>()
                .map(MeterInput::Named),
            other => Err(MeterError::NonNumeric {
                key: "<value>".into(),
                value: other.to_string(),
            }),
        }
    }
}

impl From<f64> for MeterInput {
    fn from(v: f64) -> Self {
        MeterInput::Scalar(v)
    }
}

impl From<Vec<f64>> for MeterInput {
    fn from(v: Vec<f64>) -> Self {
        MeterInput::Array(v)
    }
}

impl From<&[f64]> for MeterInput {
    fn from(v: &[f64]) -> Self {
        MeterInput::Array(v.to_vec())
    }
}

impl<const N: usize> From<[(&str, f64); N]> for MeterInput {
    fn from(pairs: [(&str, f64); N]) -> Self {
        MeterInput::Named(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }
}

/// A streaming statistic for one named metric within an epoch.
pub trait Meter: Persistable + Send + fmt::Debug {
    /// Return to the freshly constructed state.
    fn reset(&mut self);

    fn add(&mut self, input: MeterInput) -> Result<(), MeterError>;

    fn summary(&self) -> MeterResult;

    fn detailed_summary(&self) -> MeterResult;
}

/// Running mean and standard deviation (Welford's update).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageValueMeter {
    n: u64,
    #[serde(deserialize_with = "state::f64_or_nan")]
    sum: f64,
    #[serde(deserialize_with = "state::f64_or_nan")]
    mean: f64,
    #[serde(deserialize_with = "state::f64_or_nan")]
    m2: f64,
    #[serde(deserialize_with = "state::f64_or_nan")]
    last: f64,
}

impl AverageValueMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.n += 1;
        self.sum += value;
        self.last = value;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// NaN until the first sample arrives.
    pub fn mean(&self) -> f64 {
        if self.n == 0 { f64::NAN } else { self.mean }
    }

    /// Sample standard deviation; infinite with a single sample.
    pub fn std(&self) -> f64 {
        match self.n {
            0 => f64::NAN,
            1 => f64::INFINITY,
            n => (self.m2 / (n - 1) as f64).sqrt(),
        }
    }

    pub fn last(&self) -> f64 {
        if self.n == 0 { f64::NAN } else { self.last }
    }
}

impl Meter for AverageValueMeter {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn add(&mut self, input: MeterInput) -> Result<(), MeterError> {
        match input {
            MeterInput::Scalar(v) => self.push(v),
            MeterInput::Array(values) => values.into_iter().for_each(|v| self.push(v)),
            MeterInput::Named(_) => {
                return Err(MeterError::UnsupportedInput {
                    meter: "AverageValueMeter".into(),
                    input: input.kind().into(),
                });
            }
        }
        Ok(())
    }

    fn summary(&self) -> MeterResult {
        [("mean", self.mean())].into_iter().collect()
    }

    fn detailed_summary(&self) -> MeterResult {
        [("mean", self.mean()), ("std", self.std()), ("last", self.last())]
            .into_iter()
            .collect()
    }
}

impl Persistable for AverageValueMeter {
    fn state_dict(&self) -> Result<StateDict, StateError> {
        state::to_state(self)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
        *self = state::from_state(state)?;
        Ok(())
    }
}

/// One running average per named input key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultipleAverageValueMeter {
    meters: BTreeMap<String, AverageValueMeter>,
}

impl MultipleAverageValueMeter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: String, value: f64) {
        self.meters.entry(key).or_default().push(value);
    }
}

impl Meter for MultipleAverageValueMeter {
    fn reset(&mut self) {
        self.meters.clear();
    }

    fn add(&mut self, input: MeterInput) -> Result<(), MeterError> {
        match input {
            MeterInput::Named(pairs) => {
                for (k, v) in pairs {
                    self.push(k, v);
                }
                Ok(())
            }
            other => Err(MeterError::UnsupportedInput {
                meter: "MultipleAverageValueMeter".into(),
                input: other.kind().into(),
            }),
        }
    }

    fn summary(&self) -> MeterResult {
        self.meters.iter().map(|(k, m)| (k.clone(), m.mean())).collect()
    }

    fn detailed_summary(&self) -> MeterResult {
        self.summary()
    }
}

impl Persistable for MultipleAverageValueMeter {
    fn state_dict(&self) -> Result<StateDict, StateError> {
        state::to_state(self)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
        *self = state::from_state(state)?;
        Ok(())
    }
}

/// Positional averages: the i-th element of every added list feeds key `"i"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AverageValueListMeter {
    inner: MultipleAverageValueMeter,
}

impl AverageValueListMeter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Meter for AverageValueListMeter {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn add(&mut self, input: MeterInput) -> Result<(), MeterError> {
        match input {
            MeterInput::Array(values) => {
                for (i, v) in values.into_iter().enumerate() {
                    self.inner.push(i.to_string(), v);
                }
                Ok(())
            }
            other => Err(MeterError::UnsupportedInput {
                meter: "AverageValueListMeter".into(),
                input: other.kind().into(),
            }),
        }
    }

    fn summary(&self) -> MeterResult {
        self.inner.summary()
    }

    fn detailed_summary(&self) -> MeterResult {
        self.inner.detailed_summary()
    }
}

impl Persistable for AverageValueListMeter {
    fn state_dict(&self) -> Result<StateDict, StateError> {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
        self.inner.load_state_dict(state)
    }
}

#[derive(Debug)]
struct StatusCache {
    calls: usize,
    snapshot: EpochResult,
}

/// Named meters plus optional groups over them.
///
/// Names are unique; deleting a meter drops it from every group.
#[derive(Debug, Default)]
pub struct MeterRegistry {
    meters: Vec<(String, Box<dyn Meter>)>,
    groups: Vec<(String, Vec<String>)>,
    cache: HashMap<Option<String>, StatusCache>,
}

impl MeterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a meter under a unique name, optionally adding it to a group.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        meter: impl Meter + 'static,
        group: Option<&str>,
    ) -> Result<(), MeterError> {
        self.register_boxed(name, Box::new(meter), group)
    }

    pub fn register_boxed(
        &mut self,
        name: impl Into<String>,
        meter: Box<dyn Meter>,
        group: Option<&str>,
    ) -> Result<(), MeterError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(MeterError::AlreadyRegistered { name });
        }
        if let Some(group) = group {
            match self.groups.iter_mut().find(|(g, _)| g == group) {
                Some((_, members)) => members.push(name.clone()),
                None => self.groups.push((group.to_string(), vec![name.clone()])),
            }
        }
        debug!(meter = name.as_str(), group = ?group, "Registered meter");
        self.meters.push((name, meter));
        self.cache.clear();
        Ok(())
    }

    /// Remove a meter and every group reference to it.
    pub fn delete(&mut self, name: &str) -> Result<(), MeterError> {
        let idx = self
            .meters
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| MeterError::NotFound { name: name.into() })?;
        self.meters.remove(idx);
        for (_, members) in &mut self.groups {
            members.retain(|m| m != name);
        }
        self.cache.clear();
        Ok(())
    }

    pub fn delete_many(&mut self, names: &[&str]) -> Result<(), MeterError> {
        for name in names {
            self.delete(name)?;
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.meters.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn Meter> {
        self.meters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m.as_ref())
    }

    /// Registered meter names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.meters.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn groups(&self) -> Vec<&str> {
        self.groups.iter().map(|(g, _)| g.as_str()).collect()
    }

    pub fn group_members(&self, group: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|(g, _)| g == group)
            .map(|(_, members)| members.as_slice())
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    /// Forward a value to the named meter's incremental update.
    pub fn add(&mut self, name: &str, input: impl Into<MeterInput>) -> Result<(), MeterError> {
        let (_, meter) = self
            .meters
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| MeterError::NotFound { name: name.into() })?;
        meter.add(input.into()).map_err(|e| match e {
            MeterError::UnsupportedInput { meter, input } => MeterError::UnsupportedInput {
                meter: format!("{name} ({meter})"),
                input,
            },
            other => other,
        })
    }

    /// Snapshot of every meter's `summary()`, cached between polls.
    ///
    /// Non-final reads recompute only on every `cache_ttl`-th call for the
    /// same group selector and may be stale in between. `final_read` always
    /// recomputes and leaves the cache untouched.
    pub fn tracking_status(
        &mut self,
        group: Option<&str>,
        final_read: bool,
        cache_ttl: usize,
    ) -> Result<EpochResult, MeterError> {
        if final_read {
            return collect_status(&self.meters, &self.groups, group, false);
        }
        let ttl = cache_ttl.max(1);
        let key = group.map(str::to_string);
        match self.cache.get_mut(&key) {
            Some(cache) => {
                cache.calls += 1;
                if cache.calls % ttl == 0 {
                    cache.snapshot = collect_status(&self.meters, &self.groups, group, false)?;
                }
                Ok(cache.snapshot.clone())
            }
            None => {
                let snapshot = collect_status(&self.meters, &self.groups, group, false)?;
                self.cache.insert(
                    key,
                    StatusCache {
                        calls: 1,
                        snapshot: snapshot.clone(),
                    },
                );
                Ok(snapshot)
            }
        }
    }

    /// Uncached snapshot of every meter's `detailed_summary()`.
    pub fn detailed_status(&self, group: Option<&str>) -> Result<EpochResult, MeterError> {
        collect_status(&self.meters, &self.groups, group, true)
    }

    /// Reset every meter and drop cached snapshots.
    pub fn reset(&mut self) {
        for (_, meter) in &mut self.meters {
            meter.reset();
        }
        self.cache.clear();
    }
}

fn collect_status(
    meters: &[(String, Box<dyn Meter>)],
    groups: &[(String, Vec<String>)],
    group: Option<&str>,
    detailed: bool,
) -> Result<EpochResult, MeterError> {
    let members = match group {
        Some(g) => Some(
            groups
                .iter()
                .find(|(name, _)| name == g)
                .map(|(_, m)| m)
                .ok_or_else(|| MeterError::GroupNotFound { group: g.into() })?,
        ),
        None => None,
    };
    let mut result = EpochResult::new();
    for (name, meter) in meters {
        if members.is_some_and(|m| !m.contains(name)) {
            continue;
        }
        let summary = if detailed {
            meter.detailed_summary()
        } else {
            meter.summary()
        };
        result.insert(name.clone(), summary);
    }
    Ok(result)
}

impl Persistable for MeterRegistry {
    fn state_dict(&self) -> Result<StateDict, StateError> {
        let mut map = serde_json::Map::new();
        for (name, meter) in &self.meters {
            map.insert(name.clone(), meter.state_dict()?);
        }
        Ok(StateDict::Object(map))
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
        for (name, meter) in &mut self.meters {
            meter.load_state_dict(state::field(state, name)?)?;
        }
        self.cache.clear();
        Ok(())
    }
}
