//! Typed result maps produced by meters.
//!
//! A [`MeterResult`] is one meter's summary (`submetric -> value`); an
//! [`EpochResult`] collects the summaries of every meter for one epoch of one
//! phase. Both only admit numeric values: results built from untyped JSON are
//! checked on the way in.

use crate::error::MeterError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Summary of a single meter, e.g. `{"mean": 0.42, "std": 0.05}`.
///
/// Non-finite values serialize as `null` in JSON and come back as NaN.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MeterResult(BTreeMap<String, f64>);

impl MeterResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build from an untyped JSON object, rejecting anything non-numeric.
    /// `null` is accepted and read as NaN.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, MeterError> {
        let obj = value.as_object().ok_or_else(|| MeterError::NonNumeric {
            key: "<root>".into(),
            value: value.to_string(),
        })?;
        let mut result = Self::new();
        for (k, v) in obj {
            let number = match v {
                serde_json::Value::Null => f64::NAN,
                serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| MeterError::NonNumeric {
                    key: k.clone(),
                    value: v.to_string(),
                })?,
                other => {
                    return Err(MeterError::NonNumeric {
                        key: k.clone(),
                        value: other.to_string(),
                    });
                }
            };
            result.insert(k.clone(), number);
        }
        Ok(result)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for MeterResult {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<'de> Deserialize<'de> for MeterResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
        Ok(Self(
            raw.into_iter()
                .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
                .collect(),
        ))
    }
}

impl fmt::Display for MeterResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(k, v)| format!("{k}:{v:.3}")).collect();
        write!(f, "{}", pairs.join("\t"))
    }
}

/// The summaries of every meter for one epoch of one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochResult(BTreeMap<String, MeterResult>);

impl EpochResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meter: impl Into<String>, result: MeterResult) {
        self.0.insert(meter.into(), result);
    }

    pub fn get(&self, meter: &str) -> Option<&MeterResult> {
        self.0.get(meter)
    }

    /// Look up `meter.submetric` in one step.
    pub fn value(&self, meter: &str, submetric: &str) -> Option<f64> {
        self.get(meter).and_then(|r| r.get(submetric))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MeterResult)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build from an untyped JSON object of objects.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, MeterError> {
        let obj = value.as_object().ok_or_else(|| MeterError::NonNumeric {
            key: "<root>".into(),
            value: value.to_string(),
        })?;
        let mut result = Self::new();
        for (name, summary) in obj {
            result.insert(name.clone(), MeterResult::from_json(summary)?);
        }
        Ok(result)
    }
}

impl fmt::Display for EpochResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, result) in self.iter() {
            writeln!(f, "{name}:")?;
            writeln!(f, "\t{result}")?;
        }
        Ok(())
    }
}
