//! Per-epoch weight schedules (loss weights, ramp-ups).
//!
//! The loop steps every schedule in a [`ScheduleSet`] once per epoch; a
//! workload reads the current values through its step context.

use crate::error::StateError;
use crate::state::{self, Persistable, StateDict};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value that evolves once per epoch.
pub trait WeightScheduler: Persistable + Send + fmt::Debug {
    fn step(&mut self);

    fn value(&self) -> f64;
}

/// Exponential ramp from `min_value` to `max_value` between `begin_epoch`
/// and `max_epoch`: `min + (max - min) * exp(mult * (1 - t)^2)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampScheduler {
    pub begin_epoch: usize,
    pub max_epoch: usize,
    pub min_value: f64,
    pub max_value: f64,
    pub mult: f64,
    epoch: usize,
}

impl RampScheduler {
    pub fn new(begin_epoch: usize, max_epoch: usize, min_value: f64, max_value: f64) -> Self {
        Self {
            begin_epoch,
            max_epoch,
            min_value,
            max_value,
            mult: -5.0,
            epoch: 0,
        }
    }

    pub fn with_mult(mut self, mult: f64) -> Self {
        self.mult = mult;
        self
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl WeightScheduler for RampScheduler {
    fn step(&mut self) {
        self.epoch += 1;
    }

    fn value(&self) -> f64 {
        if self.epoch < self.begin_epoch {
            return self.min_value;
        }
        if self.epoch >= self.max_epoch {
            return self.max_value;
        }
        let t = (self.epoch - self.begin_epoch) as f64 / (self.max_epoch - self.begin_epoch) as f64;
        self.min_value + (self.max_value - self.min_value) * (self.mult * (1.0 - t).powi(2)).exp()
    }
}

/// Zero before `begin_epoch`, `max_value` from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantScheduler {
    pub begin_epoch: usize,
    pub max_value: f64,
    epoch: usize,
}

impl ConstantScheduler {
    pub fn new(begin_epoch: usize, max_value: f64) -> Self {
        Self {
            begin_epoch,
            max_value,
            epoch: 0,
        }
    }
}

impl WeightScheduler for ConstantScheduler {
    fn step(&mut self) {
        self.epoch += 1;
    }

    fn value(&self) -> f64 {
        if self.epoch < self.begin_epoch { 0.0 } else { self.max_value }
    }
}

/// Straight line from `begin_value` at epoch 0 to `end_value` at `max_epoch`.
/// Keeps extrapolating past `max_epoch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearScheduler {
    pub max_epoch: usize,
    pub begin_value: f64,
    pub end_value: f64,
    epoch: usize,
}

impl LinearScheduler {
    pub fn new(max_epoch: usize, begin_value: f64, end_value: f64) -> Self {
        Self {
            max_epoch,
            begin_value,
            end_value,
            epoch: 0,
        }
    }
}

impl WeightScheduler for LinearScheduler {
    fn step(&mut self) {
        self.epoch += 1;
    }

    fn value(&self) -> f64 {
        if self.max_epoch == 0 {
            return self.end_value;
        }
        self.begin_value
            + (self.end_value - self.begin_value) * (self.epoch as f64 / self.max_epoch as f64)
    }
}

macro_rules! serde_persistable {
    ($($ty:ty),+) => {
        $(
            impl Persistable for $ty {
                fn state_dict(&self) -> Result<StateDict, StateError> {
                    state::to_state(self)
                }

                fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
                    *self = state::from_state(state)?;
                    Ok(())
                }
            }
        )+
    };
}

serde_persistable!(RampScheduler, ConstantScheduler, LinearScheduler);

/// Named schedules advanced together.
#[derive(Debug, Default)]
pub struct ScheduleSet {
    schedules: Vec<(String, Box<dyn WeightScheduler>)>,
}

impl ScheduleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a schedule.
    pub fn insert(&mut self, name: impl Into<String>, schedule: impl WeightScheduler + 'static) {
        let name = name.into();
        let boxed: Box<dyn WeightScheduler> = Box::new(schedule);
        match self.schedules.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = boxed,
            None => self.schedules.push((name, boxed)),
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.schedules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.value())
    }

    pub fn values(&self) -> Vec<(&str, f64)> {
        self.schedules
            .iter()
            .map(|(n, s)| (n.as_str(), s.value()))
            .collect()
    }

    pub fn step_all(&mut self) {
        for (_, schedule) in &mut self.schedules {
            schedule.step();
        }
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}

impl Persistable for ScheduleSet {
    fn state_dict(&self) -> Result<StateDict, StateError> {
        let mut map = serde_json::Map::new();
        for (name, schedule) in &self.schedules {
            map.insert(name.clone(), schedule.state_dict()?);
        }
        Ok(StateDict::Object(map))
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
        for (name, schedule) in &mut self.schedules {
            schedule.load_state_dict(state::field(state, name)?)?;
        }
        Ok(())
    }
}
