//! Shared deterministic workload for integration tests.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::path::Path;
use trainkit_core::error::{StateError, TrainingError};
use trainkit_core::scope::ScopeLevel;
use trainkit_core::state::{self, StateDict};
use trainkit_core::{
    AverageValueMeter, EpochResult, MeterRegistry, Persistable, Phase, Result, StepContext,
    TrainerConfig, Workload,
};

/// One scalar parameter pulled toward 1.0 by gradient steps on `(w - 1)^2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyModel {
    pub w: f64,
    pub steps: u64,
}

impl Persistable for ToyModel {
    fn state_dict(&self) -> std::result::Result<StateDict, StateError> {
        state::to_state(self)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> std::result::Result<(), StateError> {
        *self = state::from_state(state)?;
        Ok(())
    }
}

pub struct ToyWorkload {
    pub model: ToyModel,
    pub lr: f64,
    pub eval_batches: usize,
    pub modes: Vec<Phase>,
    pub weights_seen: Vec<Option<f64>>,
    pub fail_at: Option<(usize, usize)>,
    pub nan_loss: bool,
}

impl Default for ToyWorkload {
    fn default() -> Self {
        Self {
            model: ToyModel { w: 0.0, steps: 0 },
            lr: 0.1,
            eval_batches: 2,
            modes: Vec::new(),
            weights_seen: Vec::new(),
            fail_at: None,
            nan_loss: false,
        }
    }
}

impl ToyWorkload {
    pub fn loss(&self) -> f64 {
        if self.nan_loss {
            return f64::NAN;
        }
        (self.model.w - 1.0).powi(2)
    }
}

impl Workload for ToyWorkload {
    fn configure_meters(&mut self, _phase: Phase, meters: &mut MeterRegistry) -> Result<()> {
        meters.register("loss", AverageValueMeter::new(), None)?;
        Ok(())
    }

    fn set_mode(&mut self, phase: Phase) {
        self.modes.push(phase);
    }

    fn train_step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        if self.fail_at == Some((ctx.epoch, ctx.step.index)) {
            return Err(TrainingError::InvalidState {
                from: "step".into(),
                to: "diverged".into(),
            }
            .into());
        }
        if ctx.step.index == 0 {
            self.weights_seen.push(ctx.weight("consistency"));
        }
        let loss = self.loss();
        ctx.meters.add("loss", loss)?;
        ctx.scope.put(ScopeLevel::Batch, "loss", loss);
        self.model.w -= self.lr * 2.0 * (self.model.w - 1.0);
        self.model.steps += 1;
        Ok(())
    }

    fn eval_batches(&self) -> usize {
        self.eval_batches
    }

    fn eval_step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        ctx.meters.add("loss", self.loss())?;
        Ok(())
    }

    fn score(&self, train: &EpochResult, eval: Option<&EpochResult>) -> f64 {
        eval.unwrap_or(train)
            .value("loss", "mean")
            .unwrap_or(f64::NAN)
    }

    fn persistables(&self) -> Vec<(&str, &dyn Persistable)> {
        vec![("model", &self.model as &dyn Persistable)]
    }

    fn persistables_mut(&mut self) -> Vec<(&str, &mut dyn Persistable)> {
        vec![("model", &mut self.model as &mut dyn Persistable)]
    }
}

pub fn trainer_config(dir: &Path, max_epoch: usize, num_batches: usize) -> TrainerConfig {
    TrainerConfig {
        save_dir: dir.to_path_buf(),
        max_epoch,
        num_batches,
        high_is_better: false,
        ..TrainerConfig::default()
    }
}
