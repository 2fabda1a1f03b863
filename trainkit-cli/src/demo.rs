//! Synthetic linear-regression workload used by `trainkit train`.
//!
//! Data is drawn from `y = w·x + b + noise` with a seeded RNG, and a linear
//! model is fitted with momentum SGD. The learning rate is scaled by the
//! `warmup` weight schedule. The epoch score is the coefficient of
//! determination on the evaluation split, so higher is better.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use trainkit_core::error::{StateError, TrainingError};
use trainkit_core::scope::ScopeLevel;
use trainkit_core::state::{self, StateDict};
use trainkit_core::{
    AverageValueMeter, Device, EpochResult, MeterRegistry, Persistable, Phase, Result,
    StepContext, Workload,
};

/// Name of the learning-rate warmup schedule read by the workload.
pub const WARMUP_SCHEDULE: &str = "warmup";

/// Shape of the generated problem and the optimizer settings.
#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct DemoOptions {
    /// Input features
    #[arg(long, default_value = "8")]
    pub features: usize,

    /// Training samples
    #[arg(long, default_value = "512")]
    pub samples: usize,

    /// Evaluation samples
    #[arg(long, default_value = "128")]
    pub eval_samples: usize,

    #[arg(long, default_value = "32")]
    pub batch_size: usize,

    /// Peak learning rate
    #[arg(long, default_value = "0.05")]
    pub lr: f64,

    #[arg(long, default_value = "0.9")]
    pub momentum: f64,

    /// Amplitude of the uniform label noise
    #[arg(long, default_value = "0.1")]
    pub noise: f64,

    /// Epochs over which the learning rate ramps up
    #[arg(long, default_value = "3")]
    pub warmup_epochs: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            features: 8,
            samples: 512,
            eval_samples: 128,
            batch_size: 32,
            lr: 0.05,
            momentum: 0.9,
            noise: 0.1,
            warmup_epochs: 3,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
struct Dataset {
    xs: Vec<Vec<f64>>,
    ys: Vec<f64>,
}

impl Dataset {
    fn generate(rng: &mut StdRng, truth: &LinearModel, samples: usize, noise: f64) -> Self {
        let mut xs = Vec::with_capacity(samples);
        let mut ys = Vec::with_capacity(samples);
        for _ in 0..samples {
            let x: Vec<f64> = (0..truth.weights.len())
                .map(|_| rng.gen_range(-1.0..1.0))
                .collect();
            let jitter = if noise > 0.0 {
                rng.gen_range(-noise..noise)
            } else {
                0.0
            };
            ys.push(truth.predict(&x) + jitter);
            xs.push(x);
        }
        Self { xs, ys }
    }

    fn len(&self) -> usize {
        self.ys.len()
    }

    /// Row indices of batch `index`, wrapping around the end of the data.
    fn batch(&self, index: usize, batch_size: usize) -> Vec<usize> {
        let start = index * batch_size;
        (start..start + batch_size).map(|i| i % self.len()).collect()
    }

    fn target_variance(&self) -> f64 {
        let n = self.len() as f64;
        let mean = self.ys.iter().sum::<f64>() / n;
        self.ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LinearModel {
    fn zeros(features: usize) -> Self {
        Self {
            weights: vec![0.0; features],
            bias: 0.0,
        }
    }

    fn predict(&self, x: &[f64]) -> f64 {
        self.weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + self.bias
    }
}

/// SGD with classical momentum over weights and bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub lr: f64,
    pub momentum: f64,
    velocity: Vec<f64>,
}

impl Sgd {
    fn new(lr: f64, momentum: f64, params: usize) -> Self {
        Self {
            lr,
            momentum,
            velocity: vec![0.0; params],
        }
    }

    /// `grads` holds the weight gradients followed by the bias gradient.
    fn step(&mut self, model: &mut LinearModel, grads: &[f64], scale: f64) {
        let lr = self.lr * scale;
        for (i, g) in grads.iter().enumerate() {
            self.velocity[i] = self.momentum * self.velocity[i] + g;
            let update = lr * self.velocity[i];
            match model.weights.get_mut(i) {
                Some(w) => *w -= update,
                None => model.bias -= update,
            }
        }
    }
}

macro_rules! serde_persistable {
    ($($ty:ty),+) => {
        $(
            impl Persistable for $ty {
                fn state_dict(&self) -> std::result::Result<StateDict, StateError> {
                    state::to_state(self)
                }

                fn load_state_dict(&mut self, state: &StateDict) -> std::result::Result<(), StateError> {
                    *self = state::from_state(state)?;
                    Ok(())
                }
            }
        )+
    };
}

serde_persistable!(LinearModel, Sgd);

pub struct LinearRegression {
    model: LinearModel,
    optimizer: Sgd,
    train: Dataset,
    eval: Dataset,
    batch_size: usize,
    target_variance: f64,
    phase: Phase,
}

impl LinearRegression {
    pub fn new(options: &DemoOptions) -> Self {
        let features = options.features.max(1);
        let mut rng = StdRng::seed_from_u64(options.seed);
        let truth = LinearModel {
            weights: (0..features).map(|_| rng.gen_range(-2.0..2.0)).collect(),
            bias: rng.gen_range(-1.0..1.0),
        };
        let train = Dataset::generate(&mut rng, &truth, options.samples.max(1), options.noise);
        let eval = Dataset::generate(&mut rng, &truth, options.eval_samples, options.noise);
        let target_variance = if !eval.ys.is_empty() {
            eval.target_variance()
        } else {
            train.target_variance()
        };
        Self {
            model: LinearModel::zeros(features),
            optimizer: Sgd::new(options.lr, options.momentum, features + 1),
            train,
            eval,
            batch_size: options.batch_size.max(1),
            target_variance,
            phase: Phase::Train,
        }
    }

    pub fn model(&self) -> &LinearModel {
        &self.model
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Mean squared error, mean absolute error and the gradient of the MSE
    /// over the given rows.
    fn batch_stats(&self, data: &Dataset, rows: &[usize]) -> (f64, f64, Vec<f64>) {
        let features = self.model.weights.len();
        let mut grads = vec![0.0; features + 1];
        let (mut sq, mut abs) = (0.0, 0.0);
        for &row in rows {
            let x = &data.xs[row];
            let err = self.model.predict(x) - data.ys[row];
            sq += err * err;
            abs += err.abs();
            for (g, v) in grads.iter_mut().zip(x) {
                *g += 2.0 * err * v;
            }
            grads[features] += 2.0 * err;
        }
        let n = rows.len().max(1) as f64;
        grads.iter_mut().for_each(|g| *g /= n);
        (sq / n, abs / n, grads)
    }
}

impl Workload for LinearRegression {
    fn configure_meters(&mut self, _phase: Phase, meters: &mut MeterRegistry) -> Result<()> {
        meters.register("loss", AverageValueMeter::new(), Some("error"))?;
        meters.register("mae", AverageValueMeter::new(), Some("error"))?;
        Ok(())
    }

    fn to_device(&mut self, device: Device) -> Result<()> {
        match device {
            Device::Cpu => Ok(()),
            other => Err(TrainingError::InvalidDevice {
                spec: format!("{other} (the demo workload runs on cpu only)"),
            }
            .into()),
        }
    }

    fn set_mode(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn train_step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let rows = self.train.batch(ctx.step.index, self.batch_size);
        let (mse, mae, grads) = self.batch_stats(&self.train, &rows);
        let scale = ctx.weight(WARMUP_SCHEDULE).unwrap_or(1.0);
        self.optimizer.step(&mut self.model, &grads, scale);
        ctx.meters.add("loss", mse)?;
        ctx.meters.add("mae", mae)?;
        ctx.scope
            .put(ScopeLevel::Batch, "lr", self.optimizer.lr * scale);
        Ok(())
    }

    fn eval_batches(&self) -> usize {
        self.eval.len().div_ceil(self.batch_size)
    }

    fn eval_step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let start = ctx.step.index * self.batch_size;
        let end = (start + self.batch_size).min(self.eval.len());
        let rows: Vec<usize> = (start..end).collect();
        let (mse, mae, _) = self.batch_stats(&self.eval, &rows);
        ctx.meters.add("loss", mse)?;
        ctx.meters.add("mae", mae)?;
        Ok(())
    }

    fn score(&self, train: &EpochResult, eval: Option<&EpochResult>) -> f64 {
        let mse = eval
            .unwrap_or(train)
            .value("loss", "mean")
            .unwrap_or(f64::NAN);
        if self.target_variance > 0.0 {
            1.0 - mse / self.target_variance
        } else {
            -mse
        }
    }

    fn persistables(&self) -> Vec<(&str, &dyn Persistable)> {
        vec![
            ("model", &self.model as &dyn Persistable),
            ("optimizer", &self.optimizer as &dyn Persistable),
        ]
    }

    fn persistables_mut(&mut self) -> Vec<(&str, &mut dyn Persistable)> {
        vec![
            ("model", &mut self.model as &mut dyn Persistable),
            ("optimizer", &mut self.optimizer as &mut dyn Persistable),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainkit_core::hooks::StepPosition;
    use trainkit_core::{
        DistributedContext, RampScheduler, ScheduleSet, Trainer, TrainerConfig, VariableScope,
    };

    fn small() -> DemoOptions {
        DemoOptions {
            features: 3,
            samples: 64,
            eval_samples: 20,
            batch_size: 8,
            noise: 0.0,
            ..DemoOptions::default()
        }
    }

    #[test]
    fn test_data_is_seeded() {
        let a = LinearRegression::new(&small());
        let b = LinearRegression::new(&small());
        assert_eq!(a.train.ys, b.train.ys);
        let c = LinearRegression::new(&DemoOptions { seed: 7, ..small() });
        assert_ne!(a.train.ys, c.train.ys);
    }

    #[test]
    fn test_batches_wrap_and_eval_covers_split() {
        let workload = LinearRegression::new(&small());
        assert_eq!(workload.train.batch(7, 8), (56..64).collect::<Vec<_>>());
        assert_eq!(workload.train.batch(8, 8), (0..8).collect::<Vec<_>>());
        assert_eq!(workload.eval_batches(), 3);
    }

    #[test]
    fn test_train_step_lowers_the_loss() {
        let mut workload = LinearRegression::new(&small());
        let mut meters = MeterRegistry::new();
        workload.configure_meters(Phase::Train, &mut meters).unwrap();
        let mut scope = VariableScope::new();
        let schedules = ScheduleSet::new();
        let all: Vec<usize> = (0..workload.train.len()).collect();
        let (before, _, _) = workload.batch_stats(&workload.train, &all);
        for index in 0..40 {
            let mut ctx = StepContext {
                epoch: 0,
                step: StepPosition { index, total: 40 },
                device: Device::Cpu,
                meters: &mut meters,
                scope: &mut scope,
                schedules: &schedules,
            };
            workload.train_step(&mut ctx).unwrap();
        }
        let (after, _, _) = workload.batch_stats(&workload.train, &all);
        assert!(after < before * 0.5, "{after} !< {before} / 2");
        assert_eq!(scope.get(ScopeLevel::Batch, "lr"), Some(&serde_json::json!(0.05)));
    }

    #[test]
    fn test_gpu_is_rejected() {
        let mut workload = LinearRegression::new(&small());
        assert!(workload.to_device(Device::Cuda(0)).is_err());
    }

    #[test]
    fn test_full_run_fits_the_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainerConfig {
            save_dir: dir.path().to_path_buf(),
            max_epoch: 8,
            num_batches: 8,
            ..TrainerConfig::default()
        };
        let mut trainer = Trainer::new(
            LinearRegression::new(&small()),
            config,
            DistributedContext::single(),
        )
        .unwrap();
        trainer
            .schedules_mut()
            .insert(WARMUP_SCHEDULE, RampScheduler::new(0, 2, 0.1, 1.0));
        trainer.start_training().unwrap();

        let best = trainer.run().best_score.unwrap();
        assert!(best > 0.9, "r2 = {best}");
        assert_eq!(trainer.storage().epochs(), (0..8).collect::<Vec<_>>());
        assert_eq!(trainer.workload().phase(), Phase::Train);
        assert!(dir.path().join("best.pth").is_file());
    }
}
