//! The training loop.
//!
//! A [`Trainer`] owns the run state, hooks, meters, storage, schedules and
//! checkpointer, and drives a [`Workload`] (the collaborator holding the
//! model, optimizer and data) through
//! `Idle -> Training -> [TrainEpoch -> EvalEpoch]* -> Done`.
//!
//! After each epoch the master rank runs evaluation, records both phases in
//! [`Storage`], writes `last.pth` (and `best.pth` on improvement), optional
//! periodic checkpoints and `storage.csv`. Other ranks only train.

use crate::checkpoint::{Checkpoint, Checkpointer, LoadReport, NamedComponent, ScoreDirection};
use crate::config::{LoadedConfig, TrainerConfig};
use crate::device::Device;
use crate::distributed::DistributedContext;
use crate::error::{Result, StateError, TrainingError};
use crate::hooks::{HookContext, HookDispatcher, HookEvent, HookId, SharedHook, StepPosition};
use crate::meters::MeterRegistry;
use crate::results::EpochResult;
use crate::schedule::ScheduleSet;
use crate::scope::{ScopeLevel, VariableScope};
use crate::state::{self, Persistable, StateDict};
use crate::storage::{STORAGE_CSV, Storage, StorageIncome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which half of an epoch is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Eval,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Eval => write!(f, "eval"),
        }
    }
}

/// Position of the loop in its state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopPhase {
    #[default]
    Idle,
    Training,
    TrainEpoch,
    EvalEpoch,
    Done,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopPhase::Idle => "idle",
            LoopPhase::Training => "training",
            LoopPhase::TrainEpoch => "train_epoch",
            LoopPhase::EvalEpoch => "eval_epoch",
            LoopPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Epoch/iteration bookkeeping of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: Uuid,
    pub start_epoch: usize,
    pub max_epoch: usize,
    pub current_epoch: usize,
    pub current_iteration: usize,
    pub num_batches: usize,
    pub device: Device,
    pub save_dir: PathBuf,
    pub best_score: Option<f64>,
    pub phase: LoopPhase,
}

impl RunState {
    pub fn new(max_epoch: usize, num_batches: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            start_epoch: 0,
            max_epoch,
            current_epoch: 0,
            current_iteration: 0,
            num_batches,
            device: Device::Cpu,
            save_dir: PathBuf::new(),
            best_score: None,
            phase: LoopPhase::Idle,
        }
    }

    pub fn from_config(config: &TrainerConfig) -> Self {
        Self {
            device: config.device,
            save_dir: config.save_dir.clone(),
            ..Self::new(config.max_epoch, config.num_batches)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RunBuffers {
    run_id: Uuid,
    start_epoch: usize,
    current_epoch: usize,
    current_iteration: usize,
    best_score: Option<f64>,
}

impl Persistable for RunState {
    fn state_dict(&self) -> std::result::Result<StateDict, StateError> {
        state::to_state(&RunBuffers {
            run_id: self.run_id,
            start_epoch: self.start_epoch,
            current_epoch: self.current_epoch,
            current_iteration: self.current_iteration,
            best_score: self.best_score,
        })
    }

    /// Restores the buffers and moves `start_epoch` past the saved epoch so a
    /// resumed run never repeats it.
    fn load_state_dict(&mut self, state: &StateDict) -> std::result::Result<(), StateError> {
        let buffers: RunBuffers = state::from_state(state)?;
        self.run_id = buffers.run_id;
        self.current_epoch = buffers.current_epoch;
        self.current_iteration = buffers.current_iteration;
        self.best_score = buffers.best_score;
        self.start_epoch = buffers.current_epoch + 1;
        Ok(())
    }
}

/// What a workload sees during one step.
pub struct StepContext<'a> {
    pub epoch: usize,
    pub step: StepPosition,
    pub device: Device,
    pub meters: &'a mut MeterRegistry,
    pub scope: &'a mut VariableScope,
    pub schedules: &'a ScheduleSet,
}

impl StepContext<'_> {
    /// Current value of a named weight schedule.
    pub fn weight(&self, name: &str) -> Option<f64> {
        self.schedules.value(name)
    }
}

/// The collaborator that owns model, optimizer and data.
pub trait Workload {
    /// Register the meters for a phase. Called once per phase at construction.
    fn configure_meters(&mut self, phase: Phase, meters: &mut MeterRegistry) -> Result<()>;

    fn to_device(&mut self, _device: Device) -> Result<()> {
        Ok(())
    }

    /// Switch between training and evaluation behavior.
    fn set_mode(&mut self, _phase: Phase) {}

    fn train_step(&mut self, ctx: &mut StepContext<'_>) -> Result<()>;

    /// Evaluation iterations per epoch; zero disables the eval phase.
    fn eval_batches(&self) -> usize {
        0
    }

    fn eval_step(&mut self, _ctx: &mut StepContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Score compared across epochs to pick the best checkpoint.
    fn score(&self, train: &EpochResult, eval: Option<&EpochResult>) -> f64;

    /// Stateful parts to include in checkpoints, by unique name.
    fn persistables(&self) -> Vec<(&str, &dyn Persistable)> {
        Vec::new()
    }

    fn persistables_mut(&mut self) -> Vec<NamedComponent<'_>> {
        Vec::new()
    }
}

/// Component names reserved by the trainer inside a checkpoint.
pub const RUN_COMPONENT: &str = "run";
pub const TRAIN_METERS_COMPONENT: &str = "train_meters";
pub const EVAL_METERS_COMPONENT: &str = "eval_meters";
pub const STORAGE_COMPONENT: &str = "storage";
pub const SCHEDULES_COMPONENT: &str = "schedules";

const RESERVED_COMPONENTS: [&str; 5] = [
    RUN_COMPONENT,
    TRAIN_METERS_COMPONENT,
    EVAL_METERS_COMPONENT,
    STORAGE_COMPONENT,
    SCHEDULES_COMPONENT,
];

pub struct Trainer<W: Workload> {
    config: TrainerConfig,
    run: RunState,
    workload: W,
    hooks: HookDispatcher,
    train_meters: MeterRegistry,
    eval_meters: MeterRegistry,
    storage: Storage,
    schedules: ScheduleSet,
    scope: VariableScope,
    checkpointer: Checkpointer,
    dist: DistributedContext,
}

impl<W: Workload> fmt::Debug for Trainer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("run", &self.run)
            .field("hooks", &self.hooks)
            .field("train_meters", &self.train_meters.names())
            .field("eval_meters", &self.eval_meters.names())
            .finish()
    }
}

impl<W: Workload> Trainer<W> {
    pub fn new(mut workload: W, config: TrainerConfig, dist: DistributedContext) -> Result<Self> {
        config.validate()?;
        if let Some((name, _)) = workload
            .persistables()
            .into_iter()
            .find(|(name, _)| RESERVED_COMPONENTS.contains(name))
        {
            return Err(TrainingError::ReservedComponent {
                name: name.to_string(),
            }
            .into());
        }
        let mut train_meters = MeterRegistry::new();
        workload.configure_meters(Phase::Train, &mut train_meters)?;
        let mut eval_meters = MeterRegistry::new();
        if workload.eval_batches() > 0 {
            workload.configure_meters(Phase::Eval, &mut eval_meters)?;
        }
        let run = RunState::from_config(&config);
        debug!(
            run_id = %run.run_id,
            rank = dist.rank,
            train_meters = train_meters.len(),
            eval_meters = eval_meters.len(),
            "Created trainer"
        );
        Ok(Self {
            checkpointer: Checkpointer::new(&config.save_dir),
            config,
            run,
            workload,
            hooks: HookDispatcher::new(),
            train_meters,
            eval_meters,
            storage: Storage::new(),
            schedules: ScheduleSet::new(),
            scope: VariableScope::new(),
            dist,
        })
    }

    pub fn register_hook(&mut self, hook: SharedHook) -> Result<HookId> {
        self.hooks.register(hook)
    }

    pub fn register_hooks(&mut self, hooks: impl IntoIterator<Item = SharedHook>) -> Result<Vec<HookId>> {
        hooks.into_iter().map(|h| self.register_hook(h)).collect()
    }

    pub fn hook(&self, id: HookId) -> Option<SharedHook> {
        self.hooks.get(id)
    }

    /// Write the merged configuration into the run directory (master only).
    pub fn record_config(&self, loaded: &LoadedConfig) -> Result<Option<PathBuf>> {
        if !self.dist.is_master() {
            return Ok(None);
        }
        Ok(Some(loaded.write_snapshot(&self.config.save_dir)?))
    }

    /// Run every remaining epoch. Hook and workload errors abort the run;
    /// hooks are torn down on every exit path.
    pub fn start_training(&mut self) -> Result<()> {
        if self.run.phase != LoopPhase::Idle {
            return Err(TrainingError::InvalidState {
                from: self.run.phase.to_string(),
                to: LoopPhase::Training.to_string(),
            }
            .into());
        }
        let outcome = self.run_loop();
        if let Err(e) = self.hooks.teardown() {
            warn!(error = %e, "Hook teardown failed");
        }
        self.scope.clear(ScopeLevel::Train);
        outcome
    }

    fn run_loop(&mut self) -> Result<()> {
        self.workload.to_device(self.run.device)?;
        if self.dist.is_master() {
            std::fs::create_dir_all(&self.config.save_dir)?;
        }
        self.run.phase = LoopPhase::Training;
        info!(
            run_id = %self.run.run_id,
            start_epoch = self.run.start_epoch,
            max_epoch = self.run.max_epoch,
            device = %self.run.device,
            "Training started"
        );
        self.fire(HookEvent::BeforeTrain, None, None)?;

        for epoch in self.run.start_epoch..self.run.max_epoch {
            self.run.current_epoch = epoch;
            let train_result = self.run_epoch()?;
            if self.dist.is_master() {
                let eval_result = if self.workload.eval_batches() > 0 {
                    Some(self.eval_epoch()?)
                } else {
                    None
                };
                let score = self.workload.score(&train_result, eval_result.as_ref());
                self.storage
                    .put_income(&StorageIncome::new(train_result, eval_result), epoch)?;
                self.schedules.step_all();
                self.save_epoch(epoch, score)?;
            } else {
                self.schedules.step_all();
            }
        }

        self.run.phase = LoopPhase::Done;
        self.fire(HookEvent::AfterTrain, None, None)?;
        info!(run_id = %self.run.run_id, best_score = ?self.run.best_score, "Training finished");
        Ok(())
    }

    fn run_epoch(&mut self) -> Result<EpochResult> {
        self.run.phase = LoopPhase::TrainEpoch;
        self.workload.set_mode(Phase::Train);
        self.train_meters.reset();
        self.scope.clear(ScopeLevel::Epoch);
        self.fire(HookEvent::BeforeEpoch, Some(Phase::Train), None)?;

        let total = self.run.num_batches;
        for index in 0..total {
            self.run.current_iteration = index;
            let step = StepPosition { index, total };
            self.scope.clear(ScopeLevel::Batch);
            self.fire(HookEvent::BeforeStep, Some(Phase::Train), Some(step))?;
            let mut ctx = StepContext {
                epoch: self.run.current_epoch,
                step,
                device: self.run.device,
                meters: &mut self.train_meters,
                scope: &mut self.scope,
                schedules: &self.schedules,
            };
            self.workload
                .train_step(&mut ctx)
                .map_err(|e| TrainingError::StepFailed {
                    epoch: self.run.current_epoch,
                    iteration: index,
                    message: e.to_string(),
                })?;
            self.fire(HookEvent::AfterStep, Some(Phase::Train), Some(step))?;
        }

        let result = self
            .train_meters
            .tracking_status(None, true, self.config.cache_ttl)?;
        self.fire(HookEvent::AfterEpoch, Some(Phase::Train), None)?;
        Ok(result)
    }

    fn eval_epoch(&mut self) -> Result<EpochResult> {
        self.run.phase = LoopPhase::EvalEpoch;
        self.workload.set_mode(Phase::Eval);
        self.eval_meters.reset();
        self.fire(HookEvent::BeforeEvalEpoch, Some(Phase::Eval), None)?;

        let total = self.workload.eval_batches();
        for index in 0..total {
            let step = StepPosition { index, total };
            self.scope.clear(ScopeLevel::Batch);
            self.fire(HookEvent::BeforeEvalStep, Some(Phase::Eval), Some(step))?;
            let mut ctx = StepContext {
                epoch: self.run.current_epoch,
                step,
                device: self.run.device,
                meters: &mut self.eval_meters,
                scope: &mut self.scope,
                schedules: &self.schedules,
            };
            self.workload
                .eval_step(&mut ctx)
                .map_err(|e| TrainingError::StepFailed {
                    epoch: self.run.current_epoch,
                    iteration: index,
                    message: e.to_string(),
                })?;
            self.fire(HookEvent::AfterEvalStep, Some(Phase::Eval), Some(step))?;
        }

        let result = self
            .eval_meters
            .tracking_status(None, true, self.config.cache_ttl)?;
        self.fire(HookEvent::AfterEvalEpoch, Some(Phase::Eval), None)?;
        self.workload.set_mode(Phase::Train);
        Ok(result)
    }

    fn save_epoch(&mut self, epoch: usize, score: f64) -> Result<()> {
        let direction = ScoreDirection::from_high_is_better(self.config.high_is_better);
        let improved = direction.improves(score, self.run.best_score);
        if improved {
            self.run.best_score = Some(score);
        }
        let checkpoint = self.checkpoint()?;
        self.checkpointer.save_on_score(&checkpoint, improved, None)?;
        if self
            .config
            .save_every
            .is_some_and(|every| (epoch + 1) % every == 0)
        {
            self.checkpointer.periodic_save(&checkpoint, epoch, None)?;
        }
        if self.config.write_csv {
            self.storage.to_csv(&self.config.save_dir, STORAGE_CSV)?;
        }
        debug!(epoch, score, improved, "Epoch persisted");
        Ok(())
    }

    fn fire(
        &mut self,
        event: HookEvent,
        phase: Option<Phase>,
        step: Option<StepPosition>,
    ) -> Result<()> {
        let meters = match phase {
            Some(Phase::Train) => Some(&mut self.train_meters),
            Some(Phase::Eval) => Some(&mut self.eval_meters),
            None => None,
        };
        let mut ctx = HookContext {
            run: &self.run,
            dist: &self.dist,
            scope: &mut self.scope,
            meters,
            step,
        };
        self.hooks.fire(event, &mut ctx)
    }

    fn components(&self) -> Vec<(&str, &dyn Persistable)> {
        let mut out: Vec<(&str, &dyn Persistable)> = vec![
            (RUN_COMPONENT, &self.run as &dyn Persistable),
            (TRAIN_METERS_COMPONENT, &self.train_meters as &dyn Persistable),
            (EVAL_METERS_COMPONENT, &self.eval_meters as &dyn Persistable),
            (STORAGE_COMPONENT, &self.storage as &dyn Persistable),
            (SCHEDULES_COMPONENT, &self.schedules as &dyn Persistable),
        ];
        out.extend(self.workload.persistables());
        out
    }

    fn components_mut(&mut self) -> Vec<NamedComponent<'_>> {
        let mut out: Vec<NamedComponent<'_>> = vec![
            (RUN_COMPONENT, &mut self.run as &mut dyn Persistable),
            (TRAIN_METERS_COMPONENT, &mut self.train_meters as &mut dyn Persistable),
            (EVAL_METERS_COMPONENT, &mut self.eval_meters as &mut dyn Persistable),
            (STORAGE_COMPONENT, &mut self.storage as &mut dyn Persistable),
            (SCHEDULES_COMPONENT, &mut self.schedules as &mut dyn Persistable),
        ];
        out.extend(self.workload.persistables_mut());
        out
    }

    /// State of every registered component, by name.
    pub fn state_dict(&self) -> Result<BTreeMap<String, StateDict>> {
        let mut out = BTreeMap::new();
        for (name, component) in self.components() {
            out.insert(name.to_string(), component.state_dict()?);
        }
        Ok(out)
    }

    /// Snapshot of the run at its current epoch.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Ok(Checkpoint::new(
            self.run.run_id,
            self.run.current_epoch,
            self.state_dict()?,
        ))
    }

    /// Restore components from a checkpoint. See
    /// [`Checkpointer::load_components`] for the strict/lenient rules.
    pub fn load_state_dict(&mut self, checkpoint: &Checkpoint, strict: bool) -> Result<LoadReport> {
        let report = Checkpointer::load_components("Trainer", self.components_mut(), checkpoint, strict)?;
        info!(
            epoch = checkpoint.epoch,
            start_epoch = self.run.start_epoch,
            missing = report.missing_keys.len(),
            errors = report.errors.len(),
            "Loaded checkpoint"
        );
        Ok(report)
    }

    /// Load `path` (a checkpoint file, or a run directory holding `last.pth`).
    pub fn resume_from_checkpoint(&mut self, path: &Path) -> Result<LoadReport> {
        let checkpoint = Checkpointer::read(path, None)?;
        let strict = self.config.strict_load;
        self.load_state_dict(&checkpoint, strict)
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn run(&self) -> &RunState {
        &self.run
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    pub fn workload_mut(&mut self) -> &mut W {
        &mut self.workload
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn train_meters(&self) -> &MeterRegistry {
        &self.train_meters
    }

    pub fn eval_meters(&self) -> &MeterRegistry {
        &self.eval_meters
    }

    pub fn schedules(&self) -> &ScheduleSet {
        &self.schedules
    }

    pub fn schedules_mut(&mut self) -> &mut ScheduleSet {
        &mut self.schedules
    }

    pub fn scope(&self) -> &VariableScope {
        &self.scope
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    pub fn dist(&self) -> &DistributedContext {
        &self.dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meters::AverageValueMeter;

    struct Constant;

    impl Workload for Constant {
        fn configure_meters(&mut self, _phase: Phase, meters: &mut MeterRegistry) -> Result<()> {
            meters.register("loss", AverageValueMeter::new(), None)?;
            Ok(())
        }

        fn train_step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
            ctx.meters.add("loss", 1.0)?;
            Ok(())
        }

        fn score(&self, train: &EpochResult, _eval: Option<&EpochResult>) -> f64 {
            train.value("loss", "mean").unwrap_or(f64::NAN)
        }
    }

    fn config(dir: &Path) -> TrainerConfig {
        TrainerConfig {
            save_dir: dir.to_path_buf(),
            max_epoch: 2,
            num_batches: 3,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn test_run_state_resume_advances_start_epoch() {
        let mut run = RunState::new(10, 5);
        run.current_epoch = 4;
        run.best_score = Some(0.7);
        let state = run.state_dict().unwrap();

        let mut fresh = RunState::new(10, 5);
        fresh.load_state_dict(&state).unwrap();
        assert_eq!(fresh.start_epoch, 5);
        assert_eq!(fresh.current_epoch, 4);
        assert_eq!(fresh.best_score, Some(0.7));
        assert_eq!(fresh.run_id, run.run_id);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(Constant, config(dir.path()), DistributedContext::single()).unwrap();
        trainer.start_training().unwrap();
        assert_eq!(trainer.run().phase, LoopPhase::Done);
        let err = trainer.start_training().unwrap_err();
        assert!(err.to_string().contains("done -> training"));
    }

    struct ClashingName(AverageValueMeter);

    impl Workload for ClashingName {
        fn configure_meters(&mut self, phase: Phase, meters: &mut MeterRegistry) -> Result<()> {
            Constant.configure_meters(phase, meters)
        }

        fn train_step(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
            Constant.train_step(ctx)
        }

        fn score(&self, train: &EpochResult, eval: Option<&EpochResult>) -> f64 {
            Constant.score(train, eval)
        }

        fn persistables(&self) -> Vec<(&str, &dyn Persistable)> {
            vec![(STORAGE_COMPONENT, &self.0 as &dyn Persistable)]
        }
    }

    #[test]
    fn test_reserved_component_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = Trainer::new(
            ClashingName(AverageValueMeter::new()),
            config(dir.path()),
            DistributedContext::single(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'storage' is reserved"));
    }

    #[test]
    fn test_no_eval_phase_without_eval_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(Constant, config(dir.path()), DistributedContext::single()).unwrap();
        trainer.start_training().unwrap();
        assert!(trainer.eval_meters().is_empty());
        assert_eq!(trainer.storage().names(), vec!["train_loss"]);
        assert_eq!(trainer.storage().epochs(), vec![0, 1]);
    }

    #[test]
    fn test_non_master_skips_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let save_dir = dir.path().join("run");
        let dist = DistributedContext {
            rank: 1,
            local_rank: 1,
            world_size: 2,
        };
        let mut trainer = Trainer::new(Constant, config(&save_dir), dist).unwrap();
        trainer.start_training().unwrap();
        assert!(trainer.storage().is_empty());
        assert!(!save_dir.exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.num_batches = 0;
        assert!(Trainer::new(Constant, cfg, DistributedContext::single()).is_err());
    }
}
