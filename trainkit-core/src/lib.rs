//! # Trainkit Core
//!
//! Core library for trainkit training runs.
//! Provides the trainer loop, hook dispatch, streaming meters, epoch-indexed
//! storage, checkpoint persistence, configuration merging and rank awareness.
//! Tensor math, models and optimizers stay with the workload.

pub mod checkpoint;
pub mod config;
pub mod device;
pub mod distributed;
pub mod error;
pub mod hooks;
pub mod meters;
pub mod persistence;
pub mod results;
pub mod schedule;
pub mod scope;
pub mod state;
pub mod storage;
pub mod trainer;

// Re-export commonly used types at the crate root.
pub use checkpoint::{Checkpoint, Checkpointer, LoadReport, ScoreDirection};
pub use config::{ConfigLoader, LoadedConfig, TrainerConfig, TrainkitConfig};
pub use device::Device;
pub use distributed::DistributedContext;
pub use error::{Result, TrainkitError};
pub use hooks::{
    Hook, HookContext, HookDispatcher, HookEvent, HookId, LossGuardHook, PeriodicHook,
    ProgressHook, RecordingHook, SharedHook, shared,
};
pub use meters::{
    AverageValueListMeter, AverageValueMeter, Meter, MeterInput, MeterRegistry,
    MultipleAverageValueMeter,
};
pub use results::{EpochResult, MeterResult};
pub use schedule::{ConstantScheduler, LinearScheduler, RampScheduler, ScheduleSet, WeightScheduler};
pub use scope::{ScopeLevel, VariableScope};
pub use state::{Persistable, StateDict};
pub use storage::{HistoricalContainer, Storage, StorageIncome, SummaryTable};
pub use trainer::{LoopPhase, Phase, RunState, StepContext, Trainer, Workload};
