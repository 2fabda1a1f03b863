//! Lifecycle hooks for the training loop.
//!
//! Hooks are registered with a [`HookDispatcher`] and invoked in registration
//! order at every lifecycle point of the loop. A hook never holds a reference
//! to the trainer: each callback receives a [`HookContext`] borrowing the run
//! state, the active meters and the variable scope for the duration of the
//! call. Registration hands back a [`HookId`], a plain handle that can be used
//! to look the hook up again.

use crate::distributed::DistributedContext;
use crate::error::{HookError, Result};
use crate::meters::{DEFAULT_CACHE_TTL, MeterRegistry};
use crate::results::EpochResult;
use crate::scope::VariableScope;
use crate::trainer::RunState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Lifecycle points at which hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeTrain,
    AfterTrain,
    BeforeEpoch,
    AfterEpoch,
    BeforeStep,
    AfterStep,
    BeforeEvalEpoch,
    AfterEvalEpoch,
    BeforeEvalStep,
    AfterEvalStep,
}

impl HookEvent {
    pub const ALL: [HookEvent; 10] = [
        HookEvent::BeforeTrain,
        HookEvent::AfterTrain,
        HookEvent::BeforeEpoch,
        HookEvent::AfterEpoch,
        HookEvent::BeforeStep,
        HookEvent::AfterStep,
        HookEvent::BeforeEvalEpoch,
        HookEvent::AfterEvalEpoch,
        HookEvent::BeforeEvalStep,
        HookEvent::AfterEvalStep,
    ];

    /// Return the event name used in logs and error messages.
    pub fn event_name(&self) -> &'static str {
        match self {
            HookEvent::BeforeTrain => "before_train",
            HookEvent::AfterTrain => "after_train",
            HookEvent::BeforeEpoch => "before_epoch",
            HookEvent::AfterEpoch => "after_epoch",
            HookEvent::BeforeStep => "before_step",
            HookEvent::AfterStep => "after_step",
            HookEvent::BeforeEvalEpoch => "before_eval_epoch",
            HookEvent::AfterEvalEpoch => "after_eval_epoch",
            HookEvent::BeforeEvalStep => "before_eval_step",
            HookEvent::AfterEvalStep => "after_eval_step",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Non-owning handle to a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook-{}", self.0)
    }
}

/// Position of the current step inside its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPosition {
    pub index: usize,
    pub total: usize,
}

impl StepPosition {
    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.total
    }
}

/// Everything a hook may touch while one callback runs.
pub struct HookContext<'a> {
    pub run: &'a RunState,
    pub dist: &'a DistributedContext,
    pub scope: &'a mut VariableScope,
    /// Meters of the active phase; `None` outside epochs.
    pub meters: Option<&'a mut MeterRegistry>,
    /// Set for step events only.
    pub step: Option<StepPosition>,
}

/// A unit of cross-cutting behavior. Every callback defaults to a no-op.
pub trait Hook: Send {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_register(&mut self, _id: HookId) {}

    fn before_train(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_train(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_epoch(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_epoch(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_step(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_step(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_eval_epoch(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_eval_epoch(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_eval_step(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_eval_step(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Release anything captured from the run. Called once after `after_train`.
    fn teardown(&mut self) {}
}

fn invoke(hook: &mut dyn Hook, event: HookEvent, ctx: &mut HookContext<'_>) -> Result<()> {
    match event {
        HookEvent::BeforeTrain => hook.before_train(ctx),
        HookEvent::AfterTrain => hook.after_train(ctx),
        HookEvent::BeforeEpoch => hook.before_epoch(ctx),
        HookEvent::AfterEpoch => hook.after_epoch(ctx),
        HookEvent::BeforeStep => hook.before_step(ctx),
        HookEvent::AfterStep => hook.after_step(ctx),
        HookEvent::BeforeEvalEpoch => hook.before_eval_epoch(ctx),
        HookEvent::AfterEvalEpoch => hook.after_eval_epoch(ctx),
        HookEvent::BeforeEvalStep => hook.before_eval_step(ctx),
        HookEvent::AfterEvalStep => hook.after_eval_step(ctx),
    }
}

/// A hook shared between its owner and the dispatcher.
pub type SharedHook = Arc<Mutex<dyn Hook>>;

/// Wrap a hook for registration while keeping a typed handle to it.
pub fn shared<H: Hook + 'static>(hook: H) -> Arc<Mutex<H>> {
    Arc::new(Mutex::new(hook))
}

/// Ordered hook sequence.
#[derive(Default)]
pub struct HookDispatcher {
    hooks: Vec<(HookId, SharedHook)>,
    next_id: u64,
}

impl fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("hooks", &self.ids())
            .finish()
    }
}

fn identity(hook: &SharedHook) -> *const () {
    Arc::as_ptr(hook) as *const ()
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook unless the same instance is already registered.
    /// Returns the hook's handle either way.
    pub fn register(&mut self, hook: SharedHook) -> Result<HookId> {
        if let Some((id, _)) = self
            .hooks
            .iter()
            .find(|(_, h)| identity(h) == identity(&hook))
        {
            debug!(hook = %id, "Hook already registered, skipping");
            return Ok(*id);
        }
        let id = HookId(self.next_id);
        self.next_id += 1;
        {
            let mut guard = hook
                .lock()
                .map_err(|_| HookError::Poisoned { name: id.to_string() })?;
            guard.on_register(id);
            debug!(hook = %id, name = guard.name(), "Registered hook");
        }
        self.hooks.push((id, hook));
        Ok(id)
    }

    /// Look a hook up by handle.
    pub fn get(&self, id: HookId) -> Option<SharedHook> {
        self.hooks
            .iter()
            .find(|(hid, _)| *hid == id)
            .map(|(_, h)| Arc::clone(h))
    }

    /// Invoke `event` on every hook in registration order. The first error
    /// stops dispatch and is returned unchanged.
    pub fn fire(&self, event: HookEvent, ctx: &mut HookContext<'_>) -> Result<()> {
        for (id, hook) in &self.hooks {
            let mut guard = hook
                .lock()
                .map_err(|_| HookError::Poisoned { name: id.to_string() })?;
            if let Err(e) = invoke(&mut *guard, event, ctx) {
                warn!(hook = guard.name(), event = %event, error = %e, "Hook failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Call `teardown` on every hook.
    pub fn teardown(&self) -> Result<()> {
        for (id, hook) in &self.hooks {
            hook.lock()
                .map_err(|_| HookError::Poisoned { name: id.to_string() })?
                .teardown();
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<HookId> {
        self.hooks.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Callback run by a [`PeriodicHook`].
pub type PeriodicAction = Box<dyn FnMut(&mut HookContext<'_>) -> Result<()> + Send>;

/// Runs an action every `period` training steps and after the last step of
/// each epoch. The action is dropped once training ends.
pub struct PeriodicHook {
    period: usize,
    action: Option<PeriodicAction>,
}

impl PeriodicHook {
    pub fn new(
        period: usize,
        action: impl FnMut(&mut HookContext<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            period: period.max(1),
            action: Some(Box::new(action)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.action.is_some()
    }
}

impl Hook for PeriodicHook {
    fn name(&self) -> &str {
        "PeriodicHook"
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        let Some(step) = ctx.step else {
            return Ok(());
        };
        if (step.index + 1) % self.period != 0 && !step.is_last() {
            return Ok(());
        }
        match self.action.as_mut() {
            Some(action) => action(ctx),
            None => Ok(()),
        }
    }

    fn after_train(&mut self, _ctx: &mut HookContext<'_>) -> Result<()> {
        self.action = None;
        Ok(())
    }

    fn teardown(&mut self) {
        self.action = None;
    }
}

/// Logs the cached meter snapshot every `every` steps and the exact
/// snapshot at the end of each epoch. Silent on non-master ranks.
///
/// The registry cache is polled on every step so a logged line is at most
/// `cache_ttl` steps stale.
#[derive(Debug, Clone)]
pub struct ProgressHook {
    every: usize,
    cache_ttl: usize,
    last_logged: Option<EpochResult>,
}

impl Default for ProgressHook {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ProgressHook {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            cache_ttl: DEFAULT_CACHE_TTL,
            last_logged: None,
        }
    }

    /// The snapshot behind the most recent progress line.
    pub fn last_logged(&self) -> Option<&EpochResult> {
        self.last_logged.as_ref()
    }

    pub fn with_cache_ttl(mut self, cache_ttl: usize) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    fn log_step(&mut self, phase: &str, ctx: &mut HookContext<'_>) -> Result<()> {
        if !ctx.dist.is_master() {
            return Ok(());
        }
        let (Some(step), Some(meters)) = (ctx.step, ctx.meters.as_deref_mut()) else {
            return Ok(());
        };
        let status = meters.tracking_status(None, false, self.cache_ttl)?;
        if (step.index + 1) % self.every != 0 && !step.is_last() {
            return Ok(());
        }
        info!(
            phase,
            epoch = ctx.run.current_epoch,
            step = step.index + 1,
            total = step.total,
            "{}",
            status.to_string().replace('\n', " ")
        );
        self.last_logged = Some(status);
        Ok(())
    }

    fn log_epoch(&mut self, phase: &str, ctx: &mut HookContext<'_>) -> Result<()> {
        if !ctx.dist.is_master() {
            return Ok(());
        }
        let Some(meters) = ctx.meters.as_deref_mut() else {
            return Ok(());
        };
        let status = meters.tracking_status(None, true, self.cache_ttl)?;
        info!(
            phase,
            epoch = ctx.run.current_epoch,
            "{}",
            status.to_string().replace('\n', " ")
        );
        self.last_logged = Some(status);
        Ok(())
    }
}

impl Hook for ProgressHook {
    fn name(&self) -> &str {
        "ProgressHook"
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.log_step("train", ctx)
    }

    fn after_eval_step(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.log_step("eval", ctx)
    }

    fn after_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.log_epoch("train", ctx)
    }

    fn after_eval_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.log_epoch("eval", ctx)
    }
}

/// Fails the run when a training meter's epoch mean is NaN/infinite, or
/// spikes above `threshold` times the mean of the recent window.
#[derive(Debug, Clone)]
pub struct LossGuardHook {
    meter: String,
    threshold: f64,
    window: Vec<f64>,
    window_size: usize,
}

impl LossGuardHook {
    pub fn new(meter: impl Into<String>) -> Self {
        Self {
            meter: meter.into(),
            threshold: f64::INFINITY,
            window: Vec::new(),
            window_size: 5,
        }
    }

    pub fn with_spike_threshold(mut self, threshold: f64, window_size: usize) -> Self {
        self.threshold = threshold;
        self.window_size = window_size.max(1);
        self
    }

    /// Feed one epoch value; returns the reason when it should stop the run.
    pub fn check(&mut self, value: f64) -> Option<String> {
        if !value.is_finite() {
            return Some(format!("`{}` mean is {value}", self.meter));
        }
        self.window.push(value);
        if self.window.len() > self.window_size {
            self.window.remove(0);
        }
        if self.window.len() >= 3 {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            if value > mean * self.threshold {
                return Some(format!(
                    "`{}` spiked to {value:.4} (window mean {mean:.4})",
                    self.meter
                ));
            }
        }
        None
    }
}

impl Hook for LossGuardHook {
    fn name(&self) -> &str {
        "LossGuardHook"
    }

    fn after_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        let Some(meters) = ctx.meters.as_deref_mut() else {
            return Ok(());
        };
        let status = meters.tracking_status(None, true, DEFAULT_CACHE_TTL)?;
        let Some(value) = status.value(&self.meter, "mean") else {
            return Ok(());
        };
        match self.check(value) {
            Some(message) => Err(HookError::Failed {
                hook: "LossGuardHook".into(),
                event: HookEvent::AfterEpoch.event_name().into(),
                message,
            }
            .into()),
            None => Ok(()),
        }
    }
}

/// One event seen by a [`RecordingHook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event: HookEvent,
    pub epoch: usize,
    pub step: Option<usize>,
}

/// Records every event it receives, optionally mirroring `label:event`
/// lines into a sink shared with other recorders.
#[derive(Debug, Default)]
pub struct RecordingHook {
    label: String,
    id: Option<HookId>,
    events: Vec<RecordedEvent>,
    sink: Option<Arc<Mutex<Vec<String>>>>,
    torn_down: bool,
}

impl RecordingHook {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_sink(mut self, sink: Arc<Mutex<Vec<String>>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn id(&self) -> Option<HookId> {
        self.id
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn count(&self, event: HookEvent) -> usize {
        self.events.iter().filter(|e| e.event == event).count()
    }

    pub fn torn_down(&self) -> bool {
        self.torn_down
    }

    fn record(&mut self, event: HookEvent, ctx: &HookContext<'_>) -> Result<()> {
        self.events.push(RecordedEvent {
            event,
            epoch: ctx.run.current_epoch,
            step: ctx.step.map(|s| s.index),
        });
        if let Some(sink) = &self.sink {
            sink.lock()
                .map_err(|_| HookError::Poisoned {
                    name: self.label.clone(),
                })?
                .push(format!("{}:{}", self.label, event));
        }
        Ok(())
    }
}

impl Hook for RecordingHook {
    fn name(&self) -> &str {
        &self.label
    }

    fn on_register(&mut self, id: HookId) {
        self.id = Some(id);
    }

    fn before_train(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::BeforeTrain, ctx)
    }

    fn after_train(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::AfterTrain, ctx)
    }

    fn before_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::BeforeEpoch, ctx)
    }

    fn after_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::AfterEpoch, ctx)
    }

    fn before_step(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::BeforeStep, ctx)
    }

    fn after_step(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::AfterStep, ctx)
    }

    fn before_eval_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::BeforeEvalEpoch, ctx)
    }

    fn after_eval_epoch(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::AfterEvalEpoch, ctx)
    }

    fn before_eval_step(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::BeforeEvalStep, ctx)
    }

    fn after_eval_step(&mut self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.record(HookEvent::AfterEvalStep, ctx)
    }

    fn teardown(&mut self) {
        self.torn_down = true;
    }
}
