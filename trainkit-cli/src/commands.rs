//! CLI subcommand handlers.

use crate::demo::{DemoOptions, LinearRegression, WARMUP_SCHEDULE};
use crate::logging::{self, Verbosity};
use crate::{Commands, ConfigArgs};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};
use trainkit_core::config::LoggingConfig;
use trainkit_core::trainer::{RUN_COMPONENT, STORAGE_COMPONENT};
use trainkit_core::{
    Checkpointer, ConfigLoader, DistributedContext, LoadedConfig, LossGuardHook, Persistable,
    ProgressHook, RampScheduler, SharedHook, Storage, Trainer, TrainkitConfig, shared,
};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, verbosity: Verbosity) -> anyhow::Result<()> {
    let dist = DistributedContext::from_env();
    match command {
        Commands::Config { source } => {
            let loaded = load_config(&source)?;
            let settings = loaded.settings()?;
            let _guard = logging::init(verbosity, &settings.logging, &dist);
            report_unknown(&loaded);
            print!("{}", loaded.to_yaml()?);
            Ok(())
        }
        Commands::Train {
            source,
            demo,
            log_every,
        } => {
            let loaded = load_config(&source)?;
            let settings = loaded.settings()?;
            let _guard = logging::init(verbosity, &settings.logging, &dist);
            report_unknown(&loaded);
            let trainer = run_demo(&loaded, &settings, &demo, log_every, dist)?;
            if dist.is_master() {
                print!("{}", trainer.storage().summary().to_csv_string());
            }
            Ok(())
        }
        Commands::Inspect { path, name } => {
            let _guard = logging::init(verbosity, &LoggingConfig::default(), &dist);
            print!("{}", inspect_report(&path, &name)?);
            Ok(())
        }
    }
}

fn load_config(source: &ConfigArgs) -> anyhow::Result<LoadedConfig> {
    let mut loader = ConfigLoader::new()
        .strict(!source.lenient)
        .overrides(source.overrides.iter().cloned());
    if let Some(base) = &source.config {
        loader = loader.base(base.clone());
    }
    for path in &source.optional {
        loader = loader.optional(path.clone());
    }
    Ok(loader.load()?)
}

fn report_unknown(loaded: &LoadedConfig) {
    for key in &loaded.unknown {
        warn!(path = %key.path, suggestion = ?key.suggestion, "Ignoring unknown override key");
    }
}

/// Build the demo trainer from merged settings, resume if asked, and train.
fn run_demo(
    loaded: &LoadedConfig,
    settings: &TrainkitConfig,
    options: &DemoOptions,
    log_every: usize,
    dist: DistributedContext,
) -> anyhow::Result<Trainer<LinearRegression>> {
    let mut trainer = Trainer::new(
        LinearRegression::new(options),
        settings.trainer.clone(),
        dist,
    )?;
    if options.warmup_epochs > 0 {
        trainer.schedules_mut().insert(
            WARMUP_SCHEDULE,
            RampScheduler::new(0, options.warmup_epochs, 0.1, 1.0),
        );
    }
    trainer.register_hooks([
        shared(ProgressHook::new(log_every).with_cache_ttl(settings.trainer.cache_ttl))
            as SharedHook,
        shared(LossGuardHook::new("loss")) as SharedHook,
    ])?;

    if let Some(path) = &settings.trainer.resume {
        let report = trainer.resume_from_checkpoint(path)?;
        info!(
            path = %path.display(),
            start_epoch = trainer.run().start_epoch,
            missing = ?report.missing_keys,
            "Resuming run"
        );
    }
    if let Some(path) = trainer.record_config(loaded)? {
        info!(path = %path.display(), "Wrote config snapshot");
    }

    trainer.start_training()?;
    info!(
        best_score = ?trainer.run().best_score,
        weights = ?trainer.workload().model().weights,
        bias = trainer.workload().model().bias,
        "Demo run finished"
    );
    Ok(trainer)
}

/// Human-readable dump of a checkpoint: metadata, run buffers and the stored
/// metric table as CSV.
fn inspect_report(path: &Path, name: &str) -> anyhow::Result<String> {
    let checkpoint = Checkpointer::read(path, Some(name))?;
    let mut out = String::new();
    writeln!(out, "run_id: {}", checkpoint.run_id)?;
    writeln!(out, "epoch: {}", checkpoint.epoch)?;
    writeln!(out, "saved_at: {}", checkpoint.saved_at.to_rfc3339())?;
    writeln!(
        out,
        "components: {}",
        checkpoint
            .components
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    )?;
    if let Some(run) = checkpoint.component(RUN_COMPONENT) {
        writeln!(out, "run: {}", serde_json::to_string(run)?)?;
    }
    if let Some(state) = checkpoint.component(STORAGE_COMPONENT) {
        let mut storage = Storage::new();
        storage.load_state_dict(state)?;
        writeln!(out)?;
        out.push_str(&storage.summary().to_csv_string());
    }
    Ok(out)
}
