//! Error types for the trainkit core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering configuration, meters, storage, checkpointing, hooks and the
//! training loop itself.

use std::path::PathBuf;

/// Top-level error type for the trainkit core library.
#[derive(Debug, thiserror::Error)]
pub enum TrainkitError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Meter error: {0}")]
    Meter(#[from] MeterError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from loading, merging and validating configuration trees.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported configuration format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Configuration parse error in {source_name}: {message}")]
    ParseError {
        source_name: String,
        message: String,
    },

    #[error("Invalid override '{raw}': {reason}")]
    InvalidOverride { raw: String, reason: String },

    #[error("Unknown configuration keys compared with base config: {}", format_unknown(.keys))]
    UnknownKeys { keys: Vec<UnknownKey> },

    #[error("Failed to extract settings: {message}")]
    Extract { message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// An override path absent from the base configuration, with the closest
/// known path when one is similar enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKey {
    pub path: String,
    pub suggestion: Option<String>,
}

fn format_unknown(keys: &[UnknownKey]) -> String {
    keys.iter()
        .map(|k| match &k.suggestion {
            Some(s) => format!("`{}` (possibly `{}`)", k.path, s),
            None => format!("`{}`", k.path),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from meter registration and aggregation.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error("Meter already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Meter not found: {name}")]
    NotFound { name: String },

    #[error("Meter group not found: {group}")]
    GroupNotFound { group: String },

    #[error("Value for '{key}' is not numeric: {value}")]
    NonNumeric { key: String, value: String },

    #[error("Meter '{meter}' does not accept {input} input")]
    UnsupportedInput { meter: String, input: String },
}

/// Errors from the epoch-indexed historical storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No history recorded under '{name}'")]
    NotFound { name: String },

    #[error("No record for epoch {epoch} under '{name}'")]
    EpochNotFound { name: String, epoch: usize },

    #[error("Epoch {epoch} precedes last recorded epoch {last} under '{name}'")]
    EpochRegression {
        name: String,
        epoch: usize,
        last: usize,
    },

    #[error("Storage directory does not exist: {path}")]
    MissingDirectory { path: PathBuf },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a single component while extracting or restoring state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("missing key `{key}`")]
    MissingKey { key: String },

    #[error("type mismatch at `{key}`: expected {expected}")]
    TypeMismatch { key: String, expected: String },

    #[error("{message}")]
    Invalid { message: String },
}

impl StateError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::MissingKey { key: key.into() }
    }

    pub fn mismatch(key: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::TypeMismatch {
            key: key.into(),
            expected: expected.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid(e.to_string())
    }
}

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Checkpoint name must end in .pth or .pt: {name}")]
    InvalidName { name: String },

    #[error("Corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Error(s) in loading state for {component}:\n\t{}", .messages.join("\n\t"))]
    LoadFailed {
        component: String,
        messages: Vec<String>,
    },
}

/// Errors from hook registration and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook '{name}' lock was poisoned")]
    Poisoned { name: String },

    #[error("Hook '{hook}' failed during {event}: {message}")]
    Failed {
        hook: String,
        event: String,
        message: String,
    },
}

/// Errors from the training loop.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    #[error("Invalid device '{spec}'")]
    InvalidDevice { spec: String },

    #[error("Component name '{name}' is reserved by the trainer")]
    ReservedComponent { name: String },

    #[error("Step failed at epoch {epoch}, iteration {iteration}: {message}")]
    StepFailed {
        epoch: usize,
        iteration: usize,
        message: String,
    },
}

/// A type alias for results using the top-level `TrainkitError`.
pub type Result<T> = std::result::Result<T, TrainkitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_meter() {
        let err = TrainkitError::Meter(MeterError::AlreadyRegistered {
            name: "loss".into(),
        });
        assert_eq!(err.to_string(), "Meter error: Meter already registered: loss");
    }

    #[test]
    fn test_error_display_unknown_keys() {
        let err = ConfigError::UnknownKeys {
            keys: vec![
                UnknownKey {
                    path: "trainer.max_epochs".into(),
                    suggestion: Some("trainer.max_epoch".into()),
                },
                UnknownKey {
                    path: "zzz".into(),
                    suggestion: None,
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Unknown configuration keys compared with base config: \
             `trainer.max_epochs` (possibly `trainer.max_epoch`), `zzz`"
        );
    }

    #[test]
    fn test_load_failed_lists_every_message() {
        let err = CheckpointError::LoadFailed {
            component: "Trainer".into(),
            messages: vec!["while copying model: bad".into(), "while copying optim: worse".into()],
        };
        let text = err.to_string();
        assert!(text.starts_with("Error(s) in loading state for Trainer:"));
        assert!(text.contains("\n\twhile copying model: bad"));
        assert!(text.contains("\n\twhile copying optim: worse"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TrainkitError = io_err.into();
        assert!(matches!(err, TrainkitError::Io(_)));
    }

    #[test]
    fn test_state_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: StateError = serde_err.into();
        assert!(matches!(err, StateError::Invalid { .. }));
    }

    #[test]
    fn test_training_error_variants() {
        let err = TrainingError::InvalidState {
            from: "done".into(),
            to: "training".into(),
        };
        assert_eq!(err.to_string(), "Invalid state transition: done -> training");
    }
}
