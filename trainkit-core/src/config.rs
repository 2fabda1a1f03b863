//! Configuration trees, command-line overrides and typed settings.
//!
//! Raw configuration is a `serde_yaml::Value` tree assembled from a base
//! file, optional files and `key=value` overrides, merged in that order.
//! Override keys are checked against the paths known from the files (and the
//! built-in defaults) so typos surface with a suggestion.
//!
//! Typed settings are then extracted with `figment`:
//! defaults -> merged files -> `TRAINKIT_` environment -> command-line overrides.

use crate::device::Device;
use crate::error::{ConfigError, Result, UnknownKey};
use crate::persistence;
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name used when a directory is given instead of a config file, and
/// for the snapshot written into a run directory.
pub const CONFIG_FILE: &str = "config.yaml";

const SUGGESTION_CUTOFF: f32 = 0.6;

/// Recursively merge `incoming` into a copy of `base`.
///
/// Keys present in both trees are merged when both values are maps; in
/// every other case the incoming value replaces the base one.
pub fn deep_merge(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Mapping(base_map), Value::Mapping(incoming_map)) => {
            let mut out = base_map.clone();
            for (key, value) in incoming_map {
                let merged = match out.get(key) {
                    Some(existing) if existing.is_mapping() && value.is_mapping() => {
                        deep_merge(existing, value)
                    }
                    _ => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Mapping(out)
        }
        _ => incoming.clone(),
    }
}

/// Merge a sequence of trees left to right onto an empty map.
pub fn merge_all<'a>(trees: impl IntoIterator<Item = &'a Value>) -> Value {
    trees
        .into_iter()
        .fold(Value::Mapping(Mapping::new()), |acc, tree| {
            deep_merge(&acc, tree)
        })
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Every key path in the tree, dotted, parents before children.
pub fn dotted_paths(tree: &Value) -> Vec<String> {
    fn walk(tree: &Value, prefix: &str, out: &mut Vec<String>) {
        let Value::Mapping(map) = tree else {
            return;
        };
        for (key, value) in map {
            let key = key_string(key);
            let path = if prefix.is_empty() {
                key
            } else {
                format!("{prefix}.{key}")
            };
            out.push(path.clone());
            walk(value, &path, out);
        }
    }
    let mut out = Vec::new();
    walk(tree, "", &mut out);
    out
}

/// Paths of `incoming` that `base` does not know, each with the closest
/// known path when one is similar enough.
pub fn unknown_keys(base: &Value, incoming: &Value) -> Vec<UnknownKey> {
    let known = dotted_paths(base);
    let known_set: BTreeSet<&str> = known.iter().map(String::as_str).collect();
    let candidates: Vec<&str> = known.iter().map(String::as_str).collect();
    dotted_paths(incoming)
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|path| !known_set.contains(path.as_str()))
        .map(|path| {
            let suggestion =
                similar::get_close_matches(path.as_str(), &candidates, 1, SUGGESTION_CUTOFF)
                    .first()
                    .map(|s| s.to_string());
            UnknownKey { path, suggestion }
        })
        .collect()
}

/// Validate `incoming` against `base`. Strict mode fails on any unknown path;
/// lenient mode logs them and hands them back.
pub fn check_overrides(
    base: &Value,
    incoming: &Value,
    strict: bool,
) -> std::result::Result<Vec<UnknownKey>, ConfigError> {
    let keys = unknown_keys(base, incoming);
    if keys.is_empty() {
        return Ok(keys);
    }
    if strict {
        return Err(ConfigError::UnknownKeys { keys });
    }
    warn!(
        "{}",
        ConfigError::UnknownKeys { keys: keys.clone() }
    );
    Ok(keys)
}

/// Convert the `type=value` part of a `key:!type=value` override.
fn typed_value(typed: &str) -> std::result::Result<Value, String> {
    let (ty, value) = typed
        .split_once('=')
        .ok_or_else(|| "expected key:!type=value".to_string())?;
    let value = value.trim();
    match ty.trim() {
        "str" => Ok(Value::String(value.to_string())),
        "int" => value
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("not an int: {e}")),
        "float" => value
            .parse::<f64>()
            .map(Value::from)
            .map_err(|e| format!("not a float: {e}")),
        "bool" => value
            .parse::<bool>()
            .map(Value::Bool)
            .map_err(|e| format!("not a bool: {e}")),
        other => Err(format!("unsupported type `!{other}` (use str, int, float or bool)")),
    }
}

/// Parse one `a.b.c=value` / `a.b.c:value` override into a nested tree.
///
/// The key ends at the first `=` or `:`; the rest is read as YAML, so
/// `0.1`, `true`, `[1, 2]` and `{x: 1}` keep their types. `a.b:!str=123`
/// forces the type instead.
pub fn parse_override(raw: &str) -> std::result::Result<Value, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidOverride {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };
    let sep = raw
        .find(['=', ':'])
        .ok_or_else(|| invalid("expected key=value or key:value"))?;
    let (key, value) = (raw[..sep].trim(), raw[sep + 1..].trim());
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(invalid("empty key segment"));
    }
    let value: Value = if let Some(typed) = value.strip_prefix('!') {
        typed_value(typed).map_err(|reason| invalid(&reason))?
    } else if value.is_empty() {
        Value::Null
    } else {
        serde_yaml::from_str(value).map_err(|e| invalid(&e.to_string()))?
    };
    if matches!(value, Value::Tagged(_)) {
        return Err(invalid("YAML tags are not supported, use key:!type=value"));
    }
    Ok(key.rsplit('.').fold(value, |inner, segment| {
        let mut map = Mapping::new();
        map.insert(Value::String(segment.to_string()), inner);
        Value::Mapping(map)
    }))
}

/// Parse and merge overrides left to right.
pub fn parse_overrides<S: AsRef<str>>(raw: &[S]) -> std::result::Result<Value, ConfigError> {
    let mut merged = Value::Mapping(Mapping::new());
    for item in raw {
        let item = item.as_ref().trim();
        if item.is_empty() {
            continue;
        }
        merged = deep_merge(&merged, &parse_override(item)?);
    }
    Ok(merged)
}

/// Read a YAML, TOML or JSON file into a tree. A directory resolves to its
/// `config.yaml`; an empty document reads as an empty map.
pub fn load_tree(path: &Path) -> std::result::Result<Value, ConfigError> {
    let path = if path.is_dir() {
        path.join(CONFIG_FILE)
    } else {
        path.to_path_buf()
    };
    if !path.is_file() {
        return Err(ConfigError::FileNotFound { path });
    }
    let source_name = path.display().to_string();
    let parse_err = |message: String| ConfigError::ParseError {
        source_name: source_name.clone(),
        message,
    };
    let content = std::fs::read_to_string(&path).map_err(|e| parse_err(e.to_string()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let tree: Value = match ext.as_deref() {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))?
        }
        Some("toml") => {
            let parsed: toml::Value =
                toml::from_str(&content).map_err(|e| parse_err(e.to_string()))?;
            serde_yaml::to_value(parsed).map_err(|e| parse_err(e.to_string()))?
        }
        Some("json") => {
            let parsed: serde_json::Value =
                serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?;
            serde_yaml::to_value(parsed).map_err(|e| parse_err(e.to_string()))?
        }
        _ => return Err(ConfigError::UnsupportedFormat { path }),
    };
    debug!(path = %source_name, "Loaded config tree");
    Ok(match tree {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other,
    })
}

/// Settings consumed by the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Run directory for checkpoints, `storage.csv` and `config.yaml`.
    pub save_dir: PathBuf,
    pub max_epoch: usize,
    /// Training iterations per epoch.
    pub num_batches: usize,
    pub device: Device,
    /// Direction used to pick `best.pth`.
    pub high_is_better: bool,
    /// Also write `epoch_<n>.pth` every this many epochs.
    pub save_every: Option<usize>,
    pub write_csv: bool,
    /// Fail the resume on any non-missing-key load error.
    pub strict_load: bool,
    /// Checkpoint file or run directory to resume from.
    pub resume: Option<PathBuf>,
    /// Poll interval of the cached meter snapshot.
    pub cache_ttl: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("runs/default"),
            max_epoch: 100,
            num_batches: 100,
            device: Device::Cpu,
            high_is_better: true,
            save_every: None,
            write_csv: true,
            strict_load: true,
            resume: None,
            cache_ttl: crate::meters::DEFAULT_CACHE_TTL,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::Invalid {
            message: message.to_string(),
        };
        if self.num_batches == 0 {
            return Err(invalid("trainer.num_batches must be at least 1"));
        }
        if self.save_every == Some(0) {
            return Err(invalid("trainer.save_every must be at least 1"));
        }
        if self.cache_ttl == 0 {
            return Err(invalid("trainer.cache_ttl must be at least 1"));
        }
        Ok(())
    }
}

/// Logging settings read by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive for the console layer.
    pub level: String,
    /// Write JSON lines to a daily rolling file.
    pub json_file: bool,
    /// Overrides the platform data directory for log files.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_file: true,
            directory: None,
        }
    }
}

/// Typed view of a merged configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainkitConfig {
    pub trainer: TrainerConfig,
    pub logging: LoggingConfig,
}

impl TrainkitConfig {
    /// Built-in defaults as a tree, used as the schema floor for overrides.
    pub fn defaults_tree() -> Value {
        serde_yaml::to_value(Self::default()).unwrap_or(Value::Mapping(Mapping::new()))
    }
}

/// Extract typed settings.
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables (`TRAINKIT_TRAINER__MAX_EPOCH`, ...)
/// 3. Merged configuration files
/// 4. Built-in defaults
pub fn extract_settings(
    files: &Value,
    overrides: &Value,
) -> std::result::Result<TrainkitConfig, ConfigError> {
    extract_with(
        Figment::from(Serialized::defaults(TrainkitConfig::default()))
            .merge(Serialized::defaults(files))
            .merge(Env::prefixed("TRAINKIT_").split("__"))
            .merge(Serialized::defaults(overrides)),
    )
}

fn extract_with(figment: Figment) -> std::result::Result<TrainkitConfig, ConfigError> {
    let settings: TrainkitConfig = figment.extract().map_err(|e| ConfigError::Extract {
        message: e.to_string(),
    })?;
    settings.trainer.validate()?;
    Ok(settings)
}

/// Builder for the base < optional files < command-line merge.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base: Option<PathBuf>,
    optional: Vec<PathBuf>,
    overrides: Vec<String>,
    strict: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            base: None,
            optional: Vec::new(),
            overrides: Vec::new(),
            strict: true,
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(mut self, path: impl Into<PathBuf>) -> Self {
        self.base = Some(path.into());
        self
    }

    pub fn optional(mut self, path: impl Into<PathBuf>) -> Self {
        self.optional.push(path.into());
        self
    }

    pub fn overrides<I, S>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.extend(overrides.into_iter().map(Into::into));
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn load(&self) -> std::result::Result<LoadedConfig, ConfigError> {
        let base = match &self.base {
            Some(path) => load_tree(path)?,
            None => Value::Mapping(Mapping::new()),
        };
        let optional = self
            .optional
            .iter()
            .map(|p| load_tree(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let parsed = parse_overrides(&self.overrides)?;

        let files = merge_all(std::iter::once(&base).chain(optional.iter()));
        let schema = deep_merge(&TrainkitConfig::defaults_tree(), &files);
        let unknown = check_overrides(&schema, &parsed, self.strict)?;
        let merged = deep_merge(&files, &parsed);
        debug!(
            base = ?self.base,
            optional = self.optional.len(),
            overrides = self.overrides.len(),
            "Merged configuration"
        );
        Ok(LoadedConfig {
            base,
            optional,
            parsed,
            files,
            merged,
            unknown,
        })
    }
}

/// Every stage of a configuration merge.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub base: Value,
    pub optional: Vec<Value>,
    /// Tree built from command-line overrides.
    pub parsed: Value,
    /// Base and optional files merged.
    pub files: Value,
    /// Files merged with command-line overrides.
    pub merged: Value,
    /// Unknown override paths tolerated in lenient mode.
    pub unknown: Vec<UnknownKey>,
}

impl LoadedConfig {
    pub fn settings(&self) -> std::result::Result<TrainkitConfig, ConfigError> {
        extract_settings(&self.files, &self.parsed)
    }

    /// Look up a dotted path in the merged tree.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.merged, |node, key| node.get(key))
    }

    pub fn to_yaml(&self) -> std::result::Result<String, ConfigError> {
        serde_yaml::to_string(&self.merged).map_err(|e| ConfigError::ParseError {
            source_name: "merged config".into(),
            message: e.to_string(),
        })
    }

    /// Write the merged tree as `<dir>/config.yaml`.
    pub fn write_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(CONFIG_FILE);
        persistence::atomic_write_yaml(&path, &self.merged)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_merge_nested_maps() {
        let merged = deep_merge(&yaml("a: {x: 1}"), &yaml("a: {y: 2}"));
        assert_eq!(merged, yaml("a: {x: 1, y: 2}"));
    }

    #[test]
    fn test_merge_scalar_replaced_by_map() {
        let merged = deep_merge(&yaml("a: 1"), &yaml("a: {x: 1}"));
        assert_eq!(merged, yaml("a: {x: 1}"));
        let back = deep_merge(&yaml("a: {x: 1}"), &yaml("a: 3"));
        assert_eq!(back, yaml("a: 3"));
    }

    #[test]
    fn test_merge_leaves_base_untouched() {
        let base = yaml("a: {x: 1}");
        let _ = deep_merge(&base, &yaml("a: {x: 2}"));
        assert_eq!(base, yaml("a: {x: 1}"));
    }

    #[test]
    fn test_dotted_paths() {
        let paths = dotted_paths(&yaml("trainer: {max_epoch: 3, optim: {lr: 0.1}}\nseed: 1"));
        assert_eq!(
            paths,
            vec![
                "trainer",
                "trainer.max_epoch",
                "trainer.optim",
                "trainer.optim.lr",
                "seed"
            ]
        );
    }

    #[test]
    fn test_parse_override_forms() {
        assert_eq!(
            parse_override("trainer.max_epoch=5").unwrap(),
            yaml("trainer: {max_epoch: 5}")
        );
        assert_eq!(
            parse_override("trainer.device:cuda:1").unwrap(),
            yaml("trainer: {device: 'cuda:1'}")
        );
        assert_eq!(
            parse_override("optim.betas=[0.9, 0.99]").unwrap(),
            yaml("optim: {betas: [0.9, 0.99]}")
        );
        assert_eq!(parse_override("flag=").unwrap(), yaml("flag: null"));
        assert!(parse_override("no_separator").is_err());
        assert!(parse_override("a..b=1").is_err());
        assert!(parse_override("=1").is_err());
    }

    #[test]
    fn test_parse_typed_override() {
        assert_eq!(
            parse_override("a.b:!str=123").unwrap(),
            yaml("a: {b: '123'}")
        );
        let float = parse_override("a:!float=1").unwrap();
        assert_eq!(float["a"].as_f64(), Some(1.0));
        assert_eq!(
            parse_override("trainer.max_epoch:!int=5").unwrap(),
            yaml("trainer: {max_epoch: 5}")
        );
        assert_eq!(parse_override("x=!bool=true").unwrap(), yaml("x: true"));

        for bad in ["a:!int=five", "a:!complex=1", "a:!str", "a=!custom 3"] {
            let err = parse_override(bad).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidOverride { .. }), "{bad}");
        }
    }

    #[test]
    fn test_typed_override_reaches_settings() {
        let loaded = ConfigLoader::new()
            .overrides(["trainer.max_epoch:!int=7"])
            .load()
            .unwrap();
        assert_eq!(loaded.settings().unwrap().trainer.max_epoch, 7);
    }

    #[test]
    fn test_parse_overrides_merge_left_to_right() {
        let tree = parse_overrides(&["lr.yes=0.94", "lr.no=false", "lr.yes=0.5"]).unwrap();
        assert_eq!(tree, yaml("lr: {yes: 0.5, no: false}"));
    }

    #[test]
    fn test_unknown_keys_with_suggestion() {
        let base = yaml("trainer: {max_epoch: 3, num_batches: 5}");
        let incoming = yaml("trainer: {max_epochs: 4}\nzzz: 1");
        let keys = unknown_keys(&base, &incoming);
        assert_eq!(
            keys,
            vec![
                UnknownKey {
                    path: "trainer.max_epochs".into(),
                    suggestion: Some("trainer.max_epoch".into()),
                },
                UnknownKey {
                    path: "zzz".into(),
                    suggestion: None,
                },
            ]
        );
    }

    #[test]
    fn test_check_overrides_strict_and_lenient() {
        let base = yaml("a: {b: 1}");
        let incoming = yaml("a: {c: 1}");
        assert!(matches!(
            check_overrides(&base, &incoming, true),
            Err(ConfigError::UnknownKeys { .. })
        ));
        let tolerated = check_overrides(&base, &incoming, false).unwrap();
        assert_eq!(tolerated.len(), 1);
        assert!(check_overrides(&base, &yaml("a: {b: 2}"), true).unwrap().is_empty());
    }

    #[test]
    fn test_load_tree_formats() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "trainer:\n  max_epoch: 2\n").unwrap();
        std::fs::write(dir.path().join("extra.toml"), "[trainer]\nnum_batches = 7\n").unwrap();
        std::fs::write(dir.path().join("extra.json"), r#"{"seed": 3}"#).unwrap();
        std::fs::write(dir.path().join("empty.yml"), "").unwrap();
        std::fs::write(dir.path().join("bad.ini"), "x=1").unwrap();

        assert_eq!(load_tree(dir.path()).unwrap(), yaml("trainer: {max_epoch: 2}"));
        assert_eq!(
            load_tree(&dir.path().join("extra.toml")).unwrap(),
            yaml("trainer: {num_batches: 7}")
        );
        assert_eq!(load_tree(&dir.path().join("extra.json")).unwrap(), yaml("seed: 3"));
        assert_eq!(load_tree(&dir.path().join("empty.yml")).unwrap(), yaml("{}"));
        assert!(matches!(
            load_tree(&dir.path().join("bad.ini")),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            load_tree(&dir.path().join("missing.yaml")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_loader_precedence_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let opt = dir.path().join("opt.yaml");
        std::fs::write(&base, "trainer:\n  max_epoch: 2\n  num_batches: 4\nmodel:\n  width: 8\n")
            .unwrap();
        std::fs::write(&opt, "trainer:\n  num_batches: 6\n").unwrap();

        let loaded = ConfigLoader::new()
            .base(&base)
            .optional(&opt)
            .overrides(["trainer.max_epoch=9", "model.width:16"])
            .load()
            .unwrap();
        assert_eq!(loaded.get("trainer.max_epoch"), Some(&yaml("9")));
        assert_eq!(loaded.get("trainer.num_batches"), Some(&yaml("6")));
        assert_eq!(loaded.get("model.width"), Some(&yaml("16")));

        let settings = loaded.settings().unwrap();
        assert_eq!(settings.trainer.num_batches, 6);
        assert_eq!(settings.trainer.device, Device::Cpu);

        let snapshot = loaded.write_snapshot(dir.path()).unwrap();
        assert_eq!(load_tree(&snapshot).unwrap(), loaded.merged);
    }

    #[test]
    fn test_loader_accepts_default_keys_without_base() {
        let loaded = ConfigLoader::new()
            .overrides(["trainer.save_every=2"])
            .load()
            .unwrap();
        assert_eq!(loaded.settings().unwrap().trainer.save_every, Some(2));

        let err = ConfigLoader::new()
            .overrides(["trainer.max_epochs=2"])
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("possibly `trainer.max_epoch`"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let err = extract_settings(&yaml("{}"), &yaml("trainer: {num_batches: 0}")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
