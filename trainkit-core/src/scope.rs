//! Scoped scratch variables shared between the workload and hooks.
//!
//! Each run owns one [`VariableScope`]; the trainer clears the batch scope
//! before every step, the epoch scope before every epoch, and the train scope
//! once training ends. Nothing here is global.

use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeLevel {
    Batch,
    Epoch,
    Train,
}

#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    batch: BTreeMap<String, Value>,
    epoch: BTreeMap<String, Value>,
    train: BTreeMap<String, Value>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn level(&self, level: ScopeLevel) -> &BTreeMap<String, Value> {
        match level {
            ScopeLevel::Batch => &self.batch,
            ScopeLevel::Epoch => &self.epoch,
            ScopeLevel::Train => &self.train,
        }
    }

    fn level_mut(&mut self, level: ScopeLevel) -> &mut BTreeMap<String, Value> {
        match level {
            ScopeLevel::Batch => &mut self.batch,
            ScopeLevel::Epoch => &mut self.epoch,
            ScopeLevel::Train => &mut self.train,
        }
    }

    pub fn put(&mut self, level: ScopeLevel, key: impl Into<String>, value: impl Into<Value>) {
        self.level_mut(level).insert(key.into(), value.into());
    }

    pub fn get(&self, level: ScopeLevel, key: &str) -> Option<&Value> {
        self.level(level).get(key)
    }

    pub fn entries(&self, level: ScopeLevel) -> &BTreeMap<String, Value> {
        self.level(level)
    }

    pub fn clear(&mut self, level: ScopeLevel) {
        self.level_mut(level).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_independent() {
        let mut scope = VariableScope::new();
        scope.put(ScopeLevel::Batch, "pred", 1.5);
        scope.put(ScopeLevel::Epoch, "seen", 10);
        scope.put(ScopeLevel::Train, "tag", "warmup");

        scope.clear(ScopeLevel::Batch);
        assert!(scope.get(ScopeLevel::Batch, "pred").is_none());
        assert_eq!(scope.get(ScopeLevel::Epoch, "seen"), Some(&Value::from(10)));
        assert_eq!(scope.entries(ScopeLevel::Train).len(), 1);
    }
}
