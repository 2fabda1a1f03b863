//! The `Persistable` capability shared by every checkpointed component.
//!
//! Components hand out their state as a [`StateDict`] (a JSON tree) and
//! restore from one. The checkpointer only ever sees named `Persistable`s; it
//! never walks component internals.

use crate::error::StateError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Nested state of one component.
pub type StateDict = serde_json::Value;

/// Save/load contract for anything that belongs in a checkpoint.
pub trait Persistable {
    fn state_dict(&self) -> Result<StateDict, StateError>;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError>;
}

/// Serialize a plain value into a state dict.
pub fn to_state<T: Serialize>(value: &T) -> Result<StateDict, StateError> {
    Ok(serde_json::to_value(value)?)
}

/// Deserialize a plain value out of a state dict.
pub fn from_state<T: DeserializeOwned>(state: &StateDict) -> Result<T, StateError> {
    Ok(serde_json::from_value(state.clone())?)
}

/// `deserialize_with` helper: JSON has no NaN, so `null` reads back as NaN.
pub(crate) fn f64_or_nan<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Fetch a required entry of an object-shaped state dict.
pub fn field<'a>(state: &'a StateDict, key: &str) -> Result<&'a StateDict, StateError> {
    let obj = state
        .as_object()
        .ok_or_else(|| StateError::mismatch(key, "object"))?;
    obj.get(key).ok_or_else(|| StateError::missing(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        ticks: u64,
    }

    #[test]
    fn test_to_from_state() {
        let state = to_state(&Counter { ticks: 7 }).unwrap();
        assert_eq!(state, json!({"ticks": 7}));
        let back: Counter = from_state(&state).unwrap();
        assert_eq!(back, Counter { ticks: 7 });
    }

    #[test]
    fn test_from_state_wrong_shape() {
        let err = from_state::<Counter>(&json!({"ticks": "many"})).unwrap_err();
        assert!(matches!(err, StateError::Invalid { .. }));
    }

    #[test]
    fn test_field_missing_and_mismatch() {
        let state = json!({"model": {}});
        assert!(field(&state, "model").is_ok());
        assert!(matches!(
            field(&state, "optimizer"),
            Err(StateError::MissingKey { key }) if key == "optimizer"
        ));
        assert!(matches!(
            field(&json!([1, 2]), "model"),
            Err(StateError::TypeMismatch { .. })
        ));
    }
}
