//! Property-based tests for meters, storage and config merging using proptest.

use proptest::prelude::*;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;

use trainkit_core::config::{deep_merge, dotted_paths, parse_override, parse_overrides};
use trainkit_core::results::MeterResult;
use trainkit_core::{AverageValueMeter, Meter, MeterRegistry, Storage};

fn sample_mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

// --- Streaming meter properties ---

proptest! {
    #[test]
    fn streaming_mean_matches_batch_mean(
        values in prop::collection::vec(-1000.0f64..1000.0, 1..200)
    ) {
        let mut meter = AverageValueMeter::new();
        for v in &values {
            meter.push(*v);
        }
        prop_assert!((meter.mean() - sample_mean(&values)).abs() < 1e-6);
        prop_assert_eq!(meter.count(), values.len() as u64);
        prop_assert_eq!(meter.last(), *values.last().unwrap());
    }

    #[test]
    fn streaming_std_matches_two_pass(
        values in prop::collection::vec(-1000.0f64..1000.0, 2..200)
    ) {
        let mut meter = AverageValueMeter::new();
        for v in &values {
            meter.push(*v);
        }
        let mean = sample_mean(&values);
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (values.len() - 1) as f64;
        let expected = var.sqrt();
        prop_assert!((meter.std() - expected).abs() < 1e-6 * (1.0 + expected));
    }

    #[test]
    fn reset_meter_behaves_like_a_fresh_one(
        before in prop::collection::vec(-10.0f64..10.0, 0..50),
        after in prop::collection::vec(-10.0f64..10.0, 1..50),
    ) {
        let mut reused = AverageValueMeter::new();
        for v in &before {
            reused.push(*v);
        }
        reused.reset();
        prop_assert_eq!(&reused, &AverageValueMeter::new());

        let mut fresh = AverageValueMeter::new();
        for v in &after {
            reused.push(*v);
            fresh.push(*v);
        }
        prop_assert_eq!(reused.summary(), fresh.summary());
    }

    #[test]
    fn final_status_always_reflects_every_value(
        values in prop::collection::vec(-100.0f64..100.0, 1..60),
        ttl in 1usize..20,
    ) {
        let mut registry = MeterRegistry::new();
        registry.register("loss", AverageValueMeter::new(), None).unwrap();
        for v in &values {
            registry.add("loss", *v).unwrap();
            registry.tracking_status(None, false, ttl).unwrap();
        }
        let status = registry.tracking_status(None, true, ttl).unwrap();
        let mean = status.value("loss", "mean").unwrap();
        prop_assert!((mean - sample_mean(&values)).abs() < 1e-6);
    }
}

// --- Storage properties ---

proptest! {
    #[test]
    fn storage_epochs_stay_sorted(epochs in prop::collection::vec(0usize..30, 1..40)) {
        let mut storage = Storage::new();
        let mut accepted = BTreeSet::new();
        let mut last: Option<usize> = None;
        for epoch in epochs {
            let result: MeterResult = [("mean", epoch as f64)].into_iter().collect();
            let outcome = storage.put("loss", result, Some(epoch), "train_", "");
            if last.is_some_and(|l| epoch < l) {
                prop_assert!(outcome.is_err());
            } else {
                prop_assert_eq!(outcome.unwrap(), epoch);
                accepted.insert(epoch);
                last = Some(epoch);
            }
        }
        let stored = storage.epochs();
        prop_assert!(stored.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(stored, accepted.into_iter().collect::<Vec<_>>());
    }
}

// --- Config tree properties ---

fn two_level_overrides() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["trainer", "logging", "model"]),
            prop::sample::select(vec!["lr", "depth", "level", "seed"]),
            0i64..1000,
        )
            .prop_map(|(section, key, value)| format!("{section}.{key}={value}")),
        0..12,
    )
}

fn path_set(tree: &Value) -> BTreeSet<String> {
    dotted_paths(tree).into_iter().collect()
}

proptest! {
    #[test]
    fn merge_into_empty_is_identity(raw in two_level_overrides()) {
        let tree = parse_overrides(&raw).unwrap();
        let empty = Value::Mapping(Mapping::new());
        prop_assert_eq!(deep_merge(&empty, &tree), tree.clone());
        prop_assert_eq!(deep_merge(&tree, &empty), tree);
    }

    #[test]
    fn merge_is_idempotent(raw in two_level_overrides()) {
        let tree = parse_overrides(&raw).unwrap();
        prop_assert_eq!(deep_merge(&tree, &tree), tree);
    }

    #[test]
    fn merged_paths_are_the_union(
        left in two_level_overrides(),
        right in two_level_overrides(),
    ) {
        let a = parse_overrides(&left).unwrap();
        let b = parse_overrides(&right).unwrap();
        let merged = path_set(&deep_merge(&a, &b));
        let union: BTreeSet<String> = path_set(&a).union(&path_set(&b)).cloned().collect();
        prop_assert_eq!(merged, union);
    }

    #[test]
    fn override_builds_one_nested_path(
        segments in prop::collection::vec("[a-z][a-z0-9_]{0,7}", 1..5),
        value in 0i64..10_000,
    ) {
        let key = segments.join(".");
        let tree = parse_override(&format!("{key}={value}")).unwrap();
        let expected: Vec<String> = (1..=segments.len())
            .map(|n| segments[..n].join("."))
            .collect();
        prop_assert_eq!(dotted_paths(&tree), expected);

        let mut leaf = &tree;
        for segment in &segments {
            leaf = &leaf[segment.as_str()];
        }
        prop_assert_eq!(leaf.as_i64(), Some(value));
    }
}
