use criterion::{Criterion, black_box, criterion_group, criterion_main};
use trainkit_core::checkpoint::Checkpoint;
use trainkit_core::config::{deep_merge, parse_overrides};
use trainkit_core::{
    AverageValueMeter, EpochResult, Meter, MeterRegistry, MultipleAverageValueMeter, Persistable,
    Storage, StorageIncome,
};

fn filled_registry(meters: usize, values: usize) -> MeterRegistry {
    let mut registry = MeterRegistry::new();
    for i in 0..meters {
        registry
            .register(format!("meter_{i}"), AverageValueMeter::new(), Some("train"))
            .unwrap();
        for v in 0..values {
            registry.add(&format!("meter_{i}"), v as f64).unwrap();
        }
    }
    registry
}

fn bench_meters(c: &mut Criterion) {
    c.bench_function("average_meter_add", |b| {
        let mut meter = AverageValueMeter::new();
        b.iter(|| meter.push(black_box(0.25)))
    });

    c.bench_function("multiple_meter_add_named", |b| {
        let mut meter = MultipleAverageValueMeter::new();
        b.iter(|| {
            meter
                .add(black_box([("dice", 0.8), ("iou", 0.7), ("hd", 3.0)]).into())
                .unwrap()
        })
    });

    c.bench_function("registry_add", |b| {
        let mut registry = filled_registry(8, 0);
        b.iter(|| registry.add(black_box("meter_7"), black_box(1.5)).unwrap())
    });
}

fn bench_tracking_status(c: &mut Criterion) {
    c.bench_function("tracking_status_cached", |b| {
        let mut registry = filled_registry(16, 100);
        b.iter(|| registry.tracking_status(black_box(None), false, 10).unwrap())
    });

    c.bench_function("tracking_status_final", |b| {
        let mut registry = filled_registry(16, 100);
        b.iter(|| registry.tracking_status(black_box(None), true, 10).unwrap())
    });

    c.bench_function("tracking_status_group", |b| {
        let mut registry = filled_registry(16, 100);
        b.iter(|| {
            registry
                .tracking_status(black_box(Some("train")), true, 10)
                .unwrap()
        })
    });
}

fn bench_storage(c: &mut Criterion) {
    let mut registry = filled_registry(8, 10);
    let status: EpochResult = registry.tracking_status(None, true, 1).unwrap();
    let mut storage = Storage::new();
    for epoch in 0..200 {
        storage
            .put_income(&StorageIncome::new(status.clone(), Some(status.clone())), epoch)
            .unwrap();
    }

    c.bench_function("storage_summary_200_epochs", |b| {
        b.iter(|| black_box(&storage).summary())
    });

    c.bench_function("storage_csv_200_epochs", |b| {
        b.iter(|| black_box(&storage).summary().to_csv_string())
    });

    c.bench_function("checkpoint_encode_decode", |b| {
        let mut components = std::collections::BTreeMap::new();
        components.insert("storage".to_string(), storage.state_dict().unwrap());
        let ckpt = Checkpoint::new(uuid::Uuid::new_v4(), 199, components);
        b.iter(|| {
            let bytes = ckpt.to_bytes().unwrap();
            Checkpoint::from_bytes(black_box(&bytes), std::path::Path::new("bench.pth")).unwrap()
        })
    });
}

fn bench_config(c: &mut Criterion) {
    let base = parse_overrides(&[
        "trainer.max_epoch=100",
        "trainer.num_batches=250",
        "trainer.save_dir=runs/base",
        "logging.level=info",
        "model.depth=4",
        "model.channels=[16, 32, 64, 128]",
    ])
    .unwrap();

    c.bench_function("config_parse_overrides", |b| {
        b.iter(|| {
            parse_overrides(black_box(&[
                "trainer.max_epoch=10",
                "model.depth=5",
                "optim.lr=0.001",
            ]))
            .unwrap()
        })
    });

    c.bench_function("config_deep_merge", |b| {
        let incoming = parse_overrides(&["trainer.max_epoch=10", "model.depth=5"]).unwrap();
        b.iter(|| deep_merge(black_box(&base), black_box(&incoming)))
    });
}

criterion_group!(
    benches,
    bench_meters,
    bench_tracking_status,
    bench_storage,
    bench_config,
);
criterion_main!(benches);
