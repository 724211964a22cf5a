use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use horizon_events::event_types;
use horizon_events::EventSchemaRegistry;
use horizon_events::{EventSchema, FieldType, SchemaField};
use serde_json::json;

fn bench_validate_job_payloads(c: &mut Criterion) {
    let registry = EventSchemaRegistry::with_builtin_schemas().expect("builtin schemas register");
    let mut group = c.benchmark_group("validate_event");
    group.throughput(Throughput::Elements(1));

    let valid = json!({
        "job_id": "0190f2a4-0000-7000-8000-000000000000",
        "agent": "AlphaCal",
        "dataset_id": "vlass-2.2",
        "params": {"gpu_count": 2, "rfi_strategy": "medium"},
        "gpu_count": 2
    });
    group.bench_function("job_submitted_valid", |b| {
        b.iter(|| {
            registry
                .validate_event(black_box(event_types::JOB_SUBMITTED), black_box(&valid), None)
                .expect("registered type")
        })
    });

    let invalid = json!({"agent": 7, "previous_status": "LOST"});
    group.bench_function("job_status_changed_invalid", |b| {
        b.iter(|| {
            registry
                .validate_event(black_box(event_types::JOB_STATUS_CHANGED), black_box(&invalid), None)
                .expect("registered type")
        })
    });

    group.finish();
}

fn bench_registration_matrix_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_schema");

    for versions in [4usize, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(versions), versions, |b, &versions| {
            b.iter(|| {
                let registry = EventSchemaRegistry::new();
                for minor in 0..versions {
                    let schema = EventSchema::new("Bench", format!("1.{minor}.0"))
                        .field(SchemaField::required("job_id", FieldType::String))
                        .field(SchemaField::optional(format!("extra_{minor}"), FieldType::Number));
                    registry.register_schema("bench.event", schema).expect("unique version");
                }
                registry
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_validate_job_payloads, bench_registration_matrix_rebuild);
criterion_main!(benches);
