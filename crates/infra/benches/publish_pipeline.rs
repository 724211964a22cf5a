use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use horizon_core::{CorrelationId, JobId, UserId};
use horizon_events::payloads::{JobMetricsRecorded, JobStatusChanged};
use horizon_events::{EventEnvelope, EventSchemaRegistry, InMemoryDurableBus, InMemoryEphemeralBus};
use horizon_infra::EventPublisher;
use horizon_infra::consumers::{Consumer, MetricsAggregator};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn publisher(validate: bool) -> EventPublisher {
    let publisher = EventPublisher::new(
        Arc::new(InMemoryEphemeralBus::new()),
        Arc::new(InMemoryDurableBus::new()),
    );
    if validate {
        publisher.with_registry(Arc::new(
            EventSchemaRegistry::with_builtin_schemas().expect("builtin schemas register"),
        ))
    } else {
        publisher
    }
}

fn status_changed(job_id: JobId) -> JobStatusChanged {
    JobStatusChanged {
        job_id,
        previous_status: "QUEUED".to_string(),
        new_status: "QUEUING".to_string(),
        reason: None,
    }
}

/// Dual-bus publish of a job event, with and without schema validation.
fn bench_publish_job_event(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish_job_event");
    group.throughput(Throughput::Elements(1));

    for validate in [false, true] {
        let publisher = publisher(validate);
        rt.block_on(publisher.start());
        let job_id = JobId::new();

        group.bench_with_input(BenchmarkId::new("validate", validate), &validate, |b, _| {
            b.iter(|| {
                rt.block_on(publisher.publish_event(
                    CorrelationId::new(),
                    UserId::from("bench"),
                    black_box(status_changed(job_id)),
                ))
            })
        });
    }

    group.finish();
}

/// Metrics consumer handling cost as the per-job sample history grows.
fn bench_metrics_consumer(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("metrics_consumer_handle");

    for jobs in [1usize, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), jobs, |b, &jobs| {
            let envelopes: Vec<EventEnvelope> = (0..jobs)
                .map(|i| {
                    EventEnvelope::for_event(
                        CorrelationId::new(),
                        UserId::from("bench"),
                        JobMetricsRecorded {
                            job_id: JobId::new(),
                            cpu_usage_percent: (i % 100) as f64,
                            memory_usage_mb: 2048.0,
                            execution_time_seconds: 12.5,
                            gpu_utilization_percent: None,
                        },
                    )
                    .to_json()
                    .expect("serializable payload")
                })
                .collect();

            b.iter(|| {
                let aggregator = MetricsAggregator::new();
                rt.block_on(async {
                    for envelope in &envelopes {
                        aggregator.handle(black_box(envelope)).await.expect("valid payload");
                    }
                });
                aggregator
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_publish_job_event, bench_metrics_consumer);
criterion_main!(benches);
