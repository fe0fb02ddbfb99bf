use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use sellerflow_core::{Clock, JobId, PhaseRegistry, RunId, SubjectId, SystemClock, UnitKey};
use sellerflow_infra::jobs::{
    EnqueueOptions, InMemoryJobQueue, JobQueue, LeaseRequest, NewJob, QueueSettings,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn queue() -> Arc<InMemoryJobQueue> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    InMemoryJobQueue::arc(QueueSettings::default(), clock)
}

fn job(n: usize) -> NewJob {
    let unit = UnitKey::new(SubjectId::new(format!("user-{n}")).unwrap());
    NewJob::phased(JobId::from_raw(format!("user-{n}-INIT")), "INIT", unit, RunId::new())
}

fn request() -> LeaseRequest {
    LeaseRequest::new("bench", vec!["INIT".to_string()])
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_throughput");

    for size in [100usize, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let queue = queue();
                rt.block_on(async {
                    for n in 0..size {
                        queue.enqueue(job(n), EnqueueOptions::default()).await.unwrap();
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_lease_complete_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_complete_cycle");

    for size in [100usize, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let queue = queue();
                rt.block_on(async {
                    for n in 0..size {
                        queue.enqueue(job(n), EnqueueOptions::default()).await.unwrap();
                    }
                    let request = request();
                    while let Some(leased) = queue.lease(&request).await.unwrap() {
                        queue.complete(&leased.job.id, &leased.token).await.unwrap();
                    }
                });
            });
        });
    }

    group.finish();
}

fn bench_duplicate_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let queue = queue();
    rt.block_on(async {
        queue.enqueue(job(0), EnqueueOptions::default()).await.unwrap();
    });

    c.bench_function("duplicate_enqueue", |b| {
        b.iter(|| {
            let outcome = rt
                .block_on(queue.enqueue(black_box(job(0)), EnqueueOptions::default()))
                .unwrap();
            assert!(outcome.existing);
        });
    });
}

fn bench_registry_lookups(c: &mut Criterion) {
    let registry = PhaseRegistry::integration();
    let job_id = JobId::from("user-42:DE-ADVERTISING");

    let mut group = c.benchmark_group("phase_registry");
    group.bench_function("parse_job_id", |b| {
        b.iter(|| registry.parse_job_id(black_box(&job_id)).unwrap());
    });
    group.bench_function("overall_progress", |b| {
        b.iter(|| registry.overall_progress(black_box("INVENTORY"), black_box(50.0)).unwrap());
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_throughput,
    bench_lease_complete_cycle,
    bench_duplicate_enqueue,
    bench_registry_lookups
);
criterion_main!(benches);
