use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use courier_core::{SessionId, TenantId};
use courier_infra::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use courier_infra::dedup::{DedupConfig, Deduplicator};
use courier_infra::jobs::{InMemoryJobStore, JobOptions, JobOutcome, JobQueue, QueueConfig};
use courier_infra::rate_limit::{RateLimitConfig, RateLimiter};
use serde_json::json;

fn sessions(count: usize) -> Vec<(TenantId, SessionId)> {
    (0..count)
        .map(|i| (TenantId::new(), SessionId::new(format!("session-{i}")).unwrap()))
        .collect()
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    for key_count in [1usize, 100, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("check_and_increment", key_count),
            &key_count,
            |b, &key_count| {
                let limiter = RateLimiter::new(RateLimitConfig {
                    per_minute: u32::MAX,
                    per_hour: u32::MAX,
                    ..RateLimitConfig::default()
                });
                let keys = sessions(key_count);
                let mut i = 0usize;
                b.iter(|| {
                    let (tenant, session) = &keys[i % keys.len()];
                    i += 1;
                    black_box(limiter.check_and_increment(*tenant, session))
                });
            },
        );
    }

    group.finish();
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");
    let dedup = Deduplicator::new(DedupConfig::default());
    let session = SessionId::new("main").unwrap();

    for len in [16usize, 100, 4_096] {
        let content = "x".repeat(len);
        group.bench_with_input(BenchmarkId::new("compute_key", len), &content, |b, content| {
            b.iter(|| black_box(dedup.compute_key(&session, "+15550001", content)));
        });
    }

    group.bench_function("check_then_mark", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = dedup.compute_key(&session, "+15550001", &i.to_string());
            i += 1;
            if !dedup.is_duplicate(&key) {
                dedup.mark_processed(&key);
            }
        });
    });

    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let closed = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    group.bench_function("call_closed", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(closed.call(|| async { Ok::<_, ()>(1u32) }).await.is_ok())
            })
        });
    });

    let open = CircuitBreaker::new("bench-open", CircuitBreakerConfig::default());
    open.force_open();
    group.bench_function("reject_open", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(open.call(|| async { Ok::<_, ()>(1u32) }).await.is_err())
            })
        });
    });

    group.finish();
}

fn bench_job_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_claim_ack", |b| {
        let queue = JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default());
        let tenant = TenantId::new();
        let options = JobOptions::default();
        b.iter(|| {
            queue
                .enqueue("bench", "send_text", tenant, json!({"n": 1}), &options)
                .unwrap();
            let job = queue.claim("bench").unwrap().unwrap();
            black_box(queue.ack(&job, JobOutcome::Completed(json!(null))).unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_rate_limiter,
    bench_dedup,
    bench_circuit_breaker,
    bench_job_queue
);
criterion_main!(benches);
