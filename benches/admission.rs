use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use pulse_scheduler::{AdmissionLayer, SlidingWindowLimiter, WindowKey};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tower::{Layer, Service, ServiceExt};

// Terminal service so the layer has something to call.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn limiter() -> Arc<SlidingWindowLimiter> {
    Arc::new(SlidingWindowLimiter::new(1_000, Duration::from_secs(60)).unwrap())
}

fn allow_single_key(c: &mut Criterion) {
    let limiter = limiter();
    c.bench_function("allow_single_key", |b| b.iter(|| black_box(limiter.allow("project:bench"))));
}

fn allow_many_keys(c: &mut Criterion) {
    let limiter = limiter();
    let keys: Vec<String> = (0..1_024).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    let mut next = 0usize;
    c.bench_function("allow_many_keys", |b| {
        b.iter(|| {
            next = (next + 1) % keys.len();
            black_box(limiter.allow(&keys[next]))
        })
    });
}

fn allow_contended(c: &mut Criterion) {
    let limiter = limiter();
    c.bench_function("allow_contended_4_threads", |b| {
        b.iter(|| {
            thread::scope(|scope| {
                for t in 0..4 {
                    let limiter = &limiter;
                    scope.spawn(move || {
                        let key = format!("project:{t}");
                        for _ in 0..64 {
                            black_box(limiter.allow(&key));
                        }
                    });
                }
            })
        })
    });
}

fn layer_overhead(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let layer = AdmissionLayer::new(limiter(), |_req: &&'static str| Some(WindowKey::project("bench")));
    let svc = layer.layer(EchoService);
    c.bench_function("admission_layer_call", |b| {
        b.to_async(&rt).iter(|| {
            let svc = svc.clone();
            async move { black_box(svc.oneshot("ping").await.is_ok()) }
        })
    });
}

criterion_group!(benches, allow_single_key, allow_many_keys, allow_contended, layer_overhead);
criterion_main!(benches);
