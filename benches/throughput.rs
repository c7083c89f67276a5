//! Throughput Benchmark for Switchboard
//!
//! This benchmark measures the hot paths of request handling: frame
//! parsing, registry lookup, shared store access and journal enqueue.

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard::commands::{builtin, CommandRegistry, Direction};
use switchboard::config::default_inbound;
use switchboard::journal::{
    JournalConfig, JournalHandle, PersistenceSink, SinkError, Transaction, TransactionQueue,
};
use switchboard::protocol::{FrameParser, Request};
use switchboard::storage::{SessionId, SharedStore};

/// Benchmark frame parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    let small = Request::new("ADD_USER")
        .with("username", "alice")
        .with("password", "secret")
        .to_frame()
        .serialize();
    group.bench_function("map_small", |b| {
        let mut parser = FrameParser::new();
        b.iter(|| {
            black_box(parser.parse(black_box(&small)).unwrap());
        });
    });

    let upload = Request::new("UPLOAD_USER_PIC")
        .with("filename", "me.png")
        .with("file", Bytes::from(vec![0u8; 64 * 1024])) // 64KB blob
        .to_frame()
        .serialize();
    group.bench_function("map_with_blob", |b| {
        let mut parser = FrameParser::new();
        b.iter(|| {
            black_box(parser.parse(black_box(&upload)).unwrap());
        });
    });

    let inline = b"PING message=hello\r\n".to_vec();
    group.bench_function("inline", |b| {
        let mut parser = FrameParser::new();
        b.iter(|| {
            black_box(parser.parse(black_box(&inline)).unwrap());
        });
    });

    group.finish();
}

/// Benchmark registry lookup
fn bench_resolve(c: &mut Criterion) {
    let registry = CommandRegistry::bootstrap(&builtin::catalog(), &default_inbound(), &[])
        .expect("built-in bindings are valid");

    let mut group = c.benchmark_group("resolve");
    group.throughput(Throughput::Elements(1));

    group.bench_function("hit", |b| {
        b.iter(|| {
            black_box(registry.resolve(Direction::Inbound, black_box("VERIFY_CAPTCHA")));
        });
    });

    group.bench_function("miss", |b| {
        b.iter(|| {
            black_box(registry.resolve(Direction::Inbound, black_box("UNKNOWN_CMD")));
        });
    });

    group.finish();
}

/// Benchmark shared store operations
fn bench_store(c: &mut Criterion) {
    let store = Arc::new(SharedStore::new());

    for i in 0..100_000 {
        store.set("credentials", &format!("user:{}", i), format!("record:{}", i));
    }

    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            store.set("bench", &format!("key:{}", i), "value");
            i += 1;
        });
    });

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            black_box(store.get("credentials", &format!("user:{}", i % 100_000)));
            i += 1;
        });
    });

    // Single counter (high contention)
    group.bench_function("incr_single_counter", |b| {
        b.iter(|| {
            black_box(store.incr_by("sequences", "bench", 1).unwrap());
        });
    });

    group.bench_function("set_nx_taken", |b| {
        store.set("credentials_id", "taken", "1");
        b.iter(|| {
            black_box(store.set_nx("credentials_id", "taken", "2"));
        });
    });

    group.finish();
}

/// Benchmark concurrent store access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let store = Arc::new(SharedStore::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = format!("key:{}:{}", t, i);
                            store.set("bench", &key, "value");
                            store.get("bench", &key);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(store.len());
        });
    });

    group.finish();
}

/// Accepts and discards every transaction.
struct DiscardSink;

#[async_trait]
impl PersistenceSink for DiscardSink {
    async fn persist(&self, transaction: &Transaction) -> Result<(), SinkError> {
        black_box(transaction);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "discard"
    }
}

/// Benchmark journal enqueue with workers draining in the background
fn bench_enqueue(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let _enter = runtime.enter();

    let config = JournalConfig::default();
    let (queue, receiver) = TransactionQueue::new(&config);
    let _journal = JournalHandle::start(&config, receiver, Arc::new(DiscardSink));

    let peer: SocketAddr = "127.0.0.1:7000".parse().expect("valid address");
    let request = Request::new("ADD_USER").with("username", "alice");

    let mut group = c.benchmark_group("journal");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue", |b| {
        b.iter(|| {
            let tx = Transaction::new(SessionId(1), peer, request.clone());
            black_box(queue.enqueue(tx));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_resolve,
    bench_store,
    bench_concurrent,
    bench_enqueue,
);

criterion_main!(benches);
