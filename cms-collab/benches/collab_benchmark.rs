use cms_collab::operator::{fold, LogSource, Projection, SpliceToggleOperator};
use cms_collab::ops::{Operation, Transaction};
use cms_collab::protocol::{EntityId, MutationItem, MutationRequest, Version};
use cms_collab::queue::Queue;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::time::Duration;
use uuid::Uuid;

fn keystroke(i: usize) -> Transaction {
    Transaction::single("title", Operation::insert(i, vec![json!("x")]))
}

fn filled_queue(n: usize) -> Queue {
    let queue = Queue::new("doc", "fields", Duration::from_millis(500));
    for i in 0..n {
        let id = i.to_string();
        queue.push(Transaction::single("", Operation::insert(i, vec![json!({ "id": id })])));
        queue.push(Transaction::single(id.as_str(), Operation::toggle("label", i as u64)));
    }
    queue
}

// ─── Queue benchmarks ───────────────────────────────────────────

fn bench_push_1000(c: &mut Criterion) {
    c.bench_function("queue_push_1000", |b| {
        b.iter(|| {
            let queue = Queue::new("doc", "fields", Duration::from_millis(500));
            for i in 0..1000 {
                queue.push(keystroke(i));
            }
            black_box(queue.pending_len());
        })
    });
}

fn bench_push_mergeable_1000(c: &mut Criterion) {
    c.bench_function("queue_push_mergeable_1000", |b| {
        b.iter(|| {
            let queue = Queue::new("doc", "fields", Duration::from_secs(60));
            for i in 0..1000 {
                queue.push_mergeable(keystroke(i));
            }
            black_box(queue.pending_len());
        })
    });
}

// ─── Fold benchmarks ────────────────────────────────────────────

fn bench_fold_1000(c: &mut Criterion) {
    let queue = filled_queue(500);
    let base = json!([]);

    c.bench_function("fold_1000_ops", |b| {
        b.iter(|| black_box(fold(black_box(&base), &queue as &dyn LogSource)))
    });
}

fn bench_projection_refresh(c: &mut Criterion) {
    let queue = filled_queue(100);
    let projection = Projection::new(queue, SpliceToggleOperator::new(json!([])));

    c.bench_function("projection_refresh_200_ops", |b| {
        b.iter(|| {
            projection.refresh();
            black_box(projection.state());
        })
    });
}

// ─── Wire benchmarks ────────────────────────────────────────────

fn bench_request_encode(c: &mut Criterion) {
    let request = MutationRequest {
        document: EntityId::from("doc"),
        user: Uuid::new_v4(),
        items: vec![MutationItem {
            key: "fields".into(),
            base: Version::new(42, "abc", Uuid::new_v4()),
            transactions: (0..64).map(keystroke).collect(),
        }],
    };

    c.bench_function("request_encode_64_txns", |b| {
        b.iter(|| black_box(request.encode().unwrap()))
    });

    let encoded = request.encode().unwrap();
    c.bench_function("request_decode_64_txns", |b| {
        b.iter(|| black_box(MutationRequest::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_push_1000,
    bench_push_mergeable_1000,
    bench_fold_1000,
    bench_projection_refresh,
    bench_request_encode,
);
criterion_main!(benches);
