use std::hint::black_box;
use std::sync::Arc;

use atelier_sync::broadcast::Fanout;
use atelier_sync::client::{LocalMirror, Mutation, Origin, PendingQueue};
use atelier_sync::element::Element;
use atelier_sync::engine::SyncEngine;
use atelier_sync::protocol::{ClientMessage, ServerMessage};
use atelier_sync::session::{ClientMetadata, SessionId};
use atelier_sync::storage::{ElementStore, StoreConfig};
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::sync::mpsc;

fn sample_note(i: usize) -> Element {
    Element::note(format!("note-{i}"), "The quick brown fox jumps over the lazy dog", "bench")
        .with_position(i as f64, (i * 2) as f64)
}

fn bench_encode_update(c: &mut Criterion) {
    let message = ServerMessage::CanvasUpdate(sample_note(1));
    c.bench_function("encode_canvas_update", |b| {
        b.iter(|| black_box(black_box(&message).encode().unwrap()))
    });
}

fn bench_decode_update(c: &mut Criterion) {
    let text = ClientMessage::CanvasUpdate(sample_note(1)).encode().unwrap();
    c.bench_function("decode_canvas_update", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&text)).unwrap()))
    });
}

fn bench_fanout_100_sessions(c: &mut Criterion) {
    let mut fanout = Fanout::new(1024);
    let mut receivers: Vec<_> = (0..100).map(|_| fanout.attach(SessionId::new())).collect();
    let frame: Arc<str> = Arc::from(ServerMessage::CanvasUpdate(sample_note(1)).encode().unwrap());

    c.bench_function("fanout_broadcast_100_sessions", |b| {
        b.iter(|| {
            black_box(fanout.broadcast_except(None, Arc::clone(&frame)));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_engine_relay(c: &mut Criterion) {
    let mut engine = SyncEngine::in_memory();
    let meta = ClientMetadata::new("127.0.0.1:1".parse().unwrap(), "bench");
    let sender = engine.connect(&meta);
    let mut peers: Vec<_> = (0..10).map(|_| engine.connect(&meta).outbound).collect();
    let from = sender.session.id;
    let mut outbound = sender.outbound;
    let mut i = 0usize;

    c.bench_function("engine_upsert_relay_10_peers", |b| {
        b.iter(|| {
            i = (i + 1) % 1000;
            engine.handle(&from, ClientMessage::CanvasUpdate(sample_note(i)));
            for rx in peers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
            while outbound.try_recv().is_ok() {}
        })
    });
}

fn bench_mirror_local_apply(c: &mut Criterion) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut mirror = LocalMirror::new(tx);
    let mut i = 0usize;

    c.bench_function("mirror_local_apply", |b| {
        b.iter(|| {
            i = (i + 1) % 1000;
            mirror.apply(Mutation::Update(sample_note(i)), Origin::Local);
            while rx.try_recv().is_ok() {}
        })
    });
}

fn bench_queue_replay_1k(c: &mut Criterion) {
    c.bench_function("pending_queue_replay_1k", |b| {
        b.iter(|| {
            let mut queue = PendingQueue::default();
            for i in 0..1000 {
                queue.enqueue(ClientMessage::CanvasElementRemove(format!("n{i}")));
            }
            black_box(queue.drain());
        })
    });
}

fn bench_store_persist_one(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = ElementStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let mut i = 0usize;

    c.bench_function("store_persist_one", |b| {
        b.iter(|| {
            i = (i + 1) % 1000;
            store.persist_one(&sample_note(i)).unwrap();
        })
    });
}

fn bench_store_persist_batch_500(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = ElementStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let elements: Vec<Element> = (0..500).map(sample_note).collect();

    c.bench_function("store_persist_batch_500", |b| {
        b.iter(|| black_box(store.persist_batch(&elements).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_encode_update,
    bench_decode_update,
    bench_fanout_100_sessions,
    bench_engine_relay,
    bench_mirror_local_apply,
    bench_queue_replay_1k,
    bench_store_persist_one,
    bench_store_persist_batch_500,
);

criterion_main!(benches);
