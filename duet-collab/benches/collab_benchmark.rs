use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use duet_collab::awareness::{AwarenessStore, AwarenessUpdate, Presence};
use duet_collab::protocol::{decode_payload, encode_payload, SyncMessage};
use duet_collab::{LocalHub, Session, SessionConfig, TransportEvent};
use duet_core::{Attributes, Document, WireFormat};
use std::hint::black_box;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

fn sample_update() -> Vec<u8> {
    let mut doc = Document::new(Uuid::new_v4());
    doc.insert(0, "the quick brown fox", Attributes::new()).update.encode()
}

fn bench_message_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = sample_update();

    c.bench_function("update_message_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box("room"), black_box(peer), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let msg = SyncMessage::update("room", Uuid::new_v4(), sample_update());
    let encoded = msg.encode().unwrap();

    c.bench_function("update_message_decode", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let peers: Vec<Uuid> = (0..100).map(|_| Uuid::new_v4()).collect();
    let batch: Vec<AwarenessUpdate> = peers
        .iter()
        .map(|peer| AwarenessUpdate {
            peer: *peer,
            clock: 1,
            state: Some(Presence::for_peer("peer", *peer)),
        })
        .collect();
    let bytes = encode_payload(&batch).unwrap();

    let mut group = c.benchmark_group("Awareness");
    group.throughput(Throughput::Elements(batch.len() as u64));
    group.bench_function("decode_apply_100_peers", |b| {
        b.iter_batched(
            || AwarenessStore::new(Uuid::new_v4()),
            |mut store| {
                let now = Instant::now();
                let batch: Vec<AwarenessUpdate> = decode_payload(&bytes).unwrap();
                for update in &batch {
                    let _ = store.apply_remote(update, now);
                }
                black_box(store)
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

/// Local edit on one session, delivered to 10 live peers.
fn bench_session_fanout(c: &mut Criterion) {
    type Peer = (Session<duet_collab::LocalTransport>, mpsc::UnboundedReceiver<TransportEvent>);

    fn pump(peers: &mut [Peer]) {
        loop {
            let mut delivered = false;
            for (session, inbox) in peers.iter_mut() {
                while let Ok(event) = inbox.try_recv() {
                    session.handle_transport_event(event);
                    delivered = true;
                }
            }
            if !delivered {
                break;
            }
        }
    }

    let hub = LocalHub::new();
    let mut peers: Vec<Peer> = (0..11)
        .map(|_| {
            let config = SessionConfig::new("bench");
            let (transport, inbox) = hub.join("bench", config.peer);
            let mut session = Session::new(config, transport);
            session.connect().unwrap();
            (session, inbox)
        })
        .collect();
    pump(&mut peers);

    let mut group = c.benchmark_group("Session");
    group.throughput(Throughput::Elements(10));
    group.bench_function("insert_fanout_10_peers", |b| {
        b.iter(|| {
            let len = peers[0].0.document().len();
            black_box(peers[0].0.insert(len, "x", Attributes::new()).unwrap());
            pump(&mut peers);
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_awareness_apply,
    bench_session_fanout,
);
criterion_main!(benches);
