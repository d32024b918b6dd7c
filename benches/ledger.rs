//! Benchmarks for batch merge and slot claim throughput

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parkline::{
    BatchEntry, BatchId, GatewayId, Lot, LotId, MemoryRepository, ParkingService, Repository,
    SensorEvent, ServiceConfig, SlotId, SyncBatch, User, UserId,
};

const SLOTS: usize = 200;

fn service() -> ParkingService {
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let lot = Lot {
        id: LotId(1),
        name: "Bench".to_string(),
        location: "Lab".to_string(),
        gateway_id: GatewayId::from("gw-1"),
        slots: (0..SLOTS).map(|n| SlotId(format!("B-{:03}", n))).collect(),
    };
    let user = User {
        id: UserId(1),
        name: "bench".to_string(),
        email: "bench@example.com".to_string(),
        phone: None,
    };
    ParkingService::provision(repo.as_ref(), &[lot], &[user]).unwrap();
    ParkingService::open(repo, ServiceConfig::default()).unwrap()
}

fn batches(count: usize, per_batch: usize) -> Vec<SyncBatch> {
    (0..count)
        .map(|b| SyncBatch {
            gateway_id: GatewayId::from("gw-1"),
            batch_id: BatchId(format!("bench-{}", b)),
            entries: (0..per_batch)
                .map(|i| {
                    let n = (b * per_batch + i) % SLOTS;
                    let seq = (b * per_batch + i) as u64 + 1;
                    BatchEntry::Event(SensorEvent::new(
                        format!("B-{:03}", n),
                        seq % 3 == 0,
                        seq,
                        "gw-1",
                    ))
                })
                .collect(),
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    let input = batches(20, 50);
    group.throughput(Throughput::Elements(1000));

    group.bench_function("apply_20_batches_of_50", |b| {
        b.iter(|| {
            let svc = service();
            for batch in &input {
                black_box(svc.apply_batch(batch).unwrap());
            }
        })
    });

    group.finish();
}

fn bench_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim");
    group.throughput(Throughput::Elements(SLOTS as u64));

    group.bench_function("book_and_cancel_every_slot", |b| {
        let svc = service();
        b.iter(|| {
            for n in 0..SLOTS {
                let booking = svc
                    .create_booking(UserId(1), format!("B-{:03}", n), 2)
                    .unwrap();
                black_box(svc.cancel_booking(booking.id).unwrap());
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_merge, bench_claim);
criterion_main!(benches);
