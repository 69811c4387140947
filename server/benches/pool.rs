use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rask::manager::Manager;
use rask::pool::ObjectPool;

fn acquire_release_cycle(c: &mut Criterion) {
    let pool: ObjectPool<u64> = ObjectPool::new(256);
    c.bench_function("pool_acquire_release_cycle", |b| {
        b.iter(|| {
            let idx = pool.acquire().expect("pool never drained between iterations");
            pool.release(black_box(idx));
        })
    });
}

fn acquire_to_exhaustion(c: &mut Criterion) {
    c.bench_function("pool_acquire_to_exhaustion", |b| {
        b.iter(|| {
            let pool: ObjectPool<u64> = ObjectPool::new(256);
            let mut held = Vec::with_capacity(256);
            while let Some(idx) = pool.acquire() {
                held.push(idx);
            }
            black_box(&held);
            for idx in held {
                pool.release(idx);
            }
        })
    });
}

fn manager_acquire_release_cycle(c: &mut Criterion) {
    let manager = Manager::new(256);
    c.bench_function("manager_acquire_release_cycle", |b| {
        b.iter(|| {
            let handle = manager.acquire().expect("manager never drained between iterations");
            black_box(&handle);
        })
    });
}

fn manager_contended_acquire_release(c: &mut Criterion) {
    let manager = Manager::new(256);
    c.bench_function("manager_contended_acquire_release", |b| {
        b.iter(|| {
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    let manager = manager.clone();
                    scope.spawn(move || {
                        for _ in 0..64 {
                            if let Some(handle) = manager.acquire() {
                                black_box(&handle);
                            }
                        }
                    });
                }
            });
        })
    });
}

criterion_group!(benches, acquire_release_cycle, acquire_to_exhaustion, manager_acquire_release_cycle, manager_contended_acquire_release);
criterion_main!(benches);
