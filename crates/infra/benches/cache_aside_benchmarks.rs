use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use courier_core::{ExternalId, LocaleSet, PlatformUser, StorageKey, UserChange};
use courier_infra::cache::{CacheRepository, InMemoryStore, StateKey, StatePart, UserKey};
use courier_infra::db::InMemoryDatabase;
use courier_infra::services::{UserService, UserServiceConfig};
use tokio::runtime::Runtime;

type Service = UserService<InMemoryDatabase, InMemoryStore>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime")
}

fn platform(id: i64) -> PlatformUser {
    PlatformUser {
        id: ExternalId::new(id),
        full_name: format!("user {}", id),
        language_code: Some("en".into()),
        is_bot: false,
    }
}

/// Service with `count` registered users, none of them cached.
fn seeded(rt: &Runtime, count: i64) -> (InMemoryStore, Service) {
    let store = InMemoryStore::new();
    let service = UserService::new(
        InMemoryDatabase::new(),
        CacheRepository::new(store.clone()),
        UserServiceConfig::default(),
    );
    let locales = LocaleSet::default();
    rt.block_on(async {
        for id in 1..=count {
            service.create(&platform(id), &locales).await.expect("create");
        }
    });
    (store, service)
}

fn bench_key_packing(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_packing");

    group.bench_function("user_key", |b| {
        let key = UserKey {
            external_id: ExternalId::new(1_234_567_890),
        };
        b.iter(|| black_box(&key).pack().expect("pack"))
    });

    group.bench_function("state_key", |b| {
        let key = StateKey::new(-100_123, 42, StatePart::Data)
            .with_bot(7)
            .with_destiny("survey");
        b.iter(|| black_box(&key).pack().expect("pack"))
    });

    group.finish();
}

fn bench_lookup_hit_vs_miss(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lookup");

    let (_, service) = seeded(&rt, 1);
    rt.block_on(service.by_external_id(ExternalId::new(1)))
        .expect("warm cache");
    group.bench_function("cache_hit", |b| {
        b.iter(|| rt.block_on(service.by_external_id(black_box(ExternalId::new(1)))))
    });

    group.bench_function("cache_miss", |b| {
        b.iter(|| {
            rt.block_on(async {
                service.cache().delete_user(ExternalId::new(1)).await.expect("evict");
                service.by_external_id(black_box(ExternalId::new(1))).await
            })
        })
    });

    group.finish();
}

fn bench_update_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("update");

    for users in [1_i64, 100] {
        let (_, service) = seeded(&rt, users);
        let mut dtos = rt.block_on(async {
            let mut dtos = Vec::new();
            for id in 1..=users {
                if let Some(user) = service.by_external_id(ExternalId::new(id)).await.expect("get") {
                    dtos.push(user);
                }
            }
            dtos
        });

        group.throughput(Throughput::Elements(users as u64));
        group.bench_with_input(BenchmarkId::new("rename", users), &users, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    for dto in dtos.iter_mut() {
                        service
                            .update(dto, [UserChange::Name("renamed".into())])
                            .await
                            .expect("update");
                    }
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_key_packing,
    bench_lookup_hit_vs_miss,
    bench_update_throughput
);
criterion_main!(benches);
