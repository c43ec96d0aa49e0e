use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use coinvault_core::AccountId;
use coinvault_infra::{AccountStore, CachedFileStore};
use coinvault_ledger::{Ledger, LedgerConfig};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn file_ledger(rt: &tokio::runtime::Runtime, dir: &tempfile::TempDir) -> Ledger {
    rt.block_on(async {
        let store = Arc::new(CachedFileStore::new(dir.path(), Duration::from_secs(3600)));
        store.initialize().await.unwrap();
        Ledger::with_store(store, LedgerConfig::default())
    })
}

/// N tasks incrementing the same account: every add queues on one lock.
fn bench_contended_add(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let ledger = file_ledger(&rt, &dir);
    let hot = AccountId::new();

    let mut group = c.benchmark_group("contended_add");
    for tasks in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                rt.block_on(async {
                    let handles: Vec<_> = (0..tasks)
                        .map(|_| {
                            let ledger = ledger.clone();
                            tokio::spawn(async move { ledger.add_balance(hot, 1).await })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                })
            });
        });
    }
    group.finish();
}

/// Same task count spread over distinct accounts, for comparison.
fn bench_uncontended_add(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let ledger = file_ledger(&rt, &dir);
    let accounts: Vec<AccountId> = (0..64).map(|_| AccountId::new()).collect();

    let mut group = c.benchmark_group("uncontended_add");
    group.throughput(Throughput::Elements(accounts.len() as u64));
    group.bench_function("64_accounts", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handles: Vec<_> = accounts
                    .iter()
                    .map(|id| {
                        let (ledger, id) = (ledger.clone(), *id);
                        tokio::spawn(async move { ledger.add_balance(id, 1).await })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap().unwrap();
                }
            })
        });
    });
    group.finish();
}

criterion_group!(benches, bench_contended_add, bench_uncontended_add);
criterion_main!(benches);
