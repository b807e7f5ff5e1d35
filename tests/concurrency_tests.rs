mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use maat::prelude::*;
use rand::Rng;

use common::{ht, row, setup, txn_request, write_intents, writes};

#[test]
fn test_disjoint_write_sets_never_conflict() {
    // Every thread writes its own rows with the lowest priority and FAIL
    // policy, so any conflict reported would have to come from another thread.
    const THREADS: usize = 8;
    const ROUNDS: usize = 25;

    let runtime = Arc::new(tokio::runtime::Runtime::new().unwrap());
    let fixture = Arc::new(setup());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let runtime = Arc::clone(&runtime);
            let fixture = Arc::clone(&fixture);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut rng = rand::rng();
                for round in 0..ROUNDS {
                    let id = TransactionId::generate();
                    fixture.authority.register(id, 0);
                    let columns = rng.random_range(1..4u32);
                    let paths: Vec<DocPath> = (0..columns)
                        .map(|c| row(&format!("t{t}-r{round}")).with_subkey(c.to_be_bytes()))
                        .collect();
                    let write_set = writes(&paths);
                    let mut batch = fixture
                        .locks
                        .try_lock(Some(id), LockEntry::for_write_set(&write_set, false))
                        .expect("disjoint rows lock without waiting");

                    let result = fixture.resolver.resolve_transaction_conflicts_blocking(
                        runtime.handle(),
                        txn_request(
                            TransactionMetadata::new(id, 0),
                            ConflictManagementPolicy::FailOnConflict,
                            write_set,
                            ht(900),
                        ),
                        &mut batch,
                    );
                    assert_eq!(result.unwrap(), ht(1_000));

                    write_intents(&fixture.doc_db, id, &paths, ht(1_000));
                    drop(batch);
                    if round % 2 == 0 {
                        fixture.authority.commit(id, ht(1_000 + round as u64));
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("writer thread panicked");
    }
    assert_eq!(
        fixture.resolver.conflicts_metric().load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[test]
fn test_same_row_writers_see_each_other() {
    // Writers take turns on one row; each leaves its intents pending, so
    // every later writer must observe at least one conflict.
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let fixture = setup();
    let mut previous: Option<TransactionId> = None;

    for _ in 0..5 {
        let id = TransactionId::generate();
        fixture.authority.register(id, 1);
        let write_set = writes(&[row("hot")]);
        let mut batch = fixture
            .locks
            .try_lock(Some(id), LockEntry::for_write_set(&write_set, false))
            .unwrap();
        let result = fixture.resolver.resolve_transaction_conflicts_blocking(
            runtime.handle(),
            txn_request(
                TransactionMetadata::new(id, 1),
                ConflictManagementPolicy::SkipOnConflict,
                write_set,
                ht(900),
            ),
            &mut batch,
        );
        match previous {
            None => assert!(result.is_ok()),
            Some(prev) => {
                let err = result.unwrap_err();
                let detail = err.conflict_detail().expect("skip detail");
                assert!(detail.conflicts.iter().any(|c| c.transaction_id == prev));
            }
        }
        write_intents(&fixture.doc_db, id, &[row("hot")], ht(1_000));
        previous = Some(id);
    }
}
