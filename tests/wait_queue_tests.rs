mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use maat::prelude::*;
use maat::status::oracle::StatusOracle;
use maat::wait_queue::ResumeCallback;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use common::{ht, row, setup, setup_with_config, txn_request, wait_until, writes};

/// Callback recording every wake-up it receives.
fn recorder() -> (ResumeCallback, Arc<Mutex<Vec<WakeReason>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (Box::new(move |reason| sink.lock().push(reason)), seen)
}

#[test]
fn test_waiter_resumes_once_after_last_blocker() {
    let queue = WaitQueue::new(ResolverConfig::default());
    let (waiter, a, b) = (
        TransactionId::generate(),
        TransactionId::generate(),
        TransactionId::generate(),
    );
    let (callback, seen) = recorder();
    let registration = queue.enqueue(waiter, [a, b], callback);
    assert!(registration.queued);
    assert!(queue.is_waiting(waiter));

    assert_eq!(queue.signal_finished(a), 0);
    assert!(seen.lock().is_empty());
    assert_eq!(queue.signal_finished(b), 1);
    assert_eq!(*seen.lock(), vec![WakeReason::BlockersResolved]);

    // Later signals and cancels must not fire it again.
    queue.signal_finished(b);
    assert!(!queue.cancel(waiter));
    assert!(!queue.signal_deadlock(waiter));
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(queue.num_waiters(), 0);
}

#[test]
fn test_recently_finished_blockers_do_not_wait() {
    let queue = WaitQueue::new(ResolverConfig::default());
    let blocker = TransactionId::generate();
    queue.signal_finished(blocker);

    let (callback, seen) = recorder();
    let registration = queue.enqueue(TransactionId::generate(), [blocker], callback);
    assert!(!registration.queued);
    assert_eq!(*seen.lock(), vec![WakeReason::BlockersResolved]);
    assert_eq!(queue.num_waiters(), 0);
}

#[test]
fn test_finished_transactions_are_forgotten_after_retention() {
    let queue = WaitQueue::new(ResolverConfig {
        recently_finished_retention: Duration::from_millis(1),
        ..ResolverConfig::default()
    });
    for _ in 0..10_000 {
        queue.signal_finished(TransactionId::generate());
    }
    std::thread::sleep(Duration::from_millis(20));
    for _ in 0..10 {
        queue.signal_finished(TransactionId::generate());
    }
    assert!(queue.num_recently_finished() <= 10);
}

#[test]
fn test_observed_enqueue_keeps_blockers_finished_before_observation() {
    let queue = WaitQueue::new(ResolverConfig::default());
    let blocker = TransactionId::generate();
    queue.signal_finished(blocker);
    std::thread::sleep(Duration::from_millis(2));

    let (callback, seen) = recorder();
    let waiter = TransactionId::generate();
    let registration = queue.enqueue_observed(waiter, [blocker], Instant::now(), callback);
    assert!(registration.queued);
    assert!(seen.lock().is_empty());

    // A finish recorded after the observation still short-circuits.
    let late = TransactionId::generate();
    let observed_at = Instant::now();
    queue.signal_finished(late);
    let (callback, seen) = recorder();
    let registration = queue.enqueue_observed(TransactionId::generate(), [late], observed_at, callback);
    assert!(!registration.queued);
    assert_eq!(*seen.lock(), vec![WakeReason::BlockersResolved]);
    assert!(queue.cancel(waiter));
}

#[test]
fn test_cancel_drops_callback_without_firing() {
    let queue = WaitQueue::new(ResolverConfig::default());
    let (waiter, blocker) = (TransactionId::generate(), TransactionId::generate());
    let (callback, seen) = recorder();
    queue.enqueue(waiter, [blocker], callback);

    assert!(queue.cancel(waiter));
    assert!(!queue.cancel(waiter));
    assert_eq!(queue.signal_finished(blocker), 0);
    assert!(seen.lock().is_empty());
    assert!(queue.blocker_ids().is_empty());
}

#[test]
fn test_stale_registration_does_not_cancel_newer_wait() {
    let queue = WaitQueue::new(ResolverConfig::default());
    let waiter = TransactionId::generate();
    let (first, _) = recorder();
    let old = queue.enqueue(waiter, [TransactionId::generate()], first);
    let (second, seen) = recorder();
    let blocker = TransactionId::generate();
    queue.enqueue(waiter, [blocker], second);

    assert!(!queue.cancel_registration(&old));
    assert!(queue.is_waiting(waiter));
    queue.signal_finished(blocker);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_deadlock_signal_respects_config() {
    let queue = WaitQueue::new(ResolverConfig::default());
    let (waiter, blocker) = (TransactionId::generate(), TransactionId::generate());
    let (callback, seen) = recorder();
    queue.enqueue(waiter, [blocker], callback);
    assert_eq!(queue.wait_for_graph(), vec![(waiter, vec![blocker])]);
    assert!(queue.signal_deadlock(waiter));
    assert_eq!(*seen.lock(), vec![WakeReason::Deadlock]);

    let disabled = WaitQueue::new(ResolverConfig {
        enable_deadlock_detection: false,
        ..ResolverConfig::default()
    });
    let (callback, seen) = recorder();
    disabled.enqueue(waiter, [blocker], callback);
    assert!(!disabled.signal_deadlock(waiter));
    assert!(seen.lock().is_empty());
    assert!(disabled.is_waiting(waiter));
}

#[test]
fn test_concurrent_finish_and_cancel_fire_at_most_once() {
    for _ in 0..200 {
        let queue = WaitQueue::new(ResolverConfig::default());
        let (waiter, blocker) = (TransactionId::generate(), TransactionId::generate());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        queue.enqueue(
            waiter,
            [blocker],
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let q1 = Arc::clone(&queue);
        let q2 = Arc::clone(&queue);
        let finisher = std::thread::spawn(move || q1.signal_finished(blocker));
        let canceller = std::thread::spawn(move || q2.cancel(waiter));
        let resumed = finisher.join().unwrap();
        let cancelled = canceller.join().unwrap();

        assert!(fired.load(Ordering::SeqCst) <= 1);
        assert_eq!(fired.load(Ordering::SeqCst), resumed);
        assert!(resumed + usize::from(cancelled) == 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_on_conflict_resumes_after_blocker_aborts() {
    let fixture = setup();
    let a = fixture.pending_writer(&[row("1")], 50, ht(500));
    let b = TransactionMetadata::new(TransactionId::generate(), 10);
    let write_set = writes(&[row("1")]);
    let mut batch = fixture.lock(Some(b.transaction_id), &write_set).await;

    let resolver = Arc::clone(&fixture.resolver);
    let request = txn_request(b, ConflictManagementPolicy::WaitOnConflict, write_set, ht(900));
    let waiting = tokio::spawn(async move {
        let result = resolver.resolve_transaction_conflicts(request, &mut batch).await;
        (result, batch.is_locked())
    });

    let queue = Arc::clone(&fixture.queue);
    assert!(wait_until(|| queue.is_waiting(b.transaction_id)).await);
    // The batch is released while suspended.
    assert!(fixture.locks.is_empty());
    assert_eq!(queue.wait_for_graph(), vec![(b.transaction_id, vec![a])]);

    fixture.authority.abort(a);
    let (result, locked) = waiting.await.unwrap();
    assert_eq!(result.unwrap(), ht(1_000));
    assert!(locked);
    assert_eq!(fixture.queue.num_waiters(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spurious_wake_suspends_again_on_same_blocker() {
    let fixture = setup();
    let a = fixture.pending_writer(&[row("1")], 50, ht(500));
    let b = TransactionMetadata::new(TransactionId::generate(), 10);
    let write_set = writes(&[row("1")]);
    let mut batch = fixture.lock(Some(b.transaction_id), &write_set).await;

    let resolver = Arc::clone(&fixture.resolver);
    let request = txn_request(b, ConflictManagementPolicy::WaitOnConflict, write_set, ht(900));
    let waiting = tokio::spawn(async move {
        let result = resolver.resolve_transaction_conflicts(request, &mut batch).await;
        (result, batch.is_locked())
    });

    let queue = Arc::clone(&fixture.queue);
    assert!(wait_until(|| queue.is_waiting(b.transaction_id)).await);
    let first_round_trips = fixture.authority.status_request_count();

    // Wake the waiter although A is still pending.
    assert_eq!(queue.signal_finished(a), 1);
    let authority = Arc::clone(&fixture.authority);
    assert!(
        wait_until(|| {
            queue.is_waiting(b.transaction_id)
                && authority.status_request_count() > first_round_trips
        })
        .await
    );
    assert_eq!(queue.wait_for_graph(), vec![(b.transaction_id, vec![a])]);
    assert!(fixture.locks.is_empty());
    assert_eq!(fixture.resolver.conflicts_metric().load(Ordering::SeqCst), 2);

    fixture.authority.abort(a);
    let (result, locked) = waiting.await.unwrap();
    assert_eq!(result.unwrap(), ht(1_000));
    assert!(locked);
    assert_eq!(fixture.queue.num_waiters(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_on_conflict_rescans_after_blocker_commits() {
    let fixture = setup();
    let a = fixture.pending_writer(&[row("1")], 50, ht(500));
    let b = TransactionMetadata::new(TransactionId::generate(), 10);
    let write_set = writes(&[row("1")]);
    let mut batch = fixture.lock(Some(b.transaction_id), &write_set).await;

    let resolver = Arc::clone(&fixture.resolver);
    let request = txn_request(b, ConflictManagementPolicy::WaitOnConflict, write_set, ht(400));
    let waiting =
        tokio::spawn(async move { resolver.resolve_transaction_conflicts(request, &mut batch).await });

    let queue = Arc::clone(&fixture.queue);
    assert!(wait_until(|| queue.is_waiting(b.transaction_id)).await);
    fixture.authority.commit(a, ht(600));

    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, MaatError::Conflict(_)));
    assert_eq!(err.conflict_hybrid_time(), Some(ht(600)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_on_conflict_deadlock_victim() {
    let fixture = setup();
    fixture.pending_writer(&[row("1")], 50, ht(500));
    let b = TransactionMetadata::new(TransactionId::generate(), 10);
    let write_set = writes(&[row("1")]);
    let mut batch = fixture.lock(Some(b.transaction_id), &write_set).await;

    let resolver = Arc::clone(&fixture.resolver);
    let request = txn_request(b, ConflictManagementPolicy::WaitOnConflict, write_set, ht(900));
    let waiting =
        tokio::spawn(async move { resolver.resolve_transaction_conflicts(request, &mut batch).await });

    let queue = Arc::clone(&fixture.queue);
    assert!(wait_until(|| queue.is_waiting(b.transaction_id)).await);
    assert!(queue.signal_deadlock(b.transaction_id));

    match waiting.await.unwrap() {
        Err(MaatError::Deadlock(victim)) => assert_eq!(victim, b.transaction_id),
        other => panic!("expected deadlock, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_on_conflict_times_out_and_deregisters() {
    let fixture = setup();
    fixture.pending_writer(&[row("1")], 50, ht(500));
    let b = TransactionMetadata::new(TransactionId::generate(), 10);
    let write_set = writes(&[row("1")]);
    let mut batch = fixture.lock(Some(b.transaction_id), &write_set).await;
    let mut request = txn_request(b, ConflictManagementPolicy::WaitOnConflict, write_set, ht(900));
    request.deadline = Some(Instant::now() + Duration::from_millis(100));

    let result = fixture
        .resolver
        .resolve_transaction_conflicts(request, &mut batch)
        .await;
    assert!(matches!(result, Err(MaatError::TimedOut(_))));
    assert_eq!(fixture.queue.num_waiters(), 0);
    assert!(!batch.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_wait_deregisters() {
    let fixture = setup();
    fixture.pending_writer(&[row("1")], 50, ht(500));
    let b = TransactionMetadata::new(TransactionId::generate(), 10);
    let write_set = writes(&[row("1")]);
    let mut batch = fixture.lock(Some(b.transaction_id), &write_set).await;

    let resolver = Arc::clone(&fixture.resolver);
    let request = txn_request(b, ConflictManagementPolicy::WaitOnConflict, write_set, ht(900));
    let waiting =
        tokio::spawn(async move { resolver.resolve_transaction_conflicts(request, &mut batch).await });

    let queue = Arc::clone(&fixture.queue);
    assert!(wait_until(|| queue.is_waiting(b.transaction_id)).await);
    waiting.abort();
    let _ = waiting.await;
    assert!(wait_until(|| queue.num_waiters() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poller_wakes_waiters_the_authority_does_not_notify() {
    let config = ResolverConfig {
        wait_queue_poll_interval: Duration::from_millis(10),
        ..ResolverConfig::default()
    };
    // A second queue that is not attached to the authority.
    let fixture = setup_with_config(config.clone());
    let queue = WaitQueue::new(config);
    let oracle = StatusOracle::new(Arc::clone(&fixture.authority), 16);
    let poller = queue.spawn_poller(oracle);

    let blocker = TransactionId::generate();
    fixture.authority.register(blocker, 1);
    let (tx, rx) = oneshot::channel();
    queue.enqueue(
        TransactionId::generate(),
        [blocker],
        Box::new(move |reason| {
            let _ = tx.send(reason);
        }),
    );
    fixture.authority.abort(blocker);

    let reason = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("poller resumed the waiter")
        .unwrap();
    assert_eq!(reason, WakeReason::BlockersResolved);
    poller.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_authority_fails_waiters() {
    let config = ResolverConfig {
        wait_queue_poll_interval: Duration::from_millis(10),
        status_unreachable_timeout: Duration::from_millis(50),
        ..ResolverConfig::default()
    };
    let fixture = setup_with_config(config.clone());
    let a = fixture.pending_writer(&[row("1")], 50, ht(500));
    let b = TransactionMetadata::new(TransactionId::generate(), 10);
    let write_set = writes(&[row("1")]);
    let mut batch = fixture.lock(Some(b.transaction_id), &write_set).await;

    let resolver = Arc::clone(&fixture.resolver);
    let request = txn_request(b, ConflictManagementPolicy::WaitOnConflict, write_set, ht(900));
    let waiting =
        tokio::spawn(async move { resolver.resolve_transaction_conflicts(request, &mut batch).await });

    let queue = Arc::clone(&fixture.queue);
    assert!(wait_until(|| queue.is_waiting(b.transaction_id)).await);
    fixture.authority.set_unavailable(true);
    let poller = queue.spawn_poller(fixture.resolver.status_oracle().clone());

    let err = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("waiter resumed")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MaatError::StatusUnavailable(_)));
    assert!(err.is_retryable());
    assert!(matches!(
        fixture.authority.status(a),
        Some(TransactionStatus::Pending { .. })
    ));
    poller.abort();
}
