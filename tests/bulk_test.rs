//! Integration tests for the bulk driver against the in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedSource, roomy_limit, run_to_completion, tiny_share};
use txbulk::backend::MemoryDomain;
use txbulk::{
    Budget, Bulk, BulkConfig, Credit, Error, Localities, Op, RuntimeLocalities,
    ThreadLocalities, WorkerState,
};

fn localities(nr: usize) -> Arc<dyn Localities> {
    Arc::new(RuntimeLocalities::current_with(nr).expect("runtime localities"))
}

fn captures_per_tx(domain: &MemoryDomain) -> Vec<u64> {
    let mut history = domain.history();
    history.sort_by_key(|r| r.id);
    history.iter().map(|r| r.captures).collect()
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_source_completes_without_transactions() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(0, tiny_share()));

    let (bulk, op) = run_to_completion(&domain, &source, 4, localities(2)).await;

    assert_eq!(op.signal_count(), 1);
    assert!(bulk.is_done());
    assert_eq!(bulk.status(), Ok(()));
    assert_eq!(bulk.done_nr(), 2);
    assert_eq!(domain.open_attempts(), 0);
    for w in bulk.workers() {
        assert_eq!(w.state, WorkerState::Finished);
        assert!(w.drained);
        assert_eq!(w.tx_nr, 0);
    }

    let report = bulk.fini().unwrap();
    assert!(report.is_success());
    assert_eq!(report.tx_nr, 0);
    assert_eq!(report.item_nr, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_item_two_workers_opens_one_transaction() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(1, tiny_share()));

    let (bulk, op) = run_to_completion(&domain, &source, 4, localities(2)).await;

    assert_eq!(op.signal_count(), 1);
    assert_eq!(bulk.status(), Ok(()));
    assert_eq!(domain.closed(), 1);
    assert_eq!(source.executed().len(), 1);

    let busy: Vec<_> = bulk.workers().into_iter().filter(|w| w.tx_nr > 0).collect();
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].item_nr, 1);
}

// ---------------------------------------------------------------------------
// Packing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cap_limits_items_per_transaction() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(10, tiny_share()));

    let (bulk, _op) = run_to_completion(&domain, &source, 3, localities(1)).await;

    assert_eq!(bulk.status(), Ok(()));
    assert_eq!(captures_per_tx(&domain), vec![3, 3, 3, 1]);
    assert_eq!(source.executed().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cap_limited_packing_across_two_workers() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(10, tiny_share()));

    let (bulk, _op) = run_to_completion(&domain, &source, 3, localities(2)).await;

    assert_eq!(bulk.status(), Ok(()));
    // However the ten items split between two workers, ceil(a/3) + ceil(b/3) == 4.
    assert_eq!(domain.closed(), 4);
    assert!(captures_per_tx(&domain).iter().all(|&c| (1..=3).contains(&c)));

    let report = bulk.fini().unwrap();
    assert_eq!(report.tx_nr, 4);
    assert_eq!(report.item_nr, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn budget_limits_items_per_transaction() {
    let share = Budget::new(Credit::new(1, 100), 10);
    let limit = Budget::new(Credit::new(2, 200), 20);
    let domain = Arc::new(MemoryDomain::new(limit));
    let source = Arc::new(ScriptedSource::new(9, share));

    let (bulk, _op) = run_to_completion(&domain, &source, 100, localities(1)).await;

    assert_eq!(bulk.status(), Ok(()));
    assert_eq!(captures_per_tx(&domain), vec![2, 2, 2, 2, 1]);
    for record in domain.history() {
        assert!(record.is_within_budget());
        assert_eq!(record.used, record.budget);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_limited_packing_across_workers() {
    let share = Budget::new(Credit::new(1, 100), 10);
    let limit = Budget::new(Credit::new(2, 200), 20);
    let domain = Arc::new(MemoryDomain::new(limit));
    let source = Arc::new(ScriptedSource::new(40, share));

    let (bulk, _op) = run_to_completion(&domain, &source, 100, localities(3)).await;

    assert_eq!(bulk.status(), Ok(()));
    let captures = captures_per_tx(&domain);
    assert!(captures.iter().all(|&c| c == 1 || c == 2));
    // Only a worker's last transaction can be short.
    assert!(captures.iter().filter(|&&c| c == 1).count() <= 3);
    assert_eq!(captures.iter().sum::<u64>(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_item_is_still_submitted_alone() {
    let share = Budget::new(Credit::new(5, 10), 1);
    let limit = Budget::new(Credit::new(4, 1000), 100);
    let domain = Arc::new(MemoryDomain::new(limit));
    let source = Arc::new(ScriptedSource::new(3, share));

    let (bulk, _op) = run_to_completion(&domain, &source, 8, localities(1)).await;

    // The driver opens it anyway; the backend refuses.
    assert_eq!(domain.open_attempts(), 1);
    assert!(matches!(bulk.status(), Err(Error::TxOpen { budget, .. }) if budget == share));
    assert!(source.executed().is_empty());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_failure_stops_the_bulk() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()).fail_open_at(2));
    let source = Arc::new(ScriptedSource::new(10, tiny_share()));

    let (bulk, op) = run_to_completion(&domain, &source, 1, localities(1)).await;

    assert_eq!(op.signal_count(), 1);
    match bulk.status() {
        Err(Error::TxOpen { reason, .. }) => assert!(reason.contains("open #2"), "{reason}"),
        other => panic!("expected TxOpen, got {other:?}"),
    }
    // One item per transaction: the second `next` fed the failed open, and
    // nothing was pulled after that.
    assert_eq!(source.next_calls(), 2);
    assert_eq!(source.next_after_stopping(), 0);
    assert_eq!(source.executed().len(), 1);
    assert_eq!(domain.closed(), 1);
    assert_eq!(bulk.done_nr(), bulk.worker_nr());

    let report = bulk.fini().unwrap();
    assert!(!report.is_success());
    assert!(report.workers.iter().all(|w| !w.drained));
}

// Current-thread runtime: workers only interleave at awaits, so a `next`
// call either starts before `stopping` is set or never starts at all.
#[tokio::test]
async fn open_failure_with_many_workers_drains_every_worker() {
    let domain = Arc::new(
        MemoryDomain::new(roomy_limit())
            .fail_open_at(2)
            .with_open_latency(Duration::from_millis(2)),
    );
    let source = Arc::new(ScriptedSource::new(1_000, tiny_share()));

    let (bulk, op) = run_to_completion(&domain, &source, 2, localities(4)).await;

    assert_eq!(op.signal_count(), 1);
    assert!(matches!(bulk.status(), Err(Error::TxOpen { .. })));
    assert!(bulk.is_stopping());
    assert_eq!(bulk.done_nr(), 4);
    assert!(bulk.workers().iter().all(|w| w.state == WorkerState::Finished));
    assert!(source.produced() < 1_000);
    assert_eq!(source.next_after_stopping(), 0);
    assert_eq!(domain.open_now(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_failure_flushes_packed_items() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(100, tiny_share()).fail_after(5));

    let (bulk, _op) = run_to_completion(&domain, &source, 3, localities(1)).await;

    assert!(matches!(bulk.status(), Err(Error::Source(_))));
    // 3 in the first transaction, the remaining 2 flushed after the error.
    assert_eq!(captures_per_tx(&domain), vec![3, 2]);
    let items: Vec<u64> = source.executed().iter().map(|e| e.item).collect();
    assert_eq!(items, vec![0, 1, 2, 3, 4]);
    assert_eq!(source.next_calls(), 6);
    assert_eq!(source.next_after_stopping(), 0);
}

#[tokio::test]
async fn source_failure_with_many_workers_executes_every_produced_item() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(100, tiny_share()).fail_after(5));

    let (bulk, _op) = run_to_completion(&domain, &source, 4, localities(3)).await;

    assert!(matches!(bulk.status(), Err(Error::Source(_))));
    let mut items: Vec<u64> = source.executed().iter().map(|e| e.item).collect();
    items.sort_unstable();
    assert_eq!(items, vec![0, 1, 2, 3, 4]);
    assert_eq!(source.next_after_stopping(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_in_execute_stops_the_bulk_and_closes_the_tx() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(10, tiny_share()).panic_in_execute_at(3));

    let (bulk, op) = run_to_completion(&domain, &source, 1, localities(2)).await;

    assert_eq!(op.signal_count(), 1);
    assert_eq!(bulk.done_nr(), 2);
    assert!(bulk.workers().iter().all(|w| w.state == WorkerState::Finished));
    match bulk.status() {
        Err(Error::Other(msg)) => {
            assert!(msg.contains("panicked"), "{msg}");
            assert!(msg.contains("item 3"), "{msg}");
        }
        other => panic!("expected a panic error, got {other:?}"),
    }
    // The transaction holding item 3 was still closed.
    assert_eq!(domain.open_now(), 0);
    assert_eq!(domain.closed() as u64, domain.open_attempts());
    assert!(source.executed().iter().all(|e| e.item != 3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_in_next_drops_packed_items_and_finishes() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(10, tiny_share()).panic_in_next_at(5));

    let (bulk, op) = run_to_completion(&domain, &source, 3, localities(1)).await;

    assert_eq!(op.signal_count(), 1);
    assert!(matches!(bulk.status(), Err(Error::Other(ref msg)) if msg.contains("panicked")));
    // [0, 1, 2] committed; 3 and 4 were packed when `next` panicked.
    assert_eq!(captures_per_tx(&domain), vec![3]);
    let items: Vec<u64> = source.executed().iter().map(|e| e.item).collect();
    assert_eq!(items, vec![0, 1, 2]);
    assert_eq!(domain.open_now(), 0);

    let report = bulk.fini().unwrap();
    assert!(!report.is_success());
    assert!(!report.workers[0].drained);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_error_wins() {
    // Source fails after 5 items; the flush of items 3 and 4 then hits an
    // open failure. The source error was first and must stick.
    let domain = Arc::new(MemoryDomain::new(roomy_limit()).fail_open_at(2));
    let source = Arc::new(ScriptedSource::new(100, tiny_share()).fail_after(5));

    let (bulk, _op) = run_to_completion(&domain, &source, 3, localities(1)).await;

    assert!(matches!(bulk.status(), Err(Error::Source(_))));
    assert_eq!(domain.open_attempts(), 2);
    assert_eq!(source.executed().len(), 3);
    // Asking again changes nothing.
    assert!(matches!(bulk.status(), Err(Error::Source(_))));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_and_fini_before_completion_are_rejected() {
    let domain =
        Arc::new(MemoryDomain::new(roomy_limit()).with_open_latency(Duration::from_millis(200)));
    let source = Arc::new(ScriptedSource::new(1, tiny_share()));
    let bulk = Bulk::init(
        BulkConfig::new(Arc::clone(&domain), Arc::clone(&source), 1),
        localities(1),
    )
    .unwrap();
    let op = Op::new();
    bulk.run(&op).unwrap();

    assert_eq!(bulk.status(), Err(Error::InProgress));
    assert!(matches!(Arc::clone(&bulk).fini(), Err(Error::InProgress)));
    assert_eq!(bulk.run(&Op::new()), Err(Error::AlreadyStarted));

    op.wait().await;
    assert_eq!(bulk.status(), Ok(()));
    assert!(bulk.fini().is_ok());
}

#[tokio::test]
async fn init_rejects_bad_configuration() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(1, tiny_share()));

    let zero_cap = Bulk::init(
        BulkConfig::new(Arc::clone(&domain), Arc::clone(&source), 0),
        localities(1),
    );
    assert!(matches!(zero_cap, Err(Error::Config(_))));

    let no_localities = Bulk::init(
        BulkConfig::new(Arc::clone(&domain), Arc::clone(&source), 1),
        localities(0),
    );
    assert!(matches!(no_localities, Err(Error::Config(_))));

    let zero_limit = Bulk::init(
        BulkConfig::new(Arc::new(MemoryDomain::new(Budget::ZERO)), source, 1),
        localities(1),
    );
    assert!(matches!(zero_limit, Err(Error::Config(_))));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transactions_are_pipelined_across_workers() {
    let domain = Arc::new(
        MemoryDomain::new(roomy_limit())
            .with_open_latency(Duration::from_millis(20))
            .with_close_latency(Duration::from_millis(5)),
    );
    let source = Arc::new(ScriptedSource::new(40, tiny_share()));

    let (bulk, _op) = run_to_completion(&domain, &source, 1, localities(4)).await;

    assert_eq!(bulk.status(), Ok(()));
    assert_eq!(domain.closed(), 40);
    assert!(domain.max_concurrent() > 1);
    assert!(domain.max_concurrent() <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn items_keep_production_order_within_a_worker() {
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(200, tiny_share()));

    let (bulk, _op) = run_to_completion(&domain, &source, 5, localities(3)).await;

    assert_eq!(bulk.status(), Ok(()));
    assert_eq!(source.produced_per_worker(), source.executed_per_worker());

    // A worker's transactions do not interleave.
    let mut last_tx = std::collections::HashMap::new();
    let mut seen = std::collections::HashSet::new();
    for exec in source.executed() {
        if last_tx.insert(exec.worker, exec.tx) != Some(exec.tx) {
            assert!(seen.insert(exec.tx), "tx {} resumed after a switch", exec.tx);
        }
    }
}

#[test]
fn thread_localities_execute_every_item_once() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let domain = Arc::new(MemoryDomain::new(roomy_limit()));
    let source = Arc::new(ScriptedSource::new(100, tiny_share()));
    let pool: Arc<dyn Localities> = Arc::new(ThreadLocalities::new(3).unwrap());

    let (bulk, op) = rt.block_on(run_to_completion(&domain, &source, 4, pool));

    assert_eq!(op.signal_count(), 1);
    assert_eq!(bulk.status(), Ok(()));
    let mut items: Vec<u64> = source.executed().iter().map(|e| e.item).collect();
    items.sort_unstable();
    assert_eq!(items, (0..100).collect::<Vec<_>>());
    assert!(domain.max_concurrent() <= 3);
}
