//! Transactional memory: atomic commits, retry wake-ups, alternatives and
//! rollback.

#[macro_use]
mod common;

use common::*;
use effectum::{Effect, Exit, Stm, TRef};
use proptest::prelude::*;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn transfer(from: &TRef<i64>, to: &TRef<i64>, amount: i64) -> Stm<bool> {
    let (from, to) = (from.clone(), to.clone());
    let debit = from.get().flat_map(move |balance| {
        let from = from.clone();
        let to = to.clone();
        Stm::check(balance >= amount)
            .and_then(from.set(balance - amount))
            .and_then(to.update(move |b| b + amount))
            .map(|()| true)
    });
    debit.or_else(Stm::succeed(false))
}

#[test]
fn commit_publishes_all_writes() {
    init_test_logging();
    test_phase!("commit_publishes_all_writes");
    let runtime = test_runtime_single();
    let a = TRef::new(100_i64);
    let b = TRef::new(0_i64);

    let moved = runtime
        .run_sync(transfer(&a, &b, 30).commit())
        .expect("transfer succeeds");

    assert!(moved);
    assert_eq!((a.load(), b.load()), (70, 30));
    test_complete!("commit_publishes_all_writes");
}

#[test]
fn typed_failure_publishes_nothing() {
    init_test_logging();
    test_phase!("typed_failure_publishes_nothing");
    let runtime = test_runtime_single();
    let cell = TRef::new(1_u32);

    let stm = cell
        .set(50)
        .widen::<String>()
        .and_then(Stm::<(), String>::fail("abort".to_string()));
    let exit = runtime.run_sync_exit(stm.commit());

    assert_exit_failure!(exit, "abort".to_string());
    assert_eq!(cell.load(), 1);
    test_complete!("typed_failure_publishes_nothing");
}

#[test]
fn defect_in_transaction_dies_without_writes() {
    init_test_logging();
    test_phase!("defect_in_transaction_dies_without_writes");
    let runtime = test_runtime_single();
    let cell = TRef::new(1_u32);

    let stm = cell.set(2).and_then(cell.modify(|_| -> ((), u32) {
        panic!("invariant broken");
    }));
    let exit = runtime.run_sync_exit(stm.commit());

    assert_exit_die!(exit);
    assert_eq!(cell.load(), 1);
    test_complete!("defect_in_transaction_dies_without_writes");
}

#[test]
fn catch_all_rolls_back_the_failed_branch() {
    init_test_logging();
    test_phase!("catch_all_rolls_back_the_failed_branch");
    let runtime = test_runtime_single();
    let cell = TRef::new(0_u32);
    let audit = TRef::new(Vec::<String>::new());

    let failing = cell
        .set(9)
        .widen::<String>()
        .and_then(Stm::<(), String>::fail("nope".to_string()));
    let recovered = {
        let audit = audit.clone();
        failing.catch_all(move |reason: String| {
            audit.update(move |mut log| {
                log.push(reason.clone());
                log
            })
        })
    };
    runtime.run_sync(recovered.commit()).expect("recovered");

    assert_eq!(cell.load(), 0, "write of the failed branch discarded");
    assert_eq!(audit.load(), vec!["nope".to_string()]);
    test_complete!("catch_all_rolls_back_the_failed_branch");
}

#[test]
fn or_else_takes_the_alternative_on_retry() {
    init_test_logging();
    test_phase!("or_else_takes_the_alternative_on_retry");
    let runtime = test_runtime_single();
    let primary = TRef::new(None::<u32>);
    let fallback = TRef::new(7_u32);

    let take_primary = primary.get().flat_map(|value| match value {
        Some(v) => Stm::succeed(v),
        None => Stm::retry(),
    });
    let value = runtime
        .run_sync(take_primary.or_else(fallback.get()).commit())
        .expect("alternative succeeds");

    assert_eq!(value, 7);
    test_complete!("or_else_takes_the_alternative_on_retry");
}

#[test]
fn retry_wakes_when_a_read_cell_changes() {
    init_test_logging();
    test_phase!("retry_wakes_when_a_read_cell_changes");
    let runtime = test_runtime();
    let gate = TRef::new(false);

    let wait_open = {
        let gate = gate.clone();
        gate.get().flat_map(Stm::check).commit()
    };
    let waiter = runtime.run_fork(wait_open.as_("passed"));
    std::thread::sleep(Duration::from_millis(10));
    assert!(waiter.try_exit().is_none(), "blocked while the gate is shut");

    let opened = runtime.run_fork(gate.set(true).commit()).wait();
    assert!(opened.is_success());

    let exit = waiter.wait();
    assert_exit_success!(exit, "passed");
    test_complete!("retry_wakes_when_a_read_cell_changes");
}

#[test]
fn retry_ignores_unrelated_cells() {
    init_test_logging();
    test_phase!("retry_ignores_unrelated_cells");
    let runtime = test_runtime();
    let gate = TRef::new(0_u32);
    let unrelated = TRef::new(0_u32);
    let attempts = Arc::new(AtomicUsize::new(0));

    let counted = Arc::clone(&attempts);
    let watched = gate.clone();
    let wait_positive = Stm::suspend(move || {
        counted.fetch_add(1, Ordering::SeqCst);
        watched.get().flat_map(|v| Stm::check(v > 0))
    });
    let waiter = runtime.run_fork(wait_positive.commit());
    std::thread::sleep(Duration::from_millis(10));
    let first_attempts = attempts.load(Ordering::SeqCst);

    for n in 1..=5 {
        assert!(runtime.run_fork(unrelated.set(n).commit()).wait().is_success());
    }
    std::thread::sleep(Duration::from_millis(10));
    assert_with_log!(
        attempts.load(Ordering::SeqCst) == first_attempts,
        "no rerun for writes to cells never read",
        first_attempts,
        attempts.load(Ordering::SeqCst)
    );

    assert!(runtime.run_fork(gate.set(1).commit()).wait().is_success());
    assert!(waiter.wait().is_success());
    test_complete!("retry_ignores_unrelated_cells");
}

#[test]
fn interrupting_a_retrying_fiber() {
    init_test_logging();
    test_phase!("interrupting_a_retrying_fiber");
    let runtime = test_runtime();
    let cell = TRef::new(0_u32);

    let blocked = cell.get().flat_map(|v| Stm::check(v == 42)).commit();
    let fiber = runtime.run_fork(blocked);
    std::thread::sleep(Duration::from_millis(10));
    assert_exit_interrupted!(fiber.interrupt());

    let after = runtime.run_fork(cell.set(42).commit()).wait();
    assert_eq!(after, Exit::Success(()));
    test_complete!("interrupting_a_retrying_fiber");
}

#[test]
fn concurrent_increments_are_not_lost() {
    init_test_logging();
    test_phase!("concurrent_increments_are_not_lost");
    let runtime = test_runtime();
    let counter = TRef::new(0_u64);

    let bump = counter.update(|n| n + 1).commit().repeat_n(1_000);
    let program = bump.clone().zip_par(bump);
    let exit = runtime.run_fork(program).wait();

    assert!(exit.is_success());
    assert_with_log!(counter.load() == 2_000, "every increment counted", 2_000, counter.load());
    test_complete!("concurrent_increments_are_not_lost");
}

#[test]
fn disjoint_transactions_never_rerun() {
    init_test_logging();
    test_phase!("disjoint_transactions_never_rerun");
    let runtime = test_runtime();
    let left = TRef::new(0_u64);
    let right = TRef::new(0_u64);
    let attempts = Arc::new(AtomicUsize::new(0));

    let counted = |cell: &TRef<u64>| {
        let cell = cell.clone();
        let attempts = Arc::clone(&attempts);
        Stm::suspend(move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            cell.update(|n| n + 1)
        })
        .commit()
        .repeat_n(500)
    };
    let program = counted(&left).zip_par(counted(&right));
    assert!(runtime.run_fork(program).wait().is_success());

    assert_eq!((left.load(), right.load()), (500, 500));
    let attempts = attempts.load(Ordering::SeqCst);
    assert_with_log!(attempts == 1_000, "one attempt per commit", 1_000, attempts);
    test_complete!("disjoint_transactions_never_rerun");
}

#[test]
fn concurrent_transfers_preserve_the_total() {
    init_test_logging();
    test_phase!("concurrent_transfers_preserve_the_total");
    let runtime = test_runtime();
    let accounts: Vec<TRef<i64>> = (0..4).map(|_| TRef::new(250)).collect();

    let workers: Vec<Effect<(), Infallible>> = (0..4)
        .map(|w| {
            let accounts = accounts.clone();
            Effect::for_each(0..200_usize, move |i| {
                let from = &accounts[(w + i) % 4];
                let to = &accounts[(w + i + 1) % 4];
                transfer(from, to, (i % 7) as i64 + 1).commit()
            })
            .as_unit()
        })
        .collect();
    let exit = runtime.run_fork(Effect::all_par(workers)).wait();

    assert!(exit.is_success());
    let total: i64 = accounts.iter().map(TRef::load).sum();
    assert_eq!(total, 1_000);
    assert!(accounts.iter().all(|a| a.load() >= 0));
    test_complete!("concurrent_transfers_preserve_the_total");
}

proptest! {
    #![proptest_config(test_proptest_config(64))]

    #[test]
    fn transfers_never_create_or_destroy_money(
        start in prop::collection::vec(0_i64..500, 2..5),
        moves in prop::collection::vec((0_usize..5, 0_usize..5, 1_i64..200), 0..30),
    ) {
        init_test_logging();
        let runtime = test_runtime_single();
        let accounts: Vec<TRef<i64>> = start.iter().copied().map(TRef::new).collect();
        let n = accounts.len();

        for (from, to, amount) in moves {
            runtime
                .run_sync(transfer(&accounts[from % n], &accounts[to % n], amount).commit())
                .expect("transfer settles");
        }

        let total: i64 = accounts.iter().map(TRef::load).sum();
        prop_assert_eq!(total, start.iter().sum::<i64>());
        prop_assert!(accounts.iter().all(|a| a.load() >= 0));
    }
}
