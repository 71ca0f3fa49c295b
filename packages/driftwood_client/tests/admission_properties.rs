//! Property tests for admission budget invariants: inflight never exceeds
//! the limit, the queue only holds tasks while the budget is saturated, and
//! queued tasks start strictly in arrival order no matter how earlier tasks
//! settle.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tokio::sync::oneshot;

use driftwood_client::{AdmissionController, AdmissionLimits, Endpoint, TaskOperation};

#[derive(Debug, Clone)]
enum Action {
    Admit,
    Complete(usize),
    Cancel(usize),
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => Just(Action::Admit),
        2 => (0usize..32).prop_map(Action::Complete),
        1 => (0usize..32).prop_map(Action::Cancel),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build test runtime")
}

/// Let spawned task drivers observe completions and aborts.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn limits_with_folders(limit: usize) -> AdmissionLimits {
    AdmissionLimits {
        folders: limit,
        ..AdmissionLimits::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn budget_invariants_hold(
        limit in 1usize..=6,
        actions in prop::collection::vec(action_strategy(), 0..40),
    ) {
        runtime().block_on(async move {
            let controller = AdmissionController::new(limits_with_folders(limit));
            let mut releases: Vec<Option<oneshot::Sender<()>>> = Vec::new();
            let mut handles = Vec::new();

            for action in actions {
                match action {
                    Action::Admit => {
                        let (tx, rx) = oneshot::channel::<()>();
                        let ticket = controller.admit(Endpoint::Folders, move || {
                            Ok(TaskOperation::new(async move {
                                let _ = rx.await;
                                Ok(())
                            }))
                        });
                        handles.push(ticket.handle());
                        releases.push(Some(tx));
                    }
                    Action::Complete(index) if !releases.is_empty() => {
                        let index = index % releases.len();
                        if let Some(tx) = releases[index].take() {
                            let _ = tx.send(());
                        }
                    }
                    Action::Cancel(index) if !handles.is_empty() => {
                        let index = index % handles.len();
                        handles[index].cancel();
                    }
                    _ => {}
                }
                settle().await;

                let snapshot = controller.snapshot();
                let budget = snapshot.endpoint(Endpoint::Folders);
                assert!(budget.inflight <= limit);
                assert!(budget.peak_inflight <= limit);
                assert!(budget.queued == 0 || budget.inflight == limit);
            }

            controller.cancel_all(&Endpoint::ALL);
            let snapshot = controller.snapshot();
            let budget = snapshot.endpoint(Endpoint::Folders);
            assert_eq!(budget.inflight, 0);
            assert_eq!(budget.queued, 0);
        });
    }

    #[test]
    fn tasks_start_in_arrival_order(
        limit in 1usize..=3,
        count in 2usize..=10,
        seed in any::<u64>(),
    ) {
        runtime().block_on(async move {
            let controller = AdmissionController::new(limits_with_folders(limit));
            let started = Arc::new(Mutex::new(Vec::new()));

            let mut tasks = Vec::new();
            for tag in 0..count {
                let started = started.clone();
                let (tx, rx) = oneshot::channel::<()>();
                let ticket = controller.admit(Endpoint::Folders, move || {
                    started.lock().unwrap().push(tag);
                    Ok(TaskOperation::new(async move {
                        let _ = rx.await;
                        Ok(())
                    }))
                });
                tasks.push((tag, Some(tx), ticket));
            }

            // Complete started tasks in pseudo-random order; a queued task
            // cannot complete before it starts, so pick among started ones.
            let mut step = seed;
            while !tasks.is_empty() {
                let running: Vec<usize> = {
                    let started = started.lock().unwrap();
                    tasks
                        .iter()
                        .enumerate()
                        .filter(|(_, (tag, _, _))| started.contains(tag))
                        .map(|(index, _)| index)
                        .collect()
                };
                assert!(!running.is_empty());
                let pick = running[(step as usize) % running.len()];
                step = step
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);

                let (_, tx, ticket) = tasks.remove(pick);
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                assert!(ticket.outcome().await.is_ok());

                let snapshot = controller.snapshot();
                assert!(snapshot.endpoint(Endpoint::Folders).inflight <= limit);
            }

            assert_eq!(*started.lock().unwrap(), (0..count).collect::<Vec<_>>());
        });
    }
}
