//! Bounded concurrency runner.
//! At most `limit` workers are in flight; items are claimed in submission order
//! through a shared cursor. The first failure (or cancellation) stops further
//! claims, lets in-flight items finish, and is reported once all runners exit.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Why a run stopped early.
#[derive(Debug)]
pub enum RunError<E> {
    /// The cancellation token was signalled before all items were claimed.
    Cancelled,
    /// A worker returned an error. Only the first observed error is kept.
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for RunError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Cancelled => write!(f, "run cancelled"),
            RunError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RunError<E> {}

/// Run `worker` over `items` with at most `limit` concurrent invocations.
///
/// The effective pool size is `max(1, min(limit, items.len()))`. Cancellation is
/// cooperative: the token only stops new claims, so workers that must react
/// mid-item have to observe it themselves.
pub async fn run_with_concurrency<'a, T, E, F, Fut>(
    items: &'a [T],
    limit: usize,
    cancel: &CancellationToken,
    worker: F,
) -> Result<(), RunError<E>>
where
    F: Fn(&'a T, usize) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    if items.is_empty() {
        return Ok(());
    }

    let pool_size = limit.min(items.len()).max(1);
    let next_index = AtomicUsize::new(0);
    let stopped = AtomicBool::new(false);
    let first_error: Mutex<Option<RunError<E>>> = Mutex::new(None);

    let next_index = &next_index;
    let stopped = &stopped;
    let first_error = &first_error;
    let worker = &worker;

    let runner = move || async move {
        loop {
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            if cancel.is_cancelled() {
                stopped.store(true, Ordering::SeqCst);
                record_first(first_error, RunError::Cancelled);
                return;
            }
            let index = next_index.fetch_add(1, Ordering::SeqCst);
            if index >= items.len() {
                return;
            }
            if let Err(e) = worker(&items[index], index).await {
                stopped.store(true, Ordering::SeqCst);
                record_first(first_error, RunError::Failed(e));
                return;
            }
        }
    };

    join_all((0..pool_size).map(|_| runner())).await;

    let first = first_error.lock().take();
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn record_first<E>(slot: &Mutex<Option<RunError<E>>>, err: RunError<E>) {
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_input_runs_nothing() {
        let calls = AtomicUsize::new(0);
        let items: Vec<u32> = Vec::new();
        let result: Result<(), RunError<String>> =
            run_with_concurrency(&items, 4, &CancellationToken::new(), |_, _| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);
        let items: Vec<u64> = (0..12).collect();

        let result: Result<(), RunError<String>> =
            run_with_concurrency(&items, 3, &CancellationToken::new(), |item, _| {
                let in_flight = &in_flight;
                let peak = &peak;
                let done = &done;
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2 + item % 3)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(done.load(Ordering::SeqCst), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn limit_larger_than_items_is_clamped() {
        let items = vec![1, 2];
        let seen = Mutex::new(Vec::new());
        let result: Result<(), RunError<String>> =
            run_with_concurrency(&items, 64, &CancellationToken::new(), |item, index| {
                let seen = &seen;
                async move {
                    seen.lock().push((index, *item));
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        let mut seen = seen.into_inner();
        seen.sort();
        assert_eq!(seen, vec![(0, 1), (1, 2)]);
    }

    #[tokio::test]
    async fn first_error_stops_new_claims() {
        let claimed = AtomicUsize::new(0);
        let items: Vec<usize> = (0..20).collect();

        let result = run_with_concurrency(&items, 1, &CancellationToken::new(), |item, _| {
            let claimed = &claimed;
            async move {
                claimed.fetch_add(1, Ordering::SeqCst);
                if *item == 3 {
                    Err(format!("item {item} failed"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        match result {
            Err(RunError::Failed(msg)) => assert_eq!(msg, "item 3 failed"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(claimed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn in_flight_items_finish_after_failure() {
        let finished = AtomicUsize::new(0);
        let items: Vec<usize> = (0..3).collect();

        let result = run_with_concurrency(&items, 3, &CancellationToken::new(), |item, _| {
            let finished = &finished;
            async move {
                if *item == 0 {
                    // Let the other runners claim their items before failing.
                    tokio::task::yield_now().await;
                    return Err("boom".to_string());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(RunError::Failed(_))));
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_claims_and_reports_cancelled() {
        let cancel = CancellationToken::new();
        let claimed = AtomicUsize::new(0);
        let items: Vec<usize> = (0..10).collect();

        let result: Result<(), RunError<String>> =
            run_with_concurrency(&items, 1, &cancel, |item, _| {
                let claimed = &claimed;
                let cancel = &cancel;
                async move {
                    claimed.fetch_add(1, Ordering::SeqCst);
                    if *item == 1 {
                        cancel.cancel();
                    }
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(RunError::Cancelled)));
        assert_eq!(claimed.load(Ordering::SeqCst), 2);
    }
}
