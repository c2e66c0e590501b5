//! Bounded-concurrency executor.
//!
//! Runs one async job per input item with at most `limit` jobs in flight and
//! returns the outputs in input order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Run `job` over every item with at most `limit` jobs running at once.
///
/// A `limit` of zero is treated as one. A panicking job is re-raised on the
/// caller once it has been observed.
pub async fn run_bounded<I, F, Fut, T>(items: I, limit: usize, job: F) -> Vec<T>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    let mut total = 0usize;

    for (idx, item) in items.into_iter().enumerate() {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let fut = job(item);
        set.spawn(async move {
            let out = fut.await;
            drop(permit);
            (idx, out)
        });
        total += 1;
    }

    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, out)) => results[idx] = Some(out),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => warn!(error = %e, "bounded job did not complete"),
        }
    }

    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn results_keep_input_order() {
        let out = run_bounded(0..10u64, 3, |n| async move {
            // Later items finish first.
            tokio::time::sleep(Duration::from_millis(20 - n * 2)).await;
            n * 10
        })
        .await;
        assert_eq!(out, (0..10u64).map(|n| n * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = run_bounded(0..16, 4, |_| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(out.len(), 16);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn zero_limit_still_runs() {
        let out = run_bounded(vec!["a", "b"], 0, |s| async move { s.len() }).await;
        assert_eq!(out, vec![1, 1]);
    }
}
