//! Bounded-concurrency fan-out.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Apply `f` to every item with at most `concurrency` calls in flight.
///
/// Starts `min(concurrency, items.len())` workers; each repeatedly takes the
/// next unprocessed index until the list is exhausted. Results come back in
/// item order even though items finish in any order.
pub async fn run_bounded<'a, T, R, F, Fut>(items: &'a [T], concurrency: usize, f: F) -> Vec<R>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = R>,
{
    if items.is_empty() {
        return Vec::new();
    }

    let workers = concurrency.max(1).min(items.len());
    let next = AtomicUsize::new(0);
    let next = &next;
    let f = &f;

    let batches = join_all((0..workers).map(|_| async move {
        let mut done = Vec::new();
        loop {
            let index = next.fetch_add(1, Ordering::Relaxed);
            let Some(item) = items.get(index) else { break };
            done.push((index, f(item).await));
        }
        done
    }))
    .await;

    let mut results: Vec<(usize, R)> = batches.into_iter().flatten().collect();
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, r)| r).collect()
}
