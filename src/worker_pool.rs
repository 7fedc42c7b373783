//! Bounded scoped worker pool
//!
//! Jobs are fed through a crossbeam channel to at most `workers` scoped
//! threads; results come back over a second channel and are returned in input
//! order, so callers observe the same output regardless of scheduling.

use anyhow::{anyhow, Result};
use crossbeam::channel;

/// Run `job` over every item on at most `workers` threads
///
/// # Errors
///
/// Returns an error if a worker thread panicked.
pub(crate) fn run_bounded<T, R, F>(workers: usize, items: Vec<T>, job: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, total);

    let (work_tx, work_rx) = channel::unbounded::<(usize, T)>();
    let (result_tx, result_rx) = channel::unbounded::<(usize, R)>();
    for item in items.into_iter().enumerate() {
        // The receiver is alive until the scope below ends
        let _ = work_tx.send(item);
    }
    drop(work_tx);

    let job = &job;
    crossbeam::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move |_| {
                for (index, item) in work_rx.iter() {
                    let _ = result_tx.send((index, job(item)));
                }
            });
        }
    })
    .map_err(|_| anyhow!("worker thread panicked"))?;
    drop(result_tx);

    let mut results: Vec<(usize, R)> = result_rx.iter().collect();
    if results.len() != total {
        return Err(anyhow!(
            "worker pool returned {} results for {} jobs",
            results.len(),
            total
        ));
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, result)| result).collect())
}
