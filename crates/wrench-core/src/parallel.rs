//! Bounded parallel map and fan-out over tokio tasks.
//!
//! Every function here writes each task's output into a slot addressed by the
//! input's position, so the returned sequence always lines up with the input
//! no matter which task finished first.
//!
//! # Panics
//!
//! Task panics are not turned into errors. A panicking task is a defect in the
//! caller's code: the panic is re-raised on the calling task once it is
//! observed, and the remaining in-flight tasks are aborted.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::result::collect;

/// Applies `f` to every item with at most `workers` tasks running at once,
/// returning results in input order.
///
/// `workers == 0` means one task per item.
pub async fn par_map<T, U, F, Fut>(items: Vec<T>, workers: usize, f: F) -> Vec<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = U> + Send + 'static,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = if workers == 0 { items.len() } else { workers };

    let f = Arc::new(f);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut slots: Vec<Option<U>> = std::iter::repeat_with(|| None).take(items.len()).collect();
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        // Acquire before spawning so no more than `workers` tasks exist at once.
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            unreachable!("parallel map semaphore is never closed");
        };

        let f = Arc::clone(&f);
        tasks.spawn(async move {
            let value = f(item).await;
            drop(permit);
            (index, value)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (i, value) = unwrap_join(joined);
        slots[i] = Some(value);
    }

    slots
        .into_iter()
        .map(|slot| match slot {
            Some(v) => v,
            None => unreachable!("every index is filled once all tasks are joined"),
        })
        .collect()
}

/// [`par_map`] for fallible functions. Each slot holds its own `Result`; use
/// [`collect`] to fold them into a single outcome.
pub async fn par_map_result<T, U, E, F, Fut>(
    items: Vec<T>,
    workers: usize,
    f: F,
) -> Vec<Result<U, E>>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
{
    par_map(items, workers, f).await
}

/// Runs a fixed set of independent tasks concurrently and returns their
/// outputs in declaration order.
pub async fn fan_out<T>(tasks: Vec<BoxFuture<'static, T>>) -> Vec<T>
where
    T: Send + 'static,
{
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(tasks.len()).collect();
    let mut set = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        set.spawn(async move { (index, task.await) });
    }
    while let Some(joined) = set.join_next().await {
        let (i, value) = unwrap_join(joined);
        slots[i] = Some(value);
    }
    slots
        .into_iter()
        .map(|slot| match slot {
            Some(v) => v,
            None => unreachable!("every index is filled once all tasks are joined"),
        })
        .collect()
}

/// [`fan_out`] for fallible tasks: all values, or the first failure in
/// declaration order.
pub async fn fan_out_result<T, E>(tasks: Vec<BoxFuture<'static, Result<T, E>>>) -> Result<Vec<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    collect(fan_out(tasks).await)
}

pub(crate) fn unwrap_join<V>(joined: Result<V, JoinError>) -> V {
    match joined {
        Ok(v) => v,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => unreachable!("parallel tasks are never aborted while joined: {e}"),
    }
}
