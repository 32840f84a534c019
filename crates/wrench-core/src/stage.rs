//! Composable pipeline stages.
//!
//! A [`Stage`] is a cheaply cloneable handle to an async, fallible function
//! `(CancellationToken, In) -> Result<Out, AppError>`. Stages own no resources
//! of their own; anything a stage needs (an HTTP client, a registry) is
//! captured by the closure it was built from.
//!
//! Composition always short-circuits: once a stage fails, nothing downstream
//! runs and the failure is returned unchanged.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::AppError;
use crate::parallel::par_map_result;
use crate::result::collect;

type StageFn<In, Out> =
    dyn Fn(CancellationToken, In) -> BoxFuture<'static, Result<Out, AppError>> + Send + Sync;

pub struct Stage<In, Out> {
    f: Arc<StageFn<In, Out>>,
}

impl<In, Out> Clone for Stage<In, Out> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, AppError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |cancel, input| f(cancel, input).boxed()),
        }
    }

    pub fn run(&self, cancel: CancellationToken, input: In) -> BoxFuture<'static, Result<Out, AppError>> {
        (self.f)(cancel, input)
    }

    /// Method form of [`then`].
    pub fn then<Next>(self, next: Stage<Out, Next>) -> Stage<In, Next>
    where
        Next: Send + 'static,
    {
        then(self, next)
    }
}

/// Runs `first`, then feeds its output to `second`. `second` never runs if
/// `first` fails.
pub fn then<A, B, C>(first: Stage<A, B>, second: Stage<B, C>) -> Stage<A, C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    Stage::new(move |cancel: CancellationToken, a: A| {
        let first = first.clone();
        let second = second.clone();
        async move {
            let b = first
                .run(cancel.clone(), a)
                .instrument(tracing::debug_span!("stage.first"))
                .await?;
            second
                .run(cancel, b)
                .instrument(tracing::debug_span!("stage.second"))
                .await
        }
    })
}

/// Composes same-typed stages left to right. No stages is the identity.
pub fn pipeline<T>(stages: Vec<Stage<T, T>>) -> Stage<T, T>
where
    T: Send + 'static,
{
    let stages: Arc<[Stage<T, T>]> = stages.into();
    Stage::new(move |cancel: CancellationToken, input: T| {
        let stages = Arc::clone(&stages);
        async move {
            let mut value = input;
            for stage in stages.iter() {
                value = stage.run(cancel.clone(), value).await?;
            }
            Ok(value)
        }
    })
}

/// Applies a single-item stage to a batch with at most `workers` items in
/// flight (`0` = all at once).
///
/// The batch fails as a whole if any item fails, reporting the failure with
/// the lowest input index.
pub fn batch<T, U>(workers: usize, stage: Stage<T, U>) -> Stage<Vec<T>, Vec<U>>
where
    T: Send + 'static,
    U: Send + 'static,
{
    Stage::new(move |cancel: CancellationToken, items: Vec<T>| {
        let stage = stage.clone();
        async move {
            let results = par_map_result(items, workers, move |item| {
                stage.run(cancel.clone(), item)
            })
            .await;
            collect(results)
        }
    })
}

/// Lifts a total function into a stage that always succeeds.
pub fn map<In, Out, F>(f: F) -> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Stage::new(move |_cancel: CancellationToken, input: In| {
        let out = f(input);
        async move { Ok(out) }
    })
}

/// Runs an observer on the value and passes it through unchanged.
pub fn tap<T, F>(f: F) -> Stage<T, T>
where
    T: Send + 'static,
    F: Fn(&CancellationToken, &T) + Send + Sync + 'static,
{
    Stage::new(move |cancel: CancellationToken, input: T| {
        f(&cancel, &input);
        async move { Ok(input) }
    })
}

/// Wraps a stage in a `tracing` span named after the stage.
///
/// On failure the error is recorded on the span (`error` field) and logged
/// inside it before being returned unchanged.
pub fn traced<In, Out>(name: &'static str, stage: Stage<In, Out>) -> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    Stage::new(move |cancel: CancellationToken, input: In| {
        let stage = stage.clone();
        let span = tracing::info_span!(
            "stage",
            stage = name,
            otel.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        async move {
            let result = stage.run(cancel, input).instrument(span.clone()).await;
            if let Err(e) = &result {
                span.record("otel.status_code", "ERROR");
                span.record("error", tracing::field::display(e));
                span.in_scope(|| tracing::warn!(stage = name, error = %e, "Stage failed"));
            }
            result
        }
    })
}
