//! Helpers layered on top of the native [`Result`].
//!
//! `Ok`/`Err`, `map`, `and_then` and `unwrap_or` already behave the way the
//! rest of the crate needs: transforms run only on success and a failure is
//! propagated untouched. This module adds the few pieces the standard library
//! does not spell out.

/// Extra operations on `Result` used across the pipeline code.
pub trait ResultExt<T, E> {
    /// Returns the value, or panics with the error's display text.
    ///
    /// Reserved for call sites where success is structurally guaranteed or a
    /// failure is a programmer error. Never use it on an expected-failure path.
    fn must(self) -> T;

    /// Splits into `(value, error)`. On failure the value is `T::default()` and
    /// must not be inspected.
    fn into_parts(self) -> (T, Option<E>)
    where
        T: Default;
}

impl<T, E: std::fmt::Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn must(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("{e}"),
        }
    }

    fn into_parts(self) -> (T, Option<E>)
    where
        T: Default,
    {
        match self {
            Ok(v) => (v, None),
            Err(e) => (T::default(), Some(e)),
        }
    }
}

/// Builds a `Result` from a `(value, error)` pair. The error wins when present.
pub fn from_pair<T: Default, E>(value: Option<T>, error: Option<E>) -> Result<T, E> {
    match error {
        Some(e) => Err(e),
        None => Ok(value.unwrap_or_default()),
    }
}

/// Returns all values if every result succeeded, otherwise the failure with
/// the lowest index.
///
/// Order matters: callers that produced `results` concurrently still get the
/// first failure by input position, not the first one that happened.
pub fn collect<T, E>(results: Vec<Result<T, E>>) -> Result<Vec<T>, E> {
    let mut out = Vec::with_capacity(results.len());
    for r in results {
        out.push(r?);
    }
    Ok(out)
}
