//! Generic combinators over borrowed slices.
//!
//! All of these are pure and allocate a fresh output.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

pub fn map<T, U>(items: &[T], f: impl FnMut(&T) -> U) -> Vec<U> {
    items.iter().map(f).collect()
}

pub fn filter<T: Clone>(items: &[T], mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
    items.iter().filter(|v| pred(v)).cloned().collect()
}

/// Applies `f` and keeps the `Some` results.
pub fn filter_map<T, U>(items: &[T], f: impl FnMut(&T) -> Option<U>) -> Vec<U> {
    items.iter().filter_map(f).collect()
}

pub fn reduce<T, Acc>(items: &[T], init: Acc, f: impl FnMut(Acc, &T) -> Acc) -> Acc {
    items.iter().fold(init, f)
}

/// Groups items by key. Groups appear in order of each key's first
/// occurrence, and items keep their relative order within a group.
pub fn group_by<T: Clone, K: Clone + Eq + Hash>(
    items: &[T],
    mut key: impl FnMut(&T) -> K,
) -> Vec<(K, Vec<T>)> {
    let mut slots: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<(K, Vec<T>)> = Vec::new();
    for v in items {
        let k = key(v);
        match slots.get(&k) {
            Some(&slot) => out[slot].1.push(v.clone()),
            None => {
                slots.insert(k.clone(), out.len());
                out.push((k, vec![v.clone()]));
            }
        }
    }
    out
}

/// Splits items into chunks of `n`; the last chunk may be shorter.
/// Returns no chunks when `n == 0`.
pub fn chunk<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    if n == 0 {
        return Vec::new();
    }
    items.chunks(n).map(<[T]>::to_vec).collect()
}

/// Unique elements, first occurrence wins.
pub fn unique<T: Clone + Eq + Hash>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|v| seen.insert((*v).clone()))
        .cloned()
        .collect()
}

/// Elements with unique keys, first occurrence wins.
pub fn unique_by<T: Clone, K: Eq + Hash>(items: &[T], mut key: impl FnMut(&T) -> K) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|v| seen.insert(key(v)))
        .cloned()
        .collect()
}

pub fn flat_map<T, U>(items: &[T], mut f: impl FnMut(&T) -> Vec<U>) -> Vec<U> {
    items.iter().flat_map(|v| f(v)).collect()
}
