//! Fork-join helpers over an explicit worker pool.
//!
//! Work is split into balanced halves until each range is at or below the
//! step's threshold, the halves run through `rayon::join`, and partial
//! results are combined with an associative merge. Without a pool, or when
//! the input is small, everything runs on the caller's thread.
//!
//! The open transaction of the calling thread is re-opened on every worker
//! for the duration of its chunk, so mutations made by tasks are recorded
//! in the same undo log.

use rayon::ThreadPool;

use crate::error::Result;
use crate::graph::Transaction;

/// True when a pool is available and the input exceeds the threshold.
#[inline]
pub fn should_parallelize(pool: Option<&ThreadPool>, size: usize, threshold: usize) -> bool {
    pool.is_some() && size > threshold
}

/// Apply `f` to every item, in parallel above `threshold`.
pub fn for_each<T, F>(
    pool: Option<&ThreadPool>,
    tx: Option<&Transaction>,
    items: &[T],
    threshold: usize,
    f: F,
) -> Result<()>
where
    T: Sync,
    F: Fn(&T) -> Result<()> + Sync,
{
    map_reduce(
        pool,
        tx,
        items,
        threshold,
        |chunk| chunk.iter().try_for_each(&f),
        |(), ()| (),
    )
}

/// Compute `f` over chunks of `items` and fold the partial results with `merge`.
///
/// `merge` must be associative; chunk order is preserved, so concatenating
/// merges keep the input order.
pub fn map_reduce<T, R, F, M>(
    pool: Option<&ThreadPool>,
    tx: Option<&Transaction>,
    items: &[T],
    threshold: usize,
    f: F,
    merge: M,
) -> Result<R>
where
    T: Sync,
    R: Send,
    F: Fn(&[T]) -> Result<R> + Sync,
    M: Fn(R, R) -> R + Sync,
{
    match pool {
        Some(pool) if items.len() > threshold => {
            let leaf = |chunk: &[T]| -> Result<R> {
                let _guard = tx.map(Transaction::open_in_current_thread).transpose()?;
                f(chunk)
            };
            pool.install(|| split(items, threshold.max(1), &leaf, &merge))
        }
        _ => f(items),
    }
}

fn split<T, R, F, M>(items: &[T], threshold: usize, f: &F, merge: &M) -> Result<R>
where
    T: Sync,
    R: Send,
    F: Fn(&[T]) -> Result<R> + Sync,
    M: Fn(R, R) -> R + Sync,
{
    if items.len() <= threshold {
        return f(items);
    }
    let mid = items.len() / 2;
    let (left, right) = rayon::join(
        || split(&items[..mid], threshold, f, merge),
        || split(&items[mid..], threshold, f, merge),
    );
    Ok(merge(left?, right?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap()
    }

    #[test]
    fn test_should_parallelize() {
        let pool = pool();
        assert!(!should_parallelize(None, 10, 1));
        assert!(!should_parallelize(Some(&pool), 10, 10));
        assert!(should_parallelize(Some(&pool), 11, 10));
    }

    #[test]
    fn test_map_reduce_sums_counts() {
        let pool = pool();
        let items: Vec<usize> = (1..=1000).collect();
        let total = map_reduce(
            Some(&pool),
            None,
            &items,
            7,
            |chunk| Ok(chunk.iter().sum::<usize>()),
            |a, b| a + b,
        )
        .unwrap();
        assert_eq!(total, 500_500);
    }

    #[test]
    fn test_map_reduce_preserves_order() {
        let pool = pool();
        let items: Vec<u32> = (0..100).collect();
        let collected = map_reduce(
            Some(&pool),
            None,
            &items,
            3,
            |chunk| Ok(chunk.to_vec()),
            |mut a, b| {
                a.extend(b);
                a
            },
        )
        .unwrap();
        assert_eq!(collected, items);
    }

    #[test]
    fn test_for_each_visits_everything_once() {
        let pool = pool();
        let items: Vec<u32> = (0..257).collect();
        let seen = AtomicUsize::new(0);
        for_each(Some(&pool), None, &items, 10, |_| {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 257);
    }

    #[test]
    fn test_errors_propagate_from_chunks() {
        let pool = pool();
        let items: Vec<u32> = (0..50).collect();
        let result = for_each(Some(&pool), None, &items, 4, |i| {
            if *i == 33 {
                Err(CoreError::invalid_argument("boom"))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }
}
