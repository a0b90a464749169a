use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::debug;

use crate::parallel::sanitize_max_jobs;

/// Inputs per worker below which extra workers stop paying for themselves.
const DEFAULT_MIN_AVERAGE_LOAD: usize = 2;

fn pool_size(input_count: usize, max_jobs: Option<usize>, min_average_load: usize) -> usize {
    let load_bound = input_count / min_average_load.max(1);
    2.max(load_bound.min(sanitize_max_jobs(max_jobs)))
}

/// Map a fallible function over `inputs` on a bounded worker pool, yielding
/// results as an iterator.
///
/// When a `cost` estimator is supplied, inputs are pre-sorted by descending
/// estimated cost so the longest poles start first and spread across worker
/// slots (a greedy balance, not optimal bin-packing). Results are reported in
/// the order the (possibly re-sorted) inputs ran.
pub fn iter_map_parallel<I, T, F>(
    mut inputs: Vec<I>,
    function: F,
    max_jobs: Option<usize>,
    cost: Option<&dyn Fn(&I) -> u64>,
    noun: &str,
) -> Result<impl Iterator<Item = T>>
where
    I: Send,
    T: Send,
    F: Fn(I) -> Result<T> + Send + Sync,
{
    if let Some(cost) = cost {
        inputs.sort_by_key(|input| std::cmp::Reverse(cost(input)));
    }
    let input_count = inputs.len();
    if input_count <= 1 {
        let started = Instant::now();
        let results = inputs.into_iter().map(function).collect::<Result<Vec<T>>>()?;
        debug!(
            "processed {input_count} {noun} serially in {:?}",
            started.elapsed()
        );
        return Ok(results.into_iter());
    }

    let workers = pool_size(input_count, max_jobs, DEFAULT_MIN_AVERAGE_LOAD);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("failed to build worker pool")?;
    let started = Instant::now();
    let results = pool.install(|| {
        inputs
            .into_par_iter()
            .map(|input| {
                let item_started = Instant::now();
                let result = function(input);
                debug!(
                    worker = rayon::current_thread_index().unwrap_or(0),
                    "processed 1 {noun} in {:?}",
                    item_started.elapsed()
                );
                result
            })
            .collect::<Result<Vec<T>>>()
    })?;
    debug!(
        "processed {input_count} {noun} with {workers} workers in {:?}",
        started.elapsed()
    );
    Ok(results.into_iter())
}

/// [`iter_map_parallel`], collected.
pub fn map_parallel<I, T, F>(
    inputs: Vec<I>,
    function: F,
    max_jobs: Option<usize>,
    noun: &str,
) -> Result<Vec<T>>
where
    I: Send,
    T: Send,
    F: Fn(I) -> Result<T> + Send + Sync,
{
    Ok(iter_map_parallel(inputs, function, max_jobs, None, noun)?.collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_all_inputs() -> Result<()> {
        let doubled = map_parallel(vec![1u64, 2, 3, 4, 5], |n| Ok(n * 2), Some(4), "numbers")?;
        assert_eq!(doubled, vec![2, 4, 6, 8, 10]);
        Ok(())
    }

    #[test]
    fn first_error_fails_the_map() {
        let result = map_parallel(
            vec![1u64, 2, 3],
            |n| {
                if n == 2 {
                    anyhow::bail!("bad input {n}")
                } else {
                    Ok(n)
                }
            },
            Some(2),
            "numbers",
        );
        assert!(result.is_err());
    }

    #[test]
    fn cost_sorting_runs_long_poles_first() -> Result<()> {
        let order: Vec<u64> = iter_map_parallel(
            vec![1u64, 50, 3, 20],
            Ok,
            Some(1),
            Some(&|n: &u64| *n),
            "weights",
        )?
        .collect();
        assert_eq!(order, vec![50, 20, 3, 1]);
        Ok(())
    }

    #[test]
    fn pool_size_floors_at_two_and_respects_load() {
        // Too few inputs for the requested budget: the load bound wins.
        assert_eq!(pool_size(1, Some(16), 2), 2);
        assert_eq!(pool_size(5, Some(16), 2), 2);
        // Plenty of inputs: the sanitized job budget wins.
        let cap = sanitize_max_jobs(Some(4));
        assert_eq!(pool_size(100, Some(4), 2), 2.max(cap));
    }

    #[test]
    fn single_input_runs_serially() -> Result<()> {
        let results: Vec<u64> = iter_map_parallel(vec![7u64], Ok, None, None, "numbers")?.collect();
        assert_eq!(results, vec![7]);
        Ok(())
    }
}
